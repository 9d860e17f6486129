//! Capacity-bounded admission control.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::registry::{Session, SessionError, SessionRegistry};

/// How the session ceiling is enforced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Check the count, then create. Concurrent admissions may overshoot the
    /// ceiling by at most the number racing at once.
    #[default]
    Advisory,
    /// Check and insert under one registry lock. Never overshoots.
    Exact,
}

/// Gate consulted before a new session is created.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    registry: Arc<SessionRegistry>,
    capacity: usize,
    policy: AdmissionPolicy,
}

impl AdmissionController {
    pub fn new(registry: Arc<SessionRegistry>, capacity: usize, policy: AdmissionPolicy) -> Self {
        Self {
            registry,
            capacity,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Allows creation iff the current session count is below capacity.
    pub fn admit(&self) -> Result<(), SessionError> {
        let active = self.registry.len();
        if active < self.capacity {
            Ok(())
        } else {
            tracing::warn!(
                active_sessions = active,
                max_sessions = self.capacity,
                "Admission denied: at capacity"
            );
            Err(SessionError::CapacityExceeded {
                active,
                capacity: self.capacity,
            })
        }
    }

    /// Admits and allocates a session according to the configured policy.
    pub fn admit_session(&self) -> Result<Session, SessionError> {
        match self.policy {
            AdmissionPolicy::Advisory => {
                self.admit()?;
                Ok(self.registry.new_session())
            }
            AdmissionPolicy::Exact => self.registry.try_new_session(self.capacity).inspect_err(|_| {
                tracing::warn!(max_sessions = self.capacity, "Admission denied: at capacity");
            }),
        }
    }
}
