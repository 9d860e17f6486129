//! Concurrent session registry.
//!
//! The registry is the sole owner of session records. Callers only ever
//! receive copies; every mutation goes through a registry method and is
//! applied as one indivisible update under the map lock. The lock is never
//! held across an await point or an I/O call.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use uuid::Uuid;

use crate::bridge::ChannelError;
use crate::runtime::{RuntimeError, WorkloadId};

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session ID is unknown.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Admission was denied.
    #[error("server at capacity ({active}/{capacity} sessions)")]
    CapacityExceeded { active: usize, capacity: usize },

    /// A workload runtime call failed.
    #[error("workload runtime failure: {0}")]
    Runtime(#[from] RuntimeError),

    /// The network channel failed.
    #[error("channel failure: {0}")]
    Channel(#[from] ChannelError),

    /// A terminal was requested before a workload was attached.
    #[error("session {0} has no workload attached")]
    Unattached(SessionId),

    /// Another terminal is already bridged to the session.
    #[error("session {0} already has an active terminal")]
    AlreadyBridged(SessionId),
}

/// A point-in-time copy of a session record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    /// Set once a workload has been created for the session.
    pub workload: Option<WorkloadId>,
    pub created_at: SystemTime,
    pub last_activity_at: SystemTime,
}

impl Session {
    fn new(now: SystemTime) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workload: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_activity_at)
            .unwrap_or_default()
    }
}

/// Thread-safe store of all live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Every mutation is a single insert, remove or field store, so a
    // poisoned map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a session with a fresh ID and no workload.
    pub fn new_session(&self) -> Session {
        let session = Session::new(SystemTime::now());
        self.write().insert(session.id.clone(), session.clone());
        tracing::debug!(session_id = %session.id, "Session created");
        session
    }

    /// Creates a session only if fewer than `capacity` exist.
    ///
    /// The check and the insert happen under one lock acquisition, so the
    /// ceiling is exact under concurrent callers.
    pub fn try_new_session(&self, capacity: usize) -> Result<Session, SessionError> {
        let session = {
            let mut sessions = self.write();
            if sessions.len() >= capacity {
                return Err(SessionError::CapacityExceeded {
                    active: sessions.len(),
                    capacity,
                });
            }
            let session = Session::new(SystemTime::now());
            sessions.insert(session.id.clone(), session.clone());
            session
        };
        tracing::debug!(session_id = %session.id, "Session created");
        Ok(session)
    }

    /// Records the workload backing a session and refreshes its activity.
    pub fn attach_workload(&self, id: &str, workload: WorkloadId) -> Result<(), SessionError> {
        let mut sessions = self.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.workload = Some(workload);
        session.last_activity_at = session.last_activity_at.max(SystemTime::now());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.read().get(id).cloned()
    }

    /// Copies of every session, taken under one lock acquisition.
    pub fn list(&self) -> Vec<Session> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Removes a session, returning its workload handle if one was attached.
    pub fn destroy(&self, id: &str) -> Result<Option<WorkloadId>, SessionError> {
        let session = self
            .write()
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        tracing::debug!(session_id = %id, "Session destroyed");
        Ok(session.workload)
    }

    /// Refreshes a session's activity time.
    ///
    /// Unknown IDs are ignored: this runs on I/O hot paths that must not fail.
    pub fn touch(&self, id: &str) {
        let now = SystemTime::now();
        if let Some(session) = self.write().get_mut(id) {
            session.last_activity_at = session.last_activity_at.max(now);
        }
    }

    /// Forces a session's activity time, including backwards.
    pub fn set_activity(&self, id: &str, at: SystemTime) -> Result<(), SessionError> {
        let mut sessions = self.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.last_activity_at = at;
        Ok(())
    }

    /// Copies of all sessions whose last activity precedes `now - cutoff`.
    pub fn idle_since(&self, cutoff: Duration) -> Vec<Session> {
        let Some(threshold) = SystemTime::now().checked_sub(cutoff) else {
            return Vec::new();
        };
        self.read()
            .values()
            .filter(|session| session.last_activity_at < threshold)
            .cloned()
            .collect()
    }
}
