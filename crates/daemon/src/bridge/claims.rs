//! At most one terminal bridge per session.

use std::sync::Arc;

use dashmap::DashSet;

use crate::session::SessionId;

/// Set of sessions that currently have a bridge.
#[derive(Debug, Clone, Default)]
pub struct BridgeClaims {
    active: Arc<DashSet<SessionId>>,
}

impl BridgeClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `session_id`, or returns `None` if another bridge holds it.
    pub fn claim(&self, session_id: &str) -> Option<BridgeClaim> {
        if !self.active.insert(session_id.to_string()) {
            return None;
        }
        Some(BridgeClaim {
            active: Arc::clone(&self.active),
            session_id: session_id.to_string(),
        })
    }

    pub fn is_claimed(&self, session_id: &str) -> bool {
        self.active.contains(session_id)
    }

    /// Number of live bridges.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Held by a bridge for its lifetime; releases the session on drop.
#[derive(Debug)]
pub struct BridgeClaim {
    active: Arc<DashSet<SessionId>>,
    session_id: SessionId,
}

impl BridgeClaim {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for BridgeClaim {
    fn drop(&mut self) {
        self.active.remove(&self.session_id);
    }
}
