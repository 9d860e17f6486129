//! Session API message definitions for ShellCraft.
//!
//! This module defines the JSON bodies exchanged between the daemon's HTTP
//! surface and its clients (the browser front end, CLI tooling, tests).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Capacity percentage at which the server reports `warning`.
pub const WARNING_CAPACITY_PERCENT: u32 = 75;

/// Capacity percentage at which the server reports `critical`.
pub const CRITICAL_CAPACITY_PERCENT: u32 = 90;

// ============================================================================
// Session Messages
// ============================================================================

/// Request to create a new session.
///
/// An empty body is equivalent to `{}` and uses the daemon's default image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Optional workload image override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Response confirming session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    /// Unique session identifier.
    pub session_id: String,
    /// Identifier of the workload backing the session.
    pub workload_id: String,
}

/// Response confirming session deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSessionResponse {
    /// Always `"deleted"`.
    pub status: String,
}

impl DeleteSessionResponse {
    pub fn deleted() -> Self {
        Self {
            status: "deleted".to_string(),
        }
    }
}

/// Observed state of the workload behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    /// The workload process is running.
    Running,
    /// The workload exists but is not running.
    Stopped,
    /// The session has no workload, or the runtime no longer knows it.
    Missing,
    /// The runtime could not be queried.
    Unknown,
}

impl WorkloadStatus {
    /// Returns the wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadStatus::Running => "running",
            WorkloadStatus::Stopped => "stopped",
            WorkloadStatus::Missing => "missing",
            WorkloadStatus::Unknown => "unknown",
        }
    }
}

/// Response to a session status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub status: WorkloadStatus,
}

// ============================================================================
// Error Messages
// ============================================================================

/// Diagnostic returned when admission control rejects a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityExceededBody {
    /// Short error label.
    pub error: String,
    /// Sessions active when the request was rejected.
    pub active_sessions: usize,
    /// Configured session ceiling.
    pub max_sessions: usize,
    /// Human-readable hint for the client.
    pub message: String,
}

impl CapacityExceededBody {
    pub fn new(active_sessions: usize, max_sessions: usize) -> Self {
        Self {
            error: "Server at capacity".to_string(),
            active_sessions,
            max_sessions,
            message: "Please try again later or wait for a slot to open".to_string(),
        }
    }
}

/// Generic error body for every other failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

// ============================================================================
// Operational Messages
// ============================================================================

/// Coarse health derived from capacity usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    /// Classifies a capacity percentage.
    pub fn from_capacity_percent(percent: u32) -> Self {
        if percent >= CRITICAL_CAPACITY_PERCENT {
            HealthStatus::Critical
        } else if percent >= WARNING_CAPACITY_PERCENT {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Summary of the most recent idle reclamation sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Sweep start time (Unix epoch milliseconds).
    pub started_at_ms: u64,
    /// How long the sweep took, in milliseconds.
    pub duration_ms: u64,
    /// Idle sessions the sweep tried to destroy.
    pub attempted: usize,
    /// Sessions removed from the registry.
    pub destroyed: usize,
    /// Sessions already gone by the time the sweep reached them.
    #[serde(default)]
    pub skipped: usize,
    /// Workload stop/remove calls that failed.
    pub teardown_failures: usize,
}

/// Server metrics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMetrics {
    /// Sessions currently in the registry.
    pub active_sessions: usize,
    /// Configured session ceiling.
    pub max_sessions: usize,
    /// `active_sessions` as a whole percentage of `max_sessions`.
    pub capacity_percent: u32,
    /// Health classification of `capacity_percent`.
    pub status: HealthStatus,
    /// Terminal bridges currently streaming.
    pub active_bridges: usize,
    /// Most recent reclamation sweep, if one has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sweep: Option<SweepSummary>,
}

impl ServerMetrics {
    /// Builds a metrics snapshot, deriving percentage and health.
    pub fn new(
        active_sessions: usize,
        max_sessions: usize,
        active_bridges: usize,
        last_sweep: Option<SweepSummary>,
    ) -> Self {
        let capacity_percent = capacity_percent(active_sessions, max_sessions);
        Self {
            active_sessions,
            max_sessions,
            capacity_percent,
            status: HealthStatus::from_capacity_percent(capacity_percent),
            active_bridges,
            last_sweep,
        }
    }
}

/// Integer percentage of `active` against `max`. A zero ceiling reads as full.
pub fn capacity_percent(active: usize, max: usize) -> u32 {
    if max == 0 {
        return 100;
    }
    ((active.saturating_mul(100)) / max).min(u32::MAX as usize) as u32
}

/// Decodes a JSON message body.
pub fn from_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

/// Encodes a message as a JSON string.
pub fn to_json<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}
