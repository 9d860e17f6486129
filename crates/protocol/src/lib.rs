//! # ShellCraft Protocol Library
//!
//! Wire types shared by the ShellCraft daemon and its clients.
//!
//! ## Overview
//!
//! The daemon exposes a small HTTP surface for session lifecycle plus a
//! WebSocket terminal channel. Terminal traffic is raw bytes and needs no
//! schema; everything else is JSON and is defined here:
//!
//! - **Session Messages**: create/delete/status request and response bodies
//! - **Error Messages**: the capacity diagnostic and the generic error body
//! - **Operational Messages**: metrics snapshot and reclamation sweep summary
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::messages::{from_json, CreateSessionResponse};
//!
//! let body = br#"{"session_id":"s-1","workload_id":"w-1"}"#;
//! let created: CreateSessionResponse = from_json(body).unwrap();
//! assert_eq!(created.workload_id, "w-1");
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: API message definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    CapacityExceededBody, CreateSessionRequest, CreateSessionResponse, DeleteSessionResponse,
    ErrorBody, HealthStatus, ServerMetrics, SessionStatusResponse, SweepSummary, WorkloadStatus,
};
