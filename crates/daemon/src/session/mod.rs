//! Session state and admission.
//!
//! The [`SessionRegistry`] owns every session record; the
//! [`AdmissionController`] gates creation against the configured capacity.

pub mod admission;
pub mod registry;

pub use admission::{AdmissionController, AdmissionPolicy};
pub use registry::{Session, SessionError, SessionId, SessionRegistry};
