//! Workload runtime adapter.
//!
//! A workload is the isolated environment backing one session. The daemon
//! never talks to a concrete runtime directly; it goes through the
//! [`WorkloadRuntime`] trait so the backend can be swapped:
//!
//! - [`docker::DockerRuntime`]: each workload is a Docker container
//! - [`pty::PtyRuntime`]: each workload is a local process on its own
//!   pseudo-terminal, limited to an explicit image table
//! - [`mock::MockRuntime`]: in-memory echo workloads with failure injection

pub mod docker;
pub mod mock;
pub mod pty;
mod tty;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{RuntimeBackend, RuntimeConfig};

pub use docker::DockerRuntime;
pub use mock::{MockOperation, MockRuntime, MockWorkload};
pub use pty::PtyRuntime;

/// Unique identifier for a workload, assigned by the runtime.
pub type WorkloadId = String;

/// Errors reported by a workload runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The workload is unknown to the runtime.
    #[error("workload not found: {0}")]
    NotFound(WorkloadId),

    /// Failed to create the workload.
    #[error("failed to create workload from image {image}: {reason}")]
    CreateFailed { image: String, reason: String },

    /// Failed to start the workload.
    #[error("failed to start workload {0}: {1}")]
    StartFailed(WorkloadId, String),

    /// Failed to stop the workload.
    #[error("failed to stop workload {0}: {1}")]
    StopFailed(WorkloadId, String),

    /// Failed to remove the workload.
    #[error("failed to remove workload {0}: {1}")]
    RemoveFailed(WorkloadId, String),

    /// Failed to attach to the workload's streams.
    #[error("failed to attach to workload {0}: {1}")]
    AttachFailed(WorkloadId, String),

    /// Failed to resize the workload's terminal.
    #[error("failed to resize workload terminal: {0}")]
    ResizeFailed(String),

    /// The runtime could not be queried.
    #[error("failed to inspect workload {0}: {1}")]
    InspectFailed(WorkloadId, String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters applied when a workload is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
    /// Working directory, if the backend supports one.
    pub cwd: Option<String>,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            cols: 80,
            rows: 24,
            cwd: None,
        }
    }
}

/// Observed state of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadState {
    Running,
    Stopped,
    /// The runtime has no record of the workload.
    Missing,
}

/// Terminal resize capability returned by [`WorkloadRuntime::attach`].
pub trait Resize: Send + Sync {
    fn resize(&self, rows: u16, cols: u16) -> Result<(), RuntimeError>;
}

/// Readable side of an attachment: the workload's stdout/stderr.
pub type WorkloadOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Writable side of an attachment: the workload's stdin.
pub type WorkloadInput = Box<dyn AsyncWrite + Send + Unpin>;

/// Duplex streams attached to a running workload.
///
/// Dropping `output` detaches the reader; shutting down `input` signals
/// end-of-input to the workload.
pub struct Attachment {
    pub output: WorkloadOutput,
    pub input: WorkloadInput,
    pub resizer: Box<dyn Resize>,
}

/// Boxed future returned by runtime operations.
pub type RuntimeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RuntimeError>> + Send + 'a>>;

/// Capability to manage workloads.
///
/// Implementations must be safe to call concurrently from many tasks.
/// `start` is idempotent: starting a running workload succeeds without
/// side effects.
pub trait WorkloadRuntime: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Creates a workload from `image` without starting it.
    fn create<'a>(&'a self, image: &'a str, spec: &'a WorkloadSpec) -> RuntimeFuture<'a, WorkloadId>;

    /// Starts a workload.
    fn start<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()>;

    /// Stops a workload, leaving it removable.
    fn stop<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()>;

    /// Removes a workload, stopping it first if needed.
    fn remove<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()>;

    /// Attaches to a running workload's standard streams.
    fn attach<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, Attachment>;

    /// Reports the current state of a workload.
    fn inspect<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, WorkloadState>;
}

/// Builds the runtime backend selected by configuration.
pub fn from_config(config: &RuntimeConfig) -> Arc<dyn WorkloadRuntime> {
    match config.backend {
        RuntimeBackend::Docker => Arc::new(DockerRuntime::from_config(config)),
        RuntimeBackend::Pty => Arc::new(PtyRuntime::from_config(config)),
        RuntimeBackend::Mock => Arc::new(MockRuntime::new()),
    }
}
