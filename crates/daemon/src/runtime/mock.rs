//! In-memory workload runtime.
//!
//! Workloads are bookkeeping entries; attaching yields an echo pipe where
//! every byte written to the input comes back on the output. Each operation
//! can be made to fail on demand and every call is counted, which makes this
//! backend the workhorse of the daemon's tests. It is also selectable from
//! configuration for running the daemon without spawning processes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

use super::{
    Attachment, Resize, RuntimeError, RuntimeFuture, WorkloadId, WorkloadRuntime, WorkloadSpec,
    WorkloadState,
};

/// Capacity of each in-memory echo pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Runtime operations that can be counted or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Create,
    Start,
    Stop,
    Remove,
    Attach,
    Inspect,
    Resize,
}

/// Snapshot of a mock workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockWorkload {
    pub id: WorkloadId,
    pub image: String,
    pub running: bool,
    /// Attachments opened so far.
    pub attachments: usize,
    /// Resize requests received, as `(rows, cols)`.
    pub resizes: Vec<(u16, u16)>,
}

#[derive(Default)]
struct MockState {
    workloads: HashMap<WorkloadId, MockWorkload>,
    output_tokens: HashMap<WorkloadId, Vec<CancellationToken>>,
    failing: HashSet<MockOperation>,
    calls: HashMap<MockOperation, usize>,
    next_id: u64,
}

impl MockState {
    fn record(&mut self, op: MockOperation) -> Result<(), String> {
        *self.calls.entry(op).or_insert(0) += 1;
        if self.failing.contains(&op) {
            return Err(format!("injected {:?} failure", op));
        }
        Ok(())
    }
}

/// In-memory [`WorkloadRuntime`].
#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every subsequent call of `op` fail.
    pub fn fail(&self, op: MockOperation) {
        self.lock().failing.insert(op);
    }

    /// Clears an injected failure.
    pub fn succeed(&self, op: MockOperation) {
        self.lock().failing.remove(&op);
    }

    /// Number of times `op` has been called, failed calls included.
    pub fn calls(&self, op: MockOperation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Returns a snapshot of a workload.
    pub fn workload(&self, id: &str) -> Option<MockWorkload> {
        self.lock().workloads.get(id).cloned()
    }

    /// Number of workloads that have not been removed.
    pub fn workload_count(&self) -> usize {
        self.lock().workloads.len()
    }

    /// Ends the output stream of every attachment to `id`.
    ///
    /// The attachments keep accepting input, mimicking a workload whose
    /// stdout was closed while its stdin stays open.
    pub fn end_output(&self, id: &str) {
        let tokens = self.lock().output_tokens.remove(id).unwrap_or_default();
        for token in tokens {
            token.cancel();
        }
    }
}

/// Echoes `server` input back to its output until end-of-input or until
/// `end_output` fires, then drains the remaining input.
async fn run_echo(server: DuplexStream, end_output: CancellationToken) {
    let (mut reader, mut writer) = tokio::io::split(server);
    let mut buf = vec![0u8; 4096];

    loop {
        let n = tokio::select! {
            _ = end_output.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    let _ = writer.shutdown().await;
                    return;
                }
                Ok(n) => n,
            },
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }

    let _ = writer.shutdown().await;
    while let Ok(n) = reader.read(&mut buf).await {
        if n == 0 {
            break;
        }
    }
}

struct MockResizer {
    state: Arc<Mutex<MockState>>,
    id: WorkloadId,
}

impl Resize for MockResizer {
    fn resize(&self, rows: u16, cols: u16) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .record(MockOperation::Resize)
            .map_err(RuntimeError::ResizeFailed)?;
        let workload = state
            .workloads
            .get_mut(&self.id)
            .ok_or_else(|| RuntimeError::NotFound(self.id.clone()))?;
        workload.resizes.push((rows, cols));
        Ok(())
    }
}

impl WorkloadRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create<'a>(&'a self, image: &'a str, _spec: &'a WorkloadSpec) -> RuntimeFuture<'a, WorkloadId> {
        Box::pin(async move {
            let mut state = self.lock();
            state
                .record(MockOperation::Create)
                .map_err(|reason| RuntimeError::CreateFailed {
                    image: image.to_string(),
                    reason,
                })?;

            state.next_id += 1;
            let id = format!("mock-{}", state.next_id);
            state.workloads.insert(
                id.clone(),
                MockWorkload {
                    id: id.clone(),
                    image: image.to_string(),
                    running: false,
                    attachments: 0,
                    resizes: Vec::new(),
                },
            );
            Ok(id)
        })
    }

    fn start<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            state
                .record(MockOperation::Start)
                .map_err(|reason| RuntimeError::StartFailed(id.to_string(), reason))?;
            let workload = state
                .workloads
                .get_mut(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            workload.running = true;
            Ok(())
        })
    }

    fn stop<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            let tokens = {
                let mut state = self.lock();
                state
                    .record(MockOperation::Stop)
                    .map_err(|reason| RuntimeError::StopFailed(id.to_string(), reason))?;
                let workload = state
                    .workloads
                    .get_mut(id)
                    .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
                workload.running = false;
                state.output_tokens.remove(id).unwrap_or_default()
            };
            for token in tokens {
                token.cancel();
            }
            Ok(())
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            let tokens = {
                let mut state = self.lock();
                state
                    .record(MockOperation::Remove)
                    .map_err(|reason| RuntimeError::RemoveFailed(id.to_string(), reason))?;
                if state.workloads.remove(id).is_none() {
                    return Err(RuntimeError::NotFound(id.to_string()));
                }
                state.output_tokens.remove(id).unwrap_or_default()
            };
            for token in tokens {
                token.cancel();
            }
            Ok(())
        })
    }

    fn attach<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, Attachment> {
        Box::pin(async move {
            let end_output = CancellationToken::new();
            {
                let mut state = self.lock();
                state
                    .record(MockOperation::Attach)
                    .map_err(|reason| RuntimeError::AttachFailed(id.to_string(), reason))?;
                let workload = state
                    .workloads
                    .get_mut(id)
                    .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
                workload.attachments += 1;
                state
                    .output_tokens
                    .entry(id.to_string())
                    .or_default()
                    .push(end_output.clone());
            }

            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            tokio::spawn(run_echo(server, end_output));

            let (output, input) = tokio::io::split(client);
            Ok(Attachment {
                output: Box::new(output),
                input: Box::new(input),
                resizer: Box::new(MockResizer {
                    state: Arc::clone(&self.state),
                    id: id.to_string(),
                }),
            })
        })
    }

    fn inspect<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, WorkloadState> {
        Box::pin(async move {
            let mut state = self.lock();
            state
                .record(MockOperation::Inspect)
                .map_err(|reason| RuntimeError::InspectFailed(id.to_string(), reason))?;
            Ok(match state.workloads.get(id) {
                Some(w) if w.running => WorkloadState::Running,
                Some(_) => WorkloadState::Stopped,
                None => WorkloadState::Missing,
            })
        })
    }
}
