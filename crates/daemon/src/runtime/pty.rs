//! PTY-backed workload runtime.
//!
//! Each workload is a local process running on its own pseudo-terminal. An
//! image name resolves to a command line through the configured image table;
//! images without an entry are refused rather than run on the host.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::tty::TtyProcess;
use super::{
    Attachment, RuntimeError, RuntimeFuture, WorkloadId, WorkloadRuntime, WorkloadSpec,
    WorkloadState,
};
use crate::config::RuntimeConfig;

/// A workload record: created eagerly, spawned on start.
struct PtyWorkload {
    argv: Vec<String>,
    spec: WorkloadSpec,
    process: Option<TtyProcess>,
}

/// Runtime that hosts each workload on a local pseudo-terminal.
pub struct PtyRuntime {
    workloads: DashMap<WorkloadId, Arc<Mutex<PtyWorkload>>>,
    images: BTreeMap<String, String>,
    stop_timeout: Duration,
}

impl Default for PtyRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyRuntime {
    /// Creates a runtime with an empty image table.
    pub fn new() -> Self {
        Self {
            workloads: DashMap::new(),
            images: BTreeMap::new(),
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            workloads: DashMap::new(),
            images: config.images.clone(),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        }
    }

    /// Maps `image` to a command line.
    pub fn with_image(mut self, image: impl Into<String>, command: impl Into<String>) -> Self {
        self.images.insert(image.into(), command.into());
        self
    }

    /// Resolves the argv for an image, if the image is mapped.
    fn resolve(&self, image: &str) -> Option<Vec<String>> {
        let argv: Vec<String> = self
            .images
            .get(image)?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        (!argv.is_empty()).then_some(argv)
    }

    fn workload(&self, id: &str) -> Result<Arc<Mutex<PtyWorkload>>, RuntimeError> {
        self.workloads
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

impl WorkloadRuntime for PtyRuntime {
    fn name(&self) -> &'static str {
        "pty"
    }

    fn create<'a>(&'a self, image: &'a str, spec: &'a WorkloadSpec) -> RuntimeFuture<'a, WorkloadId> {
        Box::pin(async move {
            let argv = self.resolve(image).ok_or_else(|| RuntimeError::CreateFailed {
                image: image.to_string(),
                reason: "image is not mapped to a local command".to_string(),
            })?;

            let id = format!("pty-{}", Uuid::new_v4());
            self.workloads.insert(
                id.clone(),
                Arc::new(Mutex::new(PtyWorkload {
                    argv,
                    spec: spec.clone(),
                    process: None,
                })),
            );

            tracing::debug!(workload_id = %id, image = %image, "Created PTY workload");
            Ok(id)
        })
    }

    fn start<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            let workload = self.workload(id)?;
            let mut workload = workload.lock().await;

            if workload.process.as_ref().is_some_and(TtyProcess::is_running) {
                return Ok(());
            }
            let process = TtyProcess::spawn(id, &workload.argv, &workload.spec)
                .map_err(|e| RuntimeError::StartFailed(id.to_string(), e))?;
            // A previous process that exited on its own is simply replaced.
            workload.process = Some(process);
            Ok(())
        })
    }

    fn stop<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            let workload = self.workload(id)?;
            let process = workload.lock().await.process.take();
            match process {
                Some(process) => process
                    .terminate(self.stop_timeout)
                    .await
                    .map_err(|e| RuntimeError::StopFailed(id.to_string(), e)),
                None => Ok(()),
            }
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            let (_, workload) = self
                .workloads
                .remove(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
            let process = workload.lock().await.process.take();
            if let Some(process) = process {
                process
                    .terminate(self.stop_timeout)
                    .await
                    .map_err(|e| RuntimeError::RemoveFailed(id.to_string(), e))?;
            }
            tracing::debug!(workload_id = %id, "Removed PTY workload");
            Ok(())
        })
    }

    fn attach<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, Attachment> {
        Box::pin(async move {
            let workload = self.workload(id)?;
            let workload = workload.lock().await;

            let attachment = match workload.process.as_ref() {
                Some(process) if process.is_running() => process
                    .attach()
                    .map_err(|e| RuntimeError::AttachFailed(id.to_string(), e))?,
                _ => {
                    return Err(RuntimeError::AttachFailed(
                        id.to_string(),
                        "workload is not running".to_string(),
                    ))
                }
            };

            tracing::debug!(workload_id = %id, "Attached to PTY workload");
            Ok(attachment)
        })
    }

    fn inspect<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, WorkloadState> {
        Box::pin(async move {
            let Ok(workload) = self.workload(id) else {
                return Ok(WorkloadState::Missing);
            };
            let workload = workload.lock().await;
            Ok(if workload.process.as_ref().is_some_and(TtyProcess::is_running) {
                WorkloadState::Running
            } else {
                WorkloadState::Stopped
            })
        })
    }
}
