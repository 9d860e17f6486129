//! Container-backed workload runtime.
//!
//! Workloads are Docker containers driven through the `docker` CLI. Every
//! container is created with a TTY and an open stdin. Attaching runs
//! `docker attach` on a local pseudo-terminal: the CLI relays bytes in both
//! directions and forwards size changes of that terminal to the container.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::tty::TtyProcess;
use super::{
    Attachment, RuntimeError, RuntimeFuture, WorkloadId, WorkloadRuntime, WorkloadSpec,
    WorkloadState,
};
use crate::config::RuntimeConfig;

/// Label put on every container this runtime creates.
pub const WORKLOAD_LABEL: &str = "shellcraft.workload=true";

/// How long the local `docker attach` client gets to exit when killed.
const CLIENT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Daemon-side state for one container.
#[derive(Default)]
struct ContainerWorkload {
    spec: WorkloadSpec,
    /// Local `docker attach` process shared by successive attachments.
    client: Option<TtyProcess>,
}

/// Runtime that hosts each workload in its own Docker container.
pub struct DockerRuntime {
    docker: String,
    stop_timeout: Duration,
    workloads: DashMap<WorkloadId, Arc<Mutex<ContainerWorkload>>>,
}

impl DockerRuntime {
    /// Creates a runtime that invokes `docker` as its CLI.
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
            stop_timeout: Duration::from_secs(10),
            workloads: DashMap::new(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            docker: config.docker.clone(),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            workloads: DashMap::new(),
        }
    }

    /// Runs the CLI and returns its trimmed stdout, or its stderr on failure.
    async fn docker(&self, args: &[&str]) -> Result<String, String> {
        let output = Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {e}", self.docker))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    /// Pulls `image` unless it is already present locally.
    async fn ensure_image(&self, image: &str) -> Result<(), String> {
        if self
            .docker(&["image", "inspect", "--format", "{{.Id}}", image])
            .await
            .is_ok()
        {
            return Ok(());
        }

        tracing::info!(image = %image, "Pulling image");
        self.docker(&["pull", "--quiet", image]).await.map(|_| ())
    }

    fn workload(&self, id: &str) -> Arc<Mutex<ContainerWorkload>> {
        Arc::clone(self.workloads.entry(id.to_string()).or_default().value())
    }

    /// Kills the local attach client, if one is running.
    async fn detach_client(&self, id: &str, workload: &Mutex<ContainerWorkload>) {
        let client = workload.lock().await.client.take();
        if let Some(client) = client {
            if let Err(e) = client.terminate(CLIENT_STOP_TIMEOUT).await {
                tracing::warn!(workload_id = %id, error = %e, "Failed to stop attach client");
            }
        }
    }
}

/// Arguments for `docker create`.
fn create_args(image: &str, spec: &WorkloadSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--interactive".to_string(),
        "--tty".to_string(),
        "--label".to_string(),
        WORKLOAD_LABEL.to_string(),
        "--env".to_string(),
        "TERM=xterm-256color".to_string(),
    ];
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    if let Some(ref dir) = spec.cwd {
        args.push("--workdir".to_string());
        args.push(dir.clone());
    }
    args.push(image.to_string());
    args
}

/// Whether CLI stderr reports an unknown container.
fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

impl WorkloadRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn create<'a>(&'a self, image: &'a str, spec: &'a WorkloadSpec) -> RuntimeFuture<'a, WorkloadId> {
        Box::pin(async move {
            let create_failed = |reason: String| RuntimeError::CreateFailed {
                image: image.to_string(),
                reason,
            };

            self.ensure_image(image).await.map_err(create_failed)?;

            let args = create_args(image, spec);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let id = self.docker(&args).await.map_err(create_failed)?;
            if id.is_empty() {
                return Err(create_failed("docker returned no container id".to_string()));
            }

            self.workloads.insert(
                id.clone(),
                Arc::new(Mutex::new(ContainerWorkload {
                    spec: spec.clone(),
                    client: None,
                })),
            );

            tracing::debug!(workload_id = %id, image = %image, "Created container");
            Ok(id)
        })
    }

    fn start<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            self.docker(&["start", id]).await.map_err(|e| {
                if is_missing(&e) {
                    RuntimeError::NotFound(id.to_string())
                } else {
                    RuntimeError::StartFailed(id.to_string(), e)
                }
            })?;
            tracing::debug!(workload_id = %id, "Started container");
            Ok(())
        })
    }

    fn stop<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            let workload = self.workloads.get(id).map(|entry| Arc::clone(entry.value()));
            if let Some(workload) = workload {
                self.detach_client(id, &workload).await;
            }

            let timeout = self.stop_timeout.as_secs().to_string();
            self.docker(&["stop", "--time", &timeout, id])
                .await
                .map_err(|e| {
                    if is_missing(&e) {
                        RuntimeError::NotFound(id.to_string())
                    } else {
                        RuntimeError::StopFailed(id.to_string(), e)
                    }
                })?;
            tracing::debug!(workload_id = %id, "Stopped container");
            Ok(())
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, ()> {
        Box::pin(async move {
            if let Some((_, workload)) = self.workloads.remove(id) {
                self.detach_client(id, &workload).await;
            }

            self.docker(&["rm", "--force", id]).await.map_err(|e| {
                if is_missing(&e) {
                    RuntimeError::NotFound(id.to_string())
                } else {
                    RuntimeError::RemoveFailed(id.to_string(), e)
                }
            })?;
            tracing::debug!(workload_id = %id, "Removed container");
            Ok(())
        })
    }

    fn attach<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, Attachment> {
        Box::pin(async move {
            let attach_failed = |reason: String| RuntimeError::AttachFailed(id.to_string(), reason);

            if self.inspect(id).await? != WorkloadState::Running {
                return Err(attach_failed("workload is not running".to_string()));
            }

            let workload = self.workload(id);
            let mut workload = workload.lock().await;

            if !workload.client.as_ref().is_some_and(TtyProcess::is_running) {
                let argv = vec![
                    self.docker.clone(),
                    "attach".to_string(),
                    "--sig-proxy=false".to_string(),
                    id.to_string(),
                ];
                let size = WorkloadSpec {
                    cols: workload.spec.cols,
                    rows: workload.spec.rows,
                    ..WorkloadSpec::default()
                };
                let client = TtyProcess::spawn(id, &argv, &size).map_err(attach_failed)?;
                if let Some(stale) = workload.client.replace(client) {
                    if let Err(e) = stale.terminate(CLIENT_STOP_TIMEOUT).await {
                        tracing::debug!(workload_id = %id, error = %e, "Stale attach client");
                    }
                }
            }

            let attachment = match workload.client.as_ref() {
                Some(client) => client.attach().map_err(attach_failed)?,
                None => return Err(attach_failed("attach client unavailable".to_string())),
            };

            tracing::debug!(workload_id = %id, "Attached to container");
            Ok(attachment)
        })
    }

    fn inspect<'a>(&'a self, id: &'a str) -> RuntimeFuture<'a, WorkloadState> {
        Box::pin(async move {
            match self
                .docker(&["container", "inspect", "--format", "{{.State.Running}}", id])
                .await
            {
                Ok(running) if running == "true" => Ok(WorkloadState::Running),
                Ok(_) => Ok(WorkloadState::Stopped),
                Err(e) if is_missing(&e) => Ok(WorkloadState::Missing),
                Err(e) => Err(RuntimeError::InspectFailed(id.to_string(), e)),
            }
        })
    }
}
