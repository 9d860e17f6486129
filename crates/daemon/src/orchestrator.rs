//! Daemon orchestrator for wiring together all components.
//!
//! The `DaemonOrchestrator` builds the workload runtime from configuration,
//! creates the session registry, admission gate and idle reclaimer, and
//! serves the HTTP session surface until it is stopped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::runtime::{self, WorkloadRuntime};
use crate::server::{self, AppState};

/// How long `stop` waits for in-flight requests to finish.
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener and starting background tasks.
    Starting,
    /// Serving requests.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The listener is bound.
    Listening { addr: SocketAddr },
    /// Remaining sessions were torn down during shutdown.
    Drained { destroyed: usize, teardown_failures: usize },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    /// Shared handler state; owns the registry, runtime and reclaimer.
    app_state: AppState,
    local_addr: Mutex<Option<SocketAddr>>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: Mutex<CancellationToken>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator using the runtime backend named in `config`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let runtime = runtime::from_config(&config.runtime);
        Ok(Self::with_runtime(config, runtime))
    }

    /// Creates an orchestrator around an existing runtime.
    pub fn with_runtime(config: Config, runtime: Arc<dyn WorkloadRuntime>) -> Self {
        info!(
            backend = runtime.name(),
            max_sessions = config.session.max_sessions,
            admission = ?config.session.admission,
            "Initializing daemon"
        );

        let app_state = AppState::new(&config, runtime);
        let (event_tx, _) = broadcast::channel(64);

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            app_state,
            local_addr: Mutex::new(None),
            server_task: Mutex::new(None),
            shutdown_token: Mutex::new(CancellationToken::new()),
            event_tx,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn app_state(&self) -> &AppState {
        &self.app_state
    }

    /// Address the server is listening on, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Binds the listener, starts the reclaimer and begins serving.
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let (listener, addr) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::Error {
                    message: format!("{e:#}"),
                });
                return Err(e);
            }
        };
        *self.local_addr.lock().await = Some(addr);

        self.app_state.reclaimer.start();
        debug!("Started idle reclaimer");

        let token = CancellationToken::new();
        *self.shutdown_token.lock().await = token.clone();

        let app = server::router(self.app_state.clone());
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "HTTP server failed");
                let _ = event_tx.send(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
            }
        });
        *self.server_task.lock().await = Some(handle);

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::Listening { addr });
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(addr = %addr, "Daemon listening");
        Ok(addr)
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr)> {
        let bind = format!("{}:{}", self.config.server.bind_address, self.config.server.port);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind {bind}"))?;
        let addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        Ok((listener, addr))
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// The reclaimer is stopped and the server is cancelled and awaited
    /// first, so no request can create a session behind the drain. Every
    /// remaining session is then torn down.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.app_state.reclaimer.stop().await;

        self.shutdown_token.lock().await.cancel();

        let server_task = self.server_task.lock().await.take();
        if let Some(mut handle) = server_task {
            match tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "HTTP server task panicked"),
                Err(_) => {
                    warn!(
                        timeout_secs = SERVER_SHUTDOWN_TIMEOUT.as_secs(),
                        "HTTP server did not shut down in time, aborting in-flight requests"
                    );
                    handle.abort();
                    if let Err(e) = handle.await {
                        debug!(error = %e, "HTTP server task ended");
                    }
                }
            }
        }

        let report = self.app_state.reclaimer.drain().await;
        if report.attempted > 0 {
            self.emit_event(OrchestratorEvent::Drained {
                destroyed: report.destroyed,
                teardown_failures: report.teardown_failures.len(),
            });
        }

        *self.local_addr.lock().await = None;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub async fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.lock().await.clone()
    }
}
