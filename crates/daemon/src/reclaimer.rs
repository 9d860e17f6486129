//! Idle session reclamation.
//!
//! The [`IdleReclaimer`] runs a periodic background sweep that evicts
//! sessions whose last activity is older than the idle threshold and tears
//! down their workloads. Sweeps are best-effort: a workload that cannot be
//! stopped or removed is recorded in the [`SweepReport`] and the sweep moves
//! on to the next session.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use protocol::SweepSummary;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::runtime::{RuntimeError, WorkloadId, WorkloadRuntime};
use crate::session::{Session, SessionId, SessionRegistry};

/// Workload teardown step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStage {
    Stop,
    Remove,
}

/// A workload that could not be torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub session_id: SessionId,
    pub workload_id: WorkloadId,
    pub stage: TeardownStage,
    pub reason: String,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub started_at: SystemTime,
    pub duration: Duration,
    /// Sessions selected for eviction.
    pub attempted: usize,
    /// Sessions removed from the registry. Teardown failures still count.
    pub destroyed: usize,
    /// Sessions that were already gone when the sweep reached them.
    pub skipped: usize,
    pub teardown_failures: Vec<TeardownFailure>,
}

impl SweepReport {
    fn new(started_at: SystemTime) -> Self {
        Self {
            started_at,
            duration: Duration::ZERO,
            attempted: 0,
            destroyed: 0,
            skipped: 0,
            teardown_failures: Vec::new(),
        }
    }

    /// Wire form exposed through the metrics endpoint.
    pub fn to_summary(&self) -> SweepSummary {
        SweepSummary {
            started_at_ms: self
                .started_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            duration_ms: self.duration.as_millis() as u64,
            attempted: self.attempted,
            destroyed: self.destroyed,
            skipped: self.skipped,
            teardown_failures: self.teardown_failures.len(),
        }
    }
}

/// Stops then removes a workload.
///
/// Both steps are always attempted; every failure is returned.
pub async fn teardown_workload(
    runtime: &dyn WorkloadRuntime,
    workload_id: &str,
) -> Vec<(TeardownStage, RuntimeError)> {
    let mut failures = Vec::new();
    if let Err(e) = runtime.stop(workload_id).await {
        failures.push((TeardownStage::Stop, e));
    }
    if let Err(e) = runtime.remove(workload_id).await {
        failures.push((TeardownStage::Remove, e));
    }
    failures
}

/// State shared between the reclaimer handle and its worker task.
struct SweepContext {
    registry: Arc<SessionRegistry>,
    runtime: Arc<dyn WorkloadRuntime>,
    idle_threshold: Duration,
    last_report: RwLock<Option<SweepReport>>,
}

impl SweepContext {
    async fn sweep(&self) -> SweepReport {
        let idle = self.registry.idle_since(self.idle_threshold);
        let report = self.reclaim(idle, "idle").await;

        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                destroyed = report.destroyed,
                skipped = report.skipped,
                teardown_failures = report.teardown_failures.len(),
                duration_ms = report.duration.as_millis() as u64,
                "Idle sweep finished"
            );
        }

        *self
            .last_report
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }

    /// Destroys each session and tears down its workload.
    async fn reclaim(&self, sessions: Vec<Session>, cause: &str) -> SweepReport {
        let clock = Instant::now();
        let mut report = SweepReport::new(SystemTime::now());

        for session in sessions {
            report.attempted += 1;

            let workload = match self.registry.destroy(&session.id) {
                Ok(workload) => workload,
                Err(e) => {
                    tracing::debug!(session_id = %session.id, error = %e, "Session already gone");
                    report.skipped += 1;
                    continue;
                }
            };
            report.destroyed += 1;

            tracing::info!(
                session_id = %session.id,
                idle_secs = session.idle_for().as_secs(),
                cause,
                "Reclaiming session"
            );

            let Some(workload_id) = workload else {
                continue;
            };
            for (stage, e) in teardown_workload(self.runtime.as_ref(), &workload_id).await {
                tracing::warn!(
                    session_id = %session.id,
                    workload_id = %workload_id,
                    stage = ?stage,
                    error = %e,
                    "Workload teardown failed"
                );
                report.teardown_failures.push(TeardownFailure {
                    session_id: session.id.clone(),
                    workload_id: workload_id.clone(),
                    stage,
                    reason: e.to_string(),
                });
            }
        }

        report.duration = clock.elapsed();
        report
    }
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Lifecycle of the background sweep task.
enum WorkerSlot {
    Idle,
    Running(Worker),
    /// `stop` is waiting for the task; `start` must not spawn another.
    Stopping,
}

/// Periodic sweeper of idle sessions.
pub struct IdleReclaimer {
    context: Arc<SweepContext>,
    period: Duration,
    worker: Mutex<WorkerSlot>,
}

impl IdleReclaimer {
    /// Creates a stopped reclaimer.
    ///
    /// `idle_threshold` selects which sessions are evicted; `period` is how
    /// often the sweep runs. The two are independent.
    pub fn new(
        registry: Arc<SessionRegistry>,
        runtime: Arc<dyn WorkloadRuntime>,
        idle_threshold: Duration,
        period: Duration,
    ) -> Self {
        Self {
            context: Arc::new(SweepContext {
                registry,
                runtime,
                idle_threshold,
                last_report: RwLock::new(None),
            }),
            period,
            worker: Mutex::new(WorkerSlot::Idle),
        }
    }

    pub fn idle_threshold(&self) -> Duration {
        self.context.idle_threshold
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Starts the background sweep. Returns `false` if already running or
    /// still stopping.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        match &*worker {
            WorkerSlot::Running(w) if !w.handle.is_finished() => {
                tracing::warn!("Idle reclaimer already running");
                return false;
            }
            WorkerSlot::Stopping => {
                tracing::warn!("Idle reclaimer is still stopping");
                return false;
            }
            _ => {}
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            Arc::clone(&self.context),
            self.period,
            token.clone(),
        ));
        *worker = WorkerSlot::Running(Worker { token, handle });

        tracing::info!(
            period_secs = self.period.as_secs(),
            idle_threshold_secs = self.context.idle_threshold.as_secs(),
            "Started idle reclaimer"
        );
        true
    }

    /// Stops the background sweep, waiting for an in-flight sweep to finish.
    /// Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let worker = {
            let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *slot, WorkerSlot::Stopping) {
                WorkerSlot::Running(worker) => worker,
                other => {
                    *slot = other;
                    return false;
                }
            }
        };

        worker.token.cancel();
        if let Err(e) = worker.handle.await {
            tracing::error!(error = %e, "Idle reclaimer task failed");
        }
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = WorkerSlot::Idle;
        tracing::info!("Stopped idle reclaimer");
        true
    }

    pub fn is_running(&self) -> bool {
        matches!(
            &*self.worker.lock().unwrap_or_else(PoisonError::into_inner),
            WorkerSlot::Running(w) if !w.handle.is_finished()
        )
    }

    /// Runs one sweep immediately.
    pub async fn sweep(&self) -> SweepReport {
        self.context.sweep().await
    }

    /// Destroys every remaining session regardless of activity.
    pub async fn drain(&self) -> SweepReport {
        let sessions = self.context.registry.list();
        let report = self.context.reclaim(sessions, "shutdown").await;
        if report.attempted > 0 {
            tracing::info!(
                destroyed = report.destroyed,
                teardown_failures = report.teardown_failures.len(),
                "Drained sessions"
            );
        }
        report
    }

    /// Most recent periodic or manual sweep.
    pub fn last_report(&self) -> Option<SweepReport> {
        self.context
            .last_report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn run_worker(context: Arc<SweepContext>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // A sweep in progress is not interrupted; stop waits for it.
        context.sweep().await;
    }
}
