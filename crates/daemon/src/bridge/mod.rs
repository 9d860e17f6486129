//! Terminal bridge.
//!
//! A bridge joins one network channel to the attached streams of one
//! session's workload. It moves through:
//!
//! ```text
//! CONNECTING -> ATTACHING -> STREAMING -> CLOSING -> CLOSED
//! ```
//!
//! - **CONNECTING** ([`TerminalBridge::connect`]): the session must exist,
//!   have a workload, and not already be bridged. Failing here refuses the
//!   channel before it is upgraded.
//! - **ATTACHING**: the welcome banner goes out, the workload is started
//!   (idempotent), and its streams are attached. A failure sends an inline
//!   diagnostic and closes without streaming.
//! - **STREAMING**: three pumps run concurrently:
//!   - *inbound* forwards channel messages to the workload input,
//!   - *outbound* forwards workload output chunks to the channel,
//!   - *heartbeat* probes the channel on a fixed interval.
//!
//!   Inbound and heartbeat share a cancellation token and fire it when they
//!   end. Outbound never fires it: a workload whose output ends must not
//!   sever a live user connection.
//! - **CLOSING**: inbound and heartbeat are joined, then the output stream
//!   is detached so outbound can return.
//! - **CLOSED**: the workload input and the channel are each released once.

pub mod banner;
pub mod channel;
pub mod claims;

pub use channel::{ChannelError, ChannelFuture, ChannelMessage, ChannelSink, ChannelSource};
pub use claims::{BridgeClaim, BridgeClaims};

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{TerminalConfig, MIN_READ_BUFFER_SIZE};
use crate::runtime::{Attachment, WorkloadId, WorkloadInput, WorkloadOutput, WorkloadRuntime};
use crate::session::{SessionError, SessionId, SessionRegistry};

/// Tuning for a single bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub heartbeat_interval: Duration,
    /// Deadline for each liveness probe.
    pub heartbeat_timeout: Duration,
    pub read_buffer_size: usize,
    /// Pause between starting the workload and attaching to it.
    pub attach_delay: Duration,
    /// Sent right after the channel opens, before the workload starts.
    pub banner: Option<String>,
    /// Terminal size requested by the client, as `(rows, cols)`.
    pub initial_size: Option<(u16, u16)>,
}

impl From<&TerminalConfig> for BridgeConfig {
    fn from(config: &TerminalConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
            read_buffer_size: config.read_buffer_size.max(MIN_READ_BUFFER_SIZE),
            attach_delay: Duration::from_millis(config.attach_delay_ms),
            banner: config
                .welcome_banner
                .then(|| banner::WELCOME_BANNER.to_string()),
            initial_size: None,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from(&TerminalConfig::default())
    }
}

impl BridgeConfig {
    pub fn with_initial_size(mut self, rows: u16, cols: u16) -> Self {
        self.initial_size = Some((rows, cols));
        self
    }
}

/// Lifecycle state of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Attaching,
    Streaming,
    Closing,
    Closed,
}

/// Why a bridge ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The client closed the channel or went away.
    ClientClosed,
    /// Reading from or writing to the channel failed.
    Channel(ChannelError),
    /// A liveness probe failed or missed its deadline.
    HeartbeatFailed(ChannelError),
    /// The workload stopped accepting input.
    InputFailed(String),
    /// The workload could not be started.
    StartFailed(String),
    /// The workload streams could not be attached.
    AttachFailed(String),
}

/// Traffic counters for one bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub bytes_in: u64,
    pub messages_in: u64,
    pub bytes_out: u64,
    pub messages_out: u64,
    pub pings_sent: u64,
}

/// Returned when a bridge reaches CLOSED.
#[derive(Debug, Clone)]
pub struct BridgeSummary {
    pub session_id: SessionId,
    pub workload_id: WorkloadId,
    pub reason: EndReason,
    /// Whether the bridge reached STREAMING.
    pub streamed: bool,
    pub stats: BridgeStats,
    pub duration: Duration,
}

/// A terminal bridge for one session, created in CONNECTING.
pub struct TerminalBridge {
    session_id: SessionId,
    workload_id: WorkloadId,
    registry: Arc<SessionRegistry>,
    runtime: Arc<dyn WorkloadRuntime>,
    config: BridgeConfig,
    state: BridgeState,
    _claim: BridgeClaim,
}

impl TerminalBridge {
    /// Validates that `session_id` can be bridged and claims it.
    pub fn connect(
        session_id: &str,
        registry: Arc<SessionRegistry>,
        runtime: Arc<dyn WorkloadRuntime>,
        claims: &BridgeClaims,
        config: BridgeConfig,
    ) -> Result<Self, SessionError> {
        let session = registry
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let workload_id = session
            .workload
            .ok_or_else(|| SessionError::Unattached(session_id.to_string()))?;
        let claim = claims
            .claim(session_id)
            .ok_or_else(|| SessionError::AlreadyBridged(session_id.to_string()))?;

        Ok(Self {
            session_id: session.id,
            workload_id,
            registry,
            runtime,
            config,
            state: BridgeState::Connecting,
            _claim: claim,
        })
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn transition(&mut self, next: BridgeState) {
        tracing::debug!(
            session_id = %self.session_id,
            from = ?self.state,
            to = ?next,
            "Bridge state change"
        );
        self.state = next;
    }

    /// Runs the bridge over an opened channel until it reaches CLOSED.
    pub async fn run<S, K>(mut self, source: S, sink: K) -> BridgeSummary
    where
        S: ChannelSource + 'static,
        K: ChannelSink + 'static,
    {
        let started = Instant::now();
        let sink = Arc::new(Mutex::new(sink));
        let mut resources = BridgeResources::new(Arc::clone(&sink));
        let mut stats = BridgeStats::default();

        self.transition(BridgeState::Attaching);
        self.registry.touch(&self.session_id);

        if let Some(banner) = self.config.banner.clone() {
            let len = banner.len() as u64;
            let sent = sink.lock().await.send_data(Bytes::from(banner)).await;
            if let Err(e) = sent {
                tracing::debug!(session_id = %self.session_id, error = %e, "Failed to send banner");
                return self
                    .close(&mut resources, EndReason::Channel(e), false, stats, started)
                    .await;
            }
            stats.bytes_out += len;
            stats.messages_out += 1;
        }

        let attachment = match self.attach().await {
            Ok(attachment) => attachment,
            Err(reason) => {
                let diagnostic = match reason {
                    EndReason::StartFailed(_) => banner::START_FAILED,
                    _ => banner::ATTACH_FAILED,
                };
                let sent = sink
                    .lock()
                    .await
                    .send_data(Bytes::from_static(diagnostic.as_bytes()))
                    .await;
                if let Err(e) = sent {
                    tracing::debug!(session_id = %self.session_id, error = %e, "Failed to send diagnostic");
                }
                return self.close(&mut resources, reason, false, stats, started).await;
            }
        };

        let Attachment {
            output,
            input,
            resizer,
        } = attachment;

        self.transition(BridgeState::Streaming);
        let cancel = CancellationToken::new();
        let detach = CancellationToken::new();

        let inbound = tokio::spawn(pump_inbound(
            source,
            input,
            Arc::clone(&self.registry),
            self.session_id.clone(),
            cancel.clone(),
        ));
        let outbound = tokio::spawn(pump_outbound(
            output,
            Arc::clone(&sink),
            Arc::clone(&self.registry),
            self.session_id.clone(),
            self.config.read_buffer_size,
            detach.clone(),
        ));
        let heartbeat = tokio::spawn(pump_heartbeat(
            Arc::clone(&sink),
            self.session_id.clone(),
            self.config.heartbeat_interval,
            self.config.heartbeat_timeout,
            cancel.clone(),
        ));

        let inbound_reason = match inbound.await {
            Ok(outcome) => {
                stats.bytes_in = outcome.bytes;
                stats.messages_in = outcome.messages;
                resources.input = Some(outcome.input);
                outcome.reason
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "Inbound pump panicked");
                cancel.cancel();
                Some(EndReason::Channel(ChannelError::Transport(e.to_string())))
            }
        };

        self.transition(BridgeState::Closing);

        let heartbeat_reason = match heartbeat.await {
            Ok(outcome) => {
                stats.pings_sent = outcome.pings;
                outcome.reason
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "Heartbeat pump panicked");
                None
            }
        };

        // Outbound may be parked on a read that only ends with the stream.
        detach.cancel();
        match outbound.await {
            Ok(outcome) => {
                stats.bytes_out += outcome.bytes;
                stats.messages_out += outcome.messages;
            }
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "Outbound pump panicked");
            }
        }
        drop(resizer);

        let reason = heartbeat_reason
            .or(inbound_reason)
            .unwrap_or(EndReason::ClientClosed);
        self.close(&mut resources, reason, true, stats, started).await
    }

    /// ATTACHING: start the workload, wait briefly, attach its streams.
    async fn attach(&self) -> Result<Attachment, EndReason> {
        if let Err(e) = self.runtime.start(&self.workload_id).await {
            tracing::warn!(
                session_id = %self.session_id,
                workload_id = %self.workload_id,
                error = %e,
                "Failed to start workload"
            );
            return Err(EndReason::StartFailed(e.to_string()));
        }

        if !self.config.attach_delay.is_zero() {
            tokio::time::sleep(self.config.attach_delay).await;
        }

        let attachment = self.runtime.attach(&self.workload_id).await.map_err(|e| {
            tracing::warn!(
                session_id = %self.session_id,
                workload_id = %self.workload_id,
                error = %e,
                "Failed to attach to workload"
            );
            EndReason::AttachFailed(e.to_string())
        })?;

        if let Some((rows, cols)) = self.config.initial_size {
            if let Err(e) = attachment.resizer.resize(rows, cols) {
                tracing::warn!(session_id = %self.session_id, error = %e, "Initial resize failed");
            }
        }

        Ok(attachment)
    }

    async fn close<K: ChannelSink>(
        &mut self,
        resources: &mut BridgeResources<K>,
        reason: EndReason,
        streamed: bool,
        stats: BridgeStats,
        started: Instant,
    ) -> BridgeSummary {
        resources
            .release(&self.session_id, self.config.heartbeat_timeout)
            .await;
        self.transition(BridgeState::Closed);

        let summary = BridgeSummary {
            session_id: self.session_id.clone(),
            workload_id: self.workload_id.clone(),
            reason,
            streamed,
            stats,
            duration: started.elapsed(),
        };

        tracing::info!(
            session_id = %summary.session_id,
            workload_id = %summary.workload_id,
            reason = ?summary.reason,
            bytes_in = summary.stats.bytes_in,
            bytes_out = summary.stats.bytes_out,
            duration_ms = summary.duration.as_millis() as u64,
            "Terminal closed"
        );
        summary
    }
}

/// Per-bridge resources released at CLOSED.
struct BridgeResources<K> {
    input: Option<WorkloadInput>,
    sink: Arc<Mutex<K>>,
    sink_open: bool,
}

impl<K: ChannelSink> BridgeResources<K> {
    fn new(sink: Arc<Mutex<K>>) -> Self {
        Self {
            input: None,
            sink,
            sink_open: true,
        }
    }

    /// Shuts down the workload input and closes the channel. Idempotent.
    ///
    /// Each step gets at most `deadline`: a peer that stopped reading can
    /// block a close handshake forever. The channel is torn down when the
    /// bridge drops it either way.
    async fn release(&mut self, session_id: &str, deadline: Duration) {
        if let Some(mut input) = self.input.take() {
            match tokio::time::timeout(deadline, input.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Workload input shutdown failed");
                }
                Err(_) => {
                    tracing::debug!(session_id = %session_id, "Workload input shutdown timed out");
                }
            }
        }
        if std::mem::take(&mut self.sink_open) {
            let closed = tokio::time::timeout(deadline, async {
                self.sink.lock().await.close().await
            })
            .await;
            match closed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Channel close failed");
                }
                Err(_) => {
                    tracing::warn!(
                        session_id = %session_id,
                        deadline = ?deadline,
                        "Channel close timed out, dropping connection"
                    );
                }
            }
        }
    }
}

struct InboundOutcome {
    input: WorkloadInput,
    /// `None` when stopped by the shared cancellation.
    reason: Option<EndReason>,
    bytes: u64,
    messages: u64,
}

async fn pump_inbound<S: ChannelSource>(
    mut source: S,
    mut input: WorkloadInput,
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    cancel: CancellationToken,
) -> InboundOutcome {
    let _cancel_on_exit = cancel.clone().drop_guard();
    let mut bytes = 0u64;
    let mut messages = 0u64;

    let reason = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break None,
            message = source.recv() => message,
        };

        match message {
            Ok(Some(ChannelMessage::Data(data))) => {
                registry.touch(&session_id);
                messages += 1;
                if data.is_empty() {
                    continue;
                }
                let written = tokio::select! {
                    _ = cancel.cancelled() => break None,
                    written = input.write_all(&data) => written,
                };
                if let Err(e) = written {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to write to workload");
                    break Some(EndReason::InputFailed(e.to_string()));
                }
                bytes += data.len() as u64;
            }
            Ok(Some(ChannelMessage::Ping | ChannelMessage::Pong)) => {}
            Ok(Some(ChannelMessage::Close)) | Ok(None) => break Some(EndReason::ClientClosed),
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Channel read failed");
                break Some(EndReason::Channel(e));
            }
        }
    };

    InboundOutcome {
        input,
        reason,
        bytes,
        messages,
    }
}

struct OutboundOutcome {
    bytes: u64,
    messages: u64,
}

async fn pump_outbound<K: ChannelSink>(
    mut output: WorkloadOutput,
    sink: Arc<Mutex<K>>,
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    buffer_size: usize,
    detach: CancellationToken,
) -> OutboundOutcome {
    let mut buf = vec![0u8; buffer_size];
    let mut outcome = OutboundOutcome {
        bytes: 0,
        messages: 0,
    };

    loop {
        let n = tokio::select! {
            _ = detach.cancelled() => break,
            read = output.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(session_id = %session_id, "Workload output ended");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Workload read failed");
                    break;
                }
            },
        };

        registry.touch(&session_id);
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        let sent = tokio::select! {
            _ = detach.cancelled() => break,
            sent = async { sink.lock().await.send_data(chunk).await } => sent,
        };
        if let Err(e) = sent {
            tracing::debug!(session_id = %session_id, error = %e, "Channel write failed");
            break;
        }
        outcome.bytes += n as u64;
        outcome.messages += 1;
    }

    outcome
}

struct HeartbeatOutcome {
    pings: u64,
    reason: Option<EndReason>,
}

async fn pump_heartbeat<K: ChannelSink>(
    sink: Arc<Mutex<K>>,
    session_id: SessionId,
    period: Duration,
    deadline: Duration,
    cancel: CancellationToken,
) -> HeartbeatOutcome {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut pings = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return HeartbeatOutcome { pings, reason: None },
            _ = ticker.tick() => {}
        }

        let probe = tokio::time::timeout(deadline, async {
            sink.lock().await.send_ping().await
        })
        .await;

        let error = match probe {
            Ok(Ok(())) => {
                pings += 1;
                continue;
            }
            Ok(Err(e)) => e,
            Err(_) => ChannelError::Timeout(deadline),
        };

        tracing::warn!(session_id = %session_id, error = %error, "Heartbeat failed");
        cancel.cancel();
        return HeartbeatOutcome {
            pings,
            reason: Some(EndReason::HeartbeatFailed(error)),
        };
    }
}
