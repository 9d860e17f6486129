//! Network channel abstraction used by the terminal bridge.
//!
//! The bridge never touches a WebSocket directly. The HTTP boundary adapts
//! its socket halves to [`ChannelSource`] and [`ChannelSink`]; tests use the
//! in-memory channel from [`memory`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// A discrete message received from the network channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Terminal input bytes. Text and binary frames both map here.
    Data(Bytes),
    Ping,
    Pong,
    /// The peer asked to close the channel.
    Close,
}

/// Errors reported by a network channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("channel operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Boxed future returned by channel operations.
pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ChannelError>> + Send + 'a>>;

/// Receiving half of a network channel.
pub trait ChannelSource: Send {
    /// Waits for the next message. `Ok(None)` means the peer went away
    /// without a close handshake.
    fn recv(&mut self) -> ChannelFuture<'_, Option<ChannelMessage>>;
}

/// Sending half of a network channel.
pub trait ChannelSink: Send {
    fn send_data(&mut self, data: Bytes) -> ChannelFuture<'_, ()>;

    /// Sends a liveness probe. The bridge bounds it with its heartbeat
    /// deadline and treats expiry as a failed probe.
    fn send_ping(&mut self) -> ChannelFuture<'_, ()>;

    /// Closes the channel. Called once per bridge, under the same deadline;
    /// on expiry the bridge drops the channel instead.
    fn close(&mut self) -> ChannelFuture<'_, ()>;
}
