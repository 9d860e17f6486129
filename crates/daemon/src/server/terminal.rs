//! WebSocket terminal endpoint.
//!
//! The session is validated and claimed before the upgrade so that unknown,
//! unattached or already-bridged sessions get a plain HTTP error. After the
//! upgrade the socket halves are adapted to the bridge's channel traits.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use super::error::ApiError;
use super::AppState;
use crate::bridge::{ChannelError, ChannelFuture, ChannelMessage, ChannelSink, ChannelSource, TerminalBridge};

/// Optional initial terminal size.
#[derive(Debug, Default, Deserialize)]
pub struct TerminalQuery {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl TerminalQuery {
    /// `(rows, cols)` when both are present and non-zero.
    fn size(&self) -> Option<(u16, u16)> {
        match (self.rows, self.cols) {
            (Some(rows), Some(cols)) if rows > 0 && cols > 0 => Some((rows, cols)),
            _ => None,
        }
    }
}

pub async fn open_terminal(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<TerminalQuery>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let mut config = state.bridge_config.clone();
    if let Some((rows, cols)) = query.size() {
        config = config.with_initial_size(rows, cols);
    }

    let bridge = match TerminalBridge::connect(
        &session_id,
        state.registry.clone(),
        state.runtime.clone(),
        &state.claims,
        config,
    ) {
        Ok(bridge) => bridge,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            tracing::debug!(session_id = %session_id, error = %rejection, "Terminal request was not a WebSocket upgrade");
            return rejection.into_response();
        }
    };

    let failed_session = session_id.clone();
    ws.on_failed_upgrade(move |e| {
        tracing::warn!(session_id = %failed_session, error = %e, "WebSocket upgrade failed");
    })
    .on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        bridge.run(WsSource { stream }, WsSink { sink }).await;
    })
}

fn transport(e: axum::Error) -> ChannelError {
    ChannelError::Transport(e.to_string())
}

struct WsSource {
    stream: SplitStream<WebSocket>,
}

impl ChannelSource for WsSource {
    fn recv(&mut self) -> ChannelFuture<'_, Option<ChannelMessage>> {
        Box::pin(async move {
            let Some(message) = self.stream.next().await else {
                return Ok(None);
            };
            let message = match message.map_err(transport)? {
                Message::Text(text) => ChannelMessage::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
                Message::Binary(data) => ChannelMessage::Data(data),
                Message::Ping(_) => ChannelMessage::Ping,
                Message::Pong(_) => ChannelMessage::Pong,
                Message::Close(_) => ChannelMessage::Close,
            };
            Ok(Some(message))
        })
    }
}

struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

impl ChannelSink for WsSink {
    fn send_data(&mut self, data: Bytes) -> ChannelFuture<'_, ()> {
        Box::pin(async move { self.sink.send(Message::Binary(data)).await.map_err(transport) })
    }

    fn send_ping(&mut self) -> ChannelFuture<'_, ()> {
        Box::pin(async move { self.sink.send(Message::Ping(Bytes::new())).await.map_err(transport) })
    }

    fn close(&mut self) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            // The peer may already have closed; the close frame is best-effort.
            let _ = self.sink.send(Message::Close(None)).await;
            self.sink.close().await.map_err(transport)
        })
    }
}
