//! Integration tests for the WebSocket terminal.
//!
//! The mock runtime echoes input back as output, so whatever the client
//! types must come back through the bridge.

mod common;

use std::time::Duration;

use common::{eventually, spawn_daemon, TestDaemon};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Terminal = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open_terminal(daemon: &TestDaemon, session_id: &str) -> Terminal {
    let url = daemon.ws_url(&format!("/session/{session_id}/ws"));
    let (socket, _) = connect_async(url).await.unwrap();
    socket
}

/// HTTP status of a terminal request the server refused to upgrade.
async fn refused_status(daemon: &TestDaemon, session_id: &str) -> u16 {
    let url = daemon.ws_url(&format!("/session/{session_id}/ws"));
    match connect_async(url).await {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
}

/// Reads terminal output until it contains `needle`.
async fn read_until(terminal: &mut Terminal, needle: &str) -> String {
    let mut seen = String::new();
    let found = timeout(Duration::from_secs(5), async {
        while let Some(message) = terminal.next().await {
            match message.unwrap() {
                Message::Binary(data) => seen.push_str(&String::from_utf8_lossy(&data)),
                Message::Text(text) => seen.push_str(&text),
                _ => {}
            }
            if seen.contains(needle) {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "never saw {needle:?}, got {seen:?}");
    seen
}

#[tokio::test]
async fn test_banner_then_echo() {
    let daemon = spawn_daemon(|_| {}).await;
    let created = daemon.create_session().await;

    let mut terminal = open_terminal(&daemon, &created.session_id).await;
    read_until(&mut terminal, "Welcome to ShellCraft").await;

    terminal
        .send(Message::Text("echo hello\n".to_string()))
        .await
        .unwrap();
    read_until(&mut terminal, "echo hello").await;

    terminal
        .send(Message::Binary(b"binary input".to_vec()))
        .await
        .unwrap();
    read_until(&mut terminal, "binary input").await;

    let workload = daemon.runtime.workload(&created.workload_id).unwrap();
    assert!(workload.running);
    assert_eq!(workload.attachments, 1);

    terminal.close(None).await.unwrap();
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_pty_reconnect_keeps_all_output() {
    let daemon = TestDaemon::spawn_pty().await;
    let created = daemon.create_session().await;
    let claims = daemon.orchestrator.app_state().claims.clone();

    for _ in 0..3 {
        let mut terminal = open_terminal(&daemon, &created.session_id).await;
        read_until(&mut terminal, "Welcome").await;
        terminal.close(None).await.unwrap();
        assert!(eventually(|| claims.is_empty()).await);
    }

    let mut terminal = open_terminal(&daemon, &created.session_id).await;
    read_until(&mut terminal, "Welcome").await;
    for i in 0..3 {
        // Typed input echoes as `"pty""_line_N"`; only command output matches.
        terminal
            .send(Message::Text(format!("echo \"pty\"\"_line_{i}\"\n")))
            .await
            .unwrap();
    }
    let seen = read_until(&mut terminal, "pty_line_2").await;
    assert!(seen.contains("pty_line_0"), "lost output: {seen:?}");
    assert!(seen.contains("pty_line_1"), "lost output: {seen:?}");

    terminal.close(None).await.unwrap();
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_unknown_session_refused_before_upgrade() {
    let daemon = spawn_daemon(|_| {}).await;
    assert_eq!(refused_status(&daemon, "no-such-session").await, 404);
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_unattached_session_refused_before_upgrade() {
    let daemon = spawn_daemon(|_| {}).await;
    let session = daemon.orchestrator.app_state().registry.new_session();

    assert_eq!(refused_status(&daemon, &session.id).await, 400);
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_second_terminal_refused_until_first_closes() {
    let daemon = spawn_daemon(|_| {}).await;
    let created = daemon.create_session().await;

    let mut first = open_terminal(&daemon, &created.session_id).await;
    read_until(&mut first, "Welcome").await;
    assert_eq!(refused_status(&daemon, &created.session_id).await, 409);

    first.close(None).await.unwrap();
    let claims = daemon.orchestrator.app_state().claims.clone();
    assert!(eventually(|| claims.is_empty()).await);

    let mut second = open_terminal(&daemon, &created.session_id).await;
    read_until(&mut second, "Welcome").await;
    second.send(Message::Text("again".to_string())).await.unwrap();
    read_until(&mut second, "again").await;

    second.close(None).await.unwrap();
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_initial_size_from_query() {
    let daemon = spawn_daemon(|_| {}).await;
    let created = daemon.create_session().await;

    let url = daemon.ws_url(&format!(
        "/session/{}/ws?cols=132&rows=43",
        created.session_id
    ));
    let (mut terminal, _) = connect_async(url).await.unwrap();
    read_until(&mut terminal, "Welcome").await;

    let runtime = daemon.runtime.clone();
    let workload_id = created.workload_id.clone();
    assert!(
        eventually(|| runtime
            .workload(&workload_id)
            .is_some_and(|w| w.resizes.contains(&(43, 132))))
        .await
    );

    terminal.close(None).await.unwrap();
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_terminal_traffic_refreshes_activity() {
    let daemon = spawn_daemon(|_| {}).await;
    let created = daemon.create_session().await;
    let registry = daemon.orchestrator.app_state().registry.clone();

    let mut terminal = open_terminal(&daemon, &created.session_id).await;
    read_until(&mut terminal, "Welcome").await;

    let stale = std::time::SystemTime::now() - Duration::from_secs(3600);
    registry.set_activity(&created.session_id, stale).unwrap();
    assert_eq!(registry.idle_since(Duration::from_secs(900)).len(), 1);

    terminal
        .send(Message::Text("marker-42".to_string()))
        .await
        .unwrap();
    read_until(&mut terminal, "marker-42").await;
    assert!(registry.idle_since(Duration::from_secs(900)).is_empty());

    terminal.close(None).await.unwrap();
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_bridge_counted_in_metrics() {
    let daemon = spawn_daemon(|_| {}).await;
    let created = daemon.create_session().await;

    let mut terminal = open_terminal(&daemon, &created.session_id).await;
    read_until(&mut terminal, "Welcome").await;

    let metrics: protocol::ServerMetrics = daemon
        .client
        .get(daemon.url("/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics.active_bridges, 1);

    terminal.close(None).await.unwrap();
    daemon.shutdown().await;
}

#[tokio::test]
async fn test_delete_while_streaming_keeps_process_healthy() {
    let daemon = spawn_daemon(|_| {}).await;
    let created = daemon.create_session().await;

    let mut terminal = open_terminal(&daemon, &created.session_id).await;
    read_until(&mut terminal, "Welcome").await;

    let response = daemon
        .client
        .delete(daemon.url(&format!("/session/{}", created.session_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    // The workload is gone; closing the terminal still releases the bridge.
    terminal.close(None).await.unwrap();
    let claims = daemon.orchestrator.app_state().claims.clone();
    assert!(eventually(|| claims.is_empty()).await);

    let another = daemon.create_session().await;
    let mut terminal = open_terminal(&daemon, &another.session_id).await;
    read_until(&mut terminal, "Welcome").await;
    terminal.close(None).await.unwrap();

    daemon.shutdown().await;
}
