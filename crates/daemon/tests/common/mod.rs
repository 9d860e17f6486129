//! Shared helpers for daemon integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use daemon::config::{Config, RuntimeBackend};
use daemon::orchestrator::DaemonOrchestrator;
use daemon::runtime::MockRuntime;
use protocol::CreateSessionResponse;

/// A daemon serving on an ephemeral port with the mock runtime.
pub struct TestDaemon {
    pub orchestrator: DaemonOrchestrator,
    pub runtime: MockRuntime,
    pub addr: SocketAddr,
    pub client: reqwest::Client,
}

/// Starts a daemon after letting the caller adjust its configuration.
pub async fn spawn_daemon(configure: impl FnOnce(&mut Config)) -> TestDaemon {
    let mut config = Config::default();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.port = 0;
    config.runtime.backend = RuntimeBackend::Mock;
    config.terminal.attach_delay_ms = 0;
    configure(&mut config);
    config.validate().unwrap();

    let runtime = MockRuntime::new();
    let orchestrator = DaemonOrchestrator::with_runtime(config, Arc::new(runtime.clone()));
    let addr = orchestrator.start().await.unwrap();

    TestDaemon {
        orchestrator,
        runtime,
        addr,
        client: reqwest::Client::new(),
    }
}

impl TestDaemon {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Creates a session and returns its identifiers.
    pub async fn create_session(&self) -> CreateSessionResponse {
        let response = self
            .client
            .post(self.url("/session"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.unwrap()
    }

    /// A daemon whose workloads are real shells on local PTYs.
    pub async fn spawn_pty() -> TestDaemon {
        let mut config = Config::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        config.runtime.backend = RuntimeBackend::Pty;
        config
            .runtime
            .images
            .insert(config.session.default_image.clone(), "/bin/sh".to_string());
        config.terminal.attach_delay_ms = 0;
        config.validate().unwrap();

        let orchestrator = DaemonOrchestrator::new(config).unwrap();
        let addr = orchestrator.start().await.unwrap();

        TestDaemon {
            orchestrator,
            // Unused: workloads live in the PTY runtime.
            runtime: MockRuntime::new(),
            addr,
            client: reqwest::Client::new(),
        }
    }

    pub async fn shutdown(self) {
        self.orchestrator.stop().await.unwrap();
    }
}

/// Polls `condition` every 10ms until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
