//! Integration tests for the HTTP session surface.
//!
//! Each test starts a real daemon on an ephemeral port with the mock
//! runtime and talks to it over HTTP.

mod common;

use common::spawn_daemon;
use daemon::session::AdmissionPolicy;
use protocol::{
    CapacityExceededBody, DeleteSessionResponse, ErrorBody, HealthStatus, ServerMetrics,
    SessionStatusResponse, WorkloadStatus,
};
use reqwest::StatusCode;

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_healthz() {
    let daemon = spawn_daemon(|_| {}).await;

    let response = daemon.client.get(daemon.url("/healthz")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_create_status_delete() {
    let daemon = spawn_daemon(|_| {}).await;
    let created = daemon.create_session().await;
    assert!(!created.session_id.is_empty());
    assert!(daemon.runtime.workload(&created.workload_id).is_some());

    let status_url = daemon.url(&format!("/session/{}/status", created.session_id));
    let status: SessionStatusResponse = daemon
        .client
        .get(&status_url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.status, WorkloadStatus::Stopped);

    let response = daemon
        .client
        .delete(daemon.url(&format!("/session/{}", created.session_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let deleted: DeleteSessionResponse = response.json().await.unwrap();
    assert_eq!(deleted, DeleteSessionResponse::deleted());
    assert!(daemon.runtime.workload(&created.workload_id).is_none());

    let response = daemon.client.get(&status_url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_create_with_image() {
    let daemon = spawn_daemon(|config| config.session.default_image = "debian:stable".into()).await;

    let default = daemon.create_session().await;
    assert_eq!(daemon.runtime.workload(&default.workload_id).unwrap().image, "debian:stable");

    let response = daemon
        .client
        .post(daemon.url("/session"))
        .json(&serde_json::json!({ "image": "busybox:1.36" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created: protocol::CreateSessionResponse = response.json().await.unwrap();
    assert_eq!(daemon.runtime.workload(&created.workload_id).unwrap().image, "busybox:1.36");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_delete_unknown_session() {
    let daemon = spawn_daemon(|_| {}).await;

    let response = daemon
        .client
        .delete(daemon.url("/session/does-not-exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: ErrorBody = response.json().await.unwrap();
    assert_eq!(body.error, "Session not found");

    daemon.shutdown().await;
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test]
async fn test_capacity_exceeded() {
    let daemon = spawn_daemon(|config| config.session.max_sessions = 2).await;
    daemon.create_session().await;
    daemon.create_session().await;

    let response = daemon.client.post(daemon.url("/session")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: CapacityExceededBody = response.json().await.unwrap();
    assert_eq!(body, CapacityExceededBody::new(2, 2));

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_delete_frees_capacity() {
    let daemon = spawn_daemon(|config| config.session.max_sessions = 1).await;
    let created = daemon.create_session().await;

    daemon
        .client
        .delete(daemon.url(&format!("/session/{}", created.session_id)))
        .send()
        .await
        .unwrap();

    daemon.create_session().await;
    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exact_admission_under_concurrent_creates() {
    let daemon = spawn_daemon(|config| {
        config.session.max_sessions = 5;
        config.session.admission = AdmissionPolicy::Exact;
    })
    .await;

    let requests: Vec<_> = (0..20)
        .map(|_| {
            let client = daemon.client.clone();
            let url = daemon.url("/session");
            tokio::spawn(async move { client.post(url).send().await.unwrap().status() })
        })
        .collect();

    let mut accepted = 0;
    let mut rejected = 0;
    for request in requests {
        match request.await.unwrap() {
            StatusCode::OK => accepted += 1,
            StatusCode::SERVICE_UNAVAILABLE => rejected += 1,
            other => panic!("unexpected status {other}"),
        }
    }

    assert_eq!(accepted, 5);
    assert_eq!(rejected, 15);
    assert_eq!(daemon.orchestrator.app_state().registry.len(), 5);

    daemon.shutdown().await;
}

// =============================================================================
// Metrics and shutdown
// =============================================================================

#[tokio::test]
async fn test_metrics() {
    let daemon = spawn_daemon(|config| config.session.max_sessions = 10).await;
    for _ in 0..9 {
        daemon.create_session().await;
    }

    let metrics: ServerMetrics = daemon
        .client
        .get(daemon.url("/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics.active_sessions, 9);
    assert_eq!(metrics.max_sessions, 10);
    assert_eq!(metrics.capacity_percent, 90);
    assert_eq!(metrics.status, HealthStatus::Critical);
    assert_eq!(metrics.active_bridges, 0);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_stop_drains_sessions() {
    let daemon = spawn_daemon(|_| {}).await;
    for _ in 0..3 {
        daemon.create_session().await;
    }
    assert_eq!(daemon.runtime.workload_count(), 3);

    let runtime = daemon.runtime.clone();
    let registry = daemon.orchestrator.app_state().registry.clone();
    let url = daemon.url("/healthz");
    daemon.shutdown().await;

    assert!(registry.is_empty());
    assert_eq!(runtime.workload_count(), 0);
    assert!(reqwest::get(url).await.is_err());
}
