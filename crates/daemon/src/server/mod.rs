//! HTTP session surface.
//!
//! | Route | Handler |
//! |---|---|
//! | `GET /healthz` | liveness probe |
//! | `GET /metrics` | capacity and sweep snapshot |
//! | `POST /session` | admit, create workload |
//! | `DELETE /session/{id}` | destroy, tear down workload |
//! | `GET /session/{id}/status` | workload state |
//! | `GET /session/{id}/ws` | terminal bridge over WebSocket |

pub mod error;
pub mod handlers;
pub mod terminal;

pub use error::ApiError;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::bridge::{BridgeClaims, BridgeConfig};
use crate::config::Config;
use crate::reclaimer::IdleReclaimer;
use crate::runtime::{WorkloadRuntime, WorkloadSpec};
use crate::session::{AdmissionController, SessionRegistry};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub runtime: Arc<dyn WorkloadRuntime>,
    pub admission: AdmissionController,
    pub claims: BridgeClaims,
    pub reclaimer: Arc<IdleReclaimer>,
    pub bridge_config: BridgeConfig,
    /// Image used when a create request names none.
    pub default_image: String,
    pub workload_spec: WorkloadSpec,
}

impl AppState {
    /// Wires a fresh registry, admission gate and reclaimer around `runtime`.
    pub fn new(config: &Config, runtime: Arc<dyn WorkloadRuntime>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let admission = AdmissionController::new(
            Arc::clone(&registry),
            config.session.max_sessions,
            config.session.admission,
        );
        let reclaimer = Arc::new(IdleReclaimer::new(
            Arc::clone(&registry),
            Arc::clone(&runtime),
            config.session.idle_timeout(),
            config.session.cleanup_interval(),
        ));

        Self {
            registry,
            runtime,
            admission,
            claims: BridgeClaims::new(),
            reclaimer,
            bridge_config: BridgeConfig::from(&config.terminal),
            default_image: config.session.default_image.clone(),
            workload_spec: WorkloadSpec {
                cols: config.runtime.cols,
                rows: config.runtime.rows,
                ..WorkloadSpec::default()
            },
        }
    }
}

/// Builds the router for the session surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/session", post(handlers::create_session))
        .route("/session/{id}", delete(handlers::delete_session))
        .route("/session/{id}/status", get(handlers::session_status))
        .route("/session/{id}/ws", get(terminal::open_terminal))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockOperation, MockRuntime};
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    fn test_app(max_sessions: usize) -> (Router, AppState, MockRuntime) {
        let mut config = Config::default();
        config.session.max_sessions = max_sessions;
        let runtime = MockRuntime::new();
        let state = AppState::new(&config, Arc::new(runtime.clone()));
        (router(state.clone()), state, runtime)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    async fn call_json(app: &Router, method: Method, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let (status, bytes) = call(app, method, uri, body).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        let (app, _, _) = test_app(4);
        let (status, body) = call(&app, Method::GET, "/healthz", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn test_create_uses_default_image() {
        let (app, state, runtime) = test_app(4);
        let (status, body) = call_json(&app, Method::POST, "/session", "").await;
        assert_eq!(status, StatusCode::OK);

        let session_id = body["session_id"].as_str().unwrap();
        let workload_id = body["workload_id"].as_str().unwrap();

        let session = state.registry.get(session_id).unwrap();
        assert_eq!(session.workload.as_deref(), Some(workload_id));

        let workload = runtime.workload(workload_id).unwrap();
        assert_eq!(workload.image, "alpine:latest");
        assert!(!workload.running, "workload is started by the bridge, not by create");
    }

    #[tokio::test]
    async fn test_create_with_image_override() {
        let (app, _, runtime) = test_app(4);
        let (status, body) =
            call_json(&app, Method::POST, "/session", r#"{"image":"busybox:1.36"}"#).await;
        assert_eq!(status, StatusCode::OK);

        let workload = runtime
            .workload(body["workload_id"].as_str().unwrap())
            .unwrap();
        assert_eq!(workload.image, "busybox:1.36");
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_json() {
        let (app, state, _) = test_app(4);
        let (status, _) = call(&app, Method::POST, "/session", "{nope").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_create_at_capacity() {
        let (app, state, runtime) = test_app(2);
        for _ in 0..2 {
            let (status, _) = call(&app, Method::POST, "/session", "").await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body) = call_json(&app, Method::POST, "/session", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Server at capacity");
        assert_eq!(body["active_sessions"], 2);
        assert_eq!(body["max_sessions"], 2);

        assert_eq!(state.registry.len(), 2);
        assert_eq!(runtime.calls(MockOperation::Create), 2);
    }

    #[tokio::test]
    async fn test_create_failure_frees_slot() {
        let (app, state, runtime) = test_app(1);
        runtime.fail(MockOperation::Create);

        let (status, _) = call(&app, Method::POST, "/session", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(state.registry.is_empty());

        runtime.succeed(MockOperation::Create);
        let (status, _) = call(&app, Method::POST, "/session", "").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_delete_session() {
        let (app, state, runtime) = test_app(4);
        let (_, created) = call_json(&app, Method::POST, "/session", "").await;
        let session_id = created["session_id"].as_str().unwrap();

        let uri = format!("/session/{session_id}");
        let (status, body) = call_json(&app, Method::DELETE, &uri, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "deleted");
        assert!(state.registry.get(session_id).is_none());
        assert_eq!(runtime.workload_count(), 0);

        let (status, body) = call_json(&app, Method::DELETE, &uri, "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Session not found");
    }

    #[tokio::test]
    async fn test_delete_survives_teardown_failure() {
        let (app, state, runtime) = test_app(4);
        let (_, created) = call_json(&app, Method::POST, "/session", "").await;
        let session_id = created["session_id"].as_str().unwrap();

        runtime.fail(MockOperation::Stop);
        let (status, _) = call(&app, Method::DELETE, &format!("/session/{session_id}"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.registry.is_empty());
        assert_eq!(runtime.calls(MockOperation::Remove), 1);
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (app, state, runtime) = test_app(4);
        let (_, created) = call_json(&app, Method::POST, "/session", "").await;
        let session_id = created["session_id"].as_str().unwrap();
        let workload_id = created["workload_id"].as_str().unwrap();
        let uri = format!("/session/{session_id}/status");

        let (status, body) = call_json(&app, Method::GET, &uri, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");

        state.runtime.start(workload_id).await.unwrap();
        let (_, body) = call_json(&app, Method::GET, &uri, "").await;
        assert_eq!(body["status"], "running");

        runtime.fail(MockOperation::Inspect);
        let (_, body) = call_json(&app, Method::GET, &uri, "").await;
        assert_eq!(body["status"], "unknown");
        runtime.succeed(MockOperation::Inspect);

        state.runtime.remove(workload_id).await.unwrap();
        let (_, body) = call_json(&app, Method::GET, &uri, "").await;
        assert_eq!(body["status"], "missing");
    }

    #[tokio::test]
    async fn test_status_without_workload() {
        let (app, state, _) = test_app(4);
        let session = state.registry.new_session();

        let uri = format!("/session/{}/status", session.id);
        let (status, body) = call_json(&app, Method::GET, &uri, "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "missing");

        let (status, _) = call(&app, Method::GET, "/session/nope/status", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics() {
        let (app, _, _) = test_app(4);
        for _ in 0..3 {
            call(&app, Method::POST, "/session", "").await;
        }

        let (status, body) = call_json(&app, Method::GET, "/metrics", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_sessions"], 3);
        assert_eq!(body["max_sessions"], 4);
        assert_eq!(body["capacity_percent"], 75);
        assert_eq!(body["status"], "warning");
        assert_eq!(body["active_bridges"], 0);
        assert!(body.get("last_sweep").is_none());
    }

    #[tokio::test]
    async fn test_metrics_include_last_sweep() {
        let (app, state, _) = test_app(4);
        state.reclaimer.sweep().await;

        let (_, body) = call_json(&app, Method::GET, "/metrics", "").await;
        assert_eq!(body["last_sweep"]["attempted"], 0);
    }

    #[tokio::test]
    async fn test_terminal_rejected_before_upgrade() {
        let (app, state, _) = test_app(4);

        let (status, _) = call(&app, Method::GET, "/session/nope/ws", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let session = state.registry.new_session();
        let (status, _) = call(&app, Method::GET, &format!("/session/{}/ws", session.id), "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(state.claims.is_empty());
    }
}
