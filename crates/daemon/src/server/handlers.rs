//! Session lifecycle handlers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use protocol::messages::from_json;
use protocol::{
    CreateSessionRequest, CreateSessionResponse, DeleteSessionResponse, ServerMetrics,
    SessionStatusResponse, WorkloadStatus,
};

use super::error::ApiError;
use super::AppState;
use crate::reclaimer::teardown_workload;
use crate::runtime::WorkloadState;
use crate::session::SessionError;

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Json<ServerMetrics> {
    let last_sweep = state.reclaimer.last_report().map(|report| report.to_summary());
    Json(ServerMetrics::new(
        state.registry.len(),
        state.admission.capacity(),
        state.claims.len(),
        last_sweep,
    ))
}

/// Decodes an optional create body. Blank bodies mean "use defaults".
fn parse_create_request(body: &[u8]) -> Result<CreateSessionRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(CreateSessionRequest::default());
    }
    from_json(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Admits a session, creates its workload and binds the two.
///
/// The workload is created but not started; the terminal bridge starts it.
pub async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let request = parse_create_request(&body)?;
    let image = request
        .image
        .filter(|image| !image.trim().is_empty())
        .unwrap_or_else(|| state.default_image.clone());

    let session = state.admission.admit_session()?;

    let workload_id = match state.runtime.create(&image, &state.workload_spec).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(session_id = %session.id, image = %image, error = %e, "Failed to create workload");
            // A failed create must not hold a slot.
            let _ = state.registry.destroy(&session.id);
            return Err(SessionError::from(e).into());
        }
    };

    if let Err(e) = state.registry.attach_workload(&session.id, workload_id.clone()) {
        // The session vanished between admission and attach.
        for (stage, err) in teardown_workload(state.runtime.as_ref(), &workload_id).await {
            tracing::warn!(workload_id = %workload_id, stage = ?stage, error = %err, "Orphan workload teardown failed");
        }
        return Err(e.into());
    }

    tracing::info!(
        session_id = %session.id,
        workload_id = %workload_id,
        image = %image,
        "Session created"
    );

    Ok(Json(CreateSessionResponse {
        session_id: session.id,
        workload_id,
    }))
}

/// Destroys a session, then stops and removes its workload best-effort.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<DeleteSessionResponse>, ApiError> {
    let workload = state.registry.destroy(&session_id)?;

    if let Some(workload_id) = workload {
        for (stage, e) in teardown_workload(state.runtime.as_ref(), &workload_id).await {
            tracing::warn!(
                session_id = %session_id,
                workload_id = %workload_id,
                stage = ?stage,
                error = %e,
                "Workload teardown failed"
            );
        }
    }

    tracing::info!(session_id = %session_id, "Session deleted");
    Ok(Json(DeleteSessionResponse::deleted()))
}

pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatusResponse>, ApiError> {
    let session = state
        .registry
        .get(&session_id)
        .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

    let status = match session.workload {
        None => WorkloadStatus::Missing,
        Some(workload_id) => match state.runtime.inspect(&workload_id).await {
            Ok(WorkloadState::Running) => WorkloadStatus::Running,
            Ok(WorkloadState::Stopped) => WorkloadStatus::Stopped,
            Ok(WorkloadState::Missing) => WorkloadStatus::Missing,
            Err(e) => {
                tracing::warn!(session_id = %session_id, workload_id = %workload_id, error = %e, "Failed to inspect workload");
                WorkloadStatus::Unknown
            }
        },
    };

    Ok(Json(SessionStatusResponse { status }))
}
