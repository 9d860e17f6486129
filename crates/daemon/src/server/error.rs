//! Mapping of session errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol::{CapacityExceededBody, ErrorBody};
use thiserror::Error;

use crate::session::SessionError;

/// Error returned by every session-surface handler.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The request body could not be decoded.
    #[error("invalid request body: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Session(err) => match err {
                SessionError::NotFound(_) => StatusCode::NOT_FOUND,
                SessionError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
                SessionError::Unattached(_) => StatusCode::BAD_REQUEST,
                SessionError::AlreadyBridged(_) => StatusCode::CONFLICT,
                SessionError::Runtime(_) | SessionError::Channel(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Session(SessionError::NotFound(_)) => "Session not found".to_string(),
            ApiError::Session(SessionError::Unattached(_)) => {
                "Session has no workload attached".to_string()
            }
            ApiError::Session(SessionError::AlreadyBridged(_)) => {
                "Session already has an active terminal".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let ApiError::Session(SessionError::CapacityExceeded { active, capacity }) = self {
            let body = CapacityExceededBody::new(active, capacity);
            return (status, Json(body)).into_response();
        }

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        (status, Json(ErrorBody::new(self.message()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeError;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (SessionError::NotFound("s".into()), StatusCode::NOT_FOUND),
            (
                SessionError::CapacityExceeded {
                    active: 1,
                    capacity: 1,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (SessionError::Unattached("s".into()), StatusCode::BAD_REQUEST),
            (SessionError::AlreadyBridged("s".into()), StatusCode::CONFLICT),
            (
                SessionError::Runtime(RuntimeError::NotFound("w".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status_code(), expected);
        }
        assert_eq!(
            ApiError::BadRequest("eof".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_capacity_body() {
        let response = ApiError::from(SessionError::CapacityExceeded {
            active: 40,
            capacity: 40,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["error"], "Server at capacity");
        assert_eq!(body["active_sessions"], 40);
        assert_eq!(body["max_sessions"], 40);
        assert!(body["message"].as_str().unwrap().contains("try again"));
    }

    #[tokio::test]
    async fn test_not_found_body() {
        let response = ApiError::from(SessionError::NotFound("abc".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "Session not found");
    }
}
