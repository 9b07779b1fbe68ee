//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON body
//! `{"error": "..."}` with a matching status code.
//!
//! Storage and registry failures are logged with full detail but only
//! a generic message is returned, so file paths never leak to clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cadenza_core::TaskError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the task registry.
    #[error("task error: {0}")]
    Task(#[from] TaskError),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The request body exceeded the upload limit.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::PayloadTooLarge(m) => (StatusCode::PAYLOAD_TOO_LARGE, m.clone()),

            ServerError::Task(e) => match e {
                TaskError::Validation(v) => (StatusCode::BAD_REQUEST, v.to_string()),
                TaskError::NotFound(_) => (StatusCode::NOT_FOUND, "Task not found".to_owned()),
                TaskError::DownloadNotReady { status, .. } => (
                    StatusCode::CONFLICT,
                    format!("Task is not completed yet. Current status: {status}"),
                ),
                TaskError::QueueFull { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Task queue is full; retry later".to_owned(),
                ),
                TaskError::QueueClosed
                | TaskError::InvalidTransition { .. }
                | TaskError::Store(_) => {
                    error!(error = %e, "task registry error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error".to_owned(),
                    )
                }
            },
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::body::to_bytes;
    use cadenza_core::{StoreError, TaskId, TaskStatus, ValidationError};
    use tracing_test::traced_test;

    fn status_of(err: ServerError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn task_errors_map_to_status_codes() {
        let id = TaskId::new();
        assert_eq!(
            status_of(TaskError::Validation(ValidationError::ConflictingStyleReference).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(TaskError::NotFound(id).into()), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(
                TaskError::DownloadNotReady {
                    id,
                    status: TaskStatus::Processing
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(TaskError::QueueFull { capacity: 1 }.into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(TaskError::QueueClosed.into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn storage_failure_is_logged_but_not_exposed() {
        let err: ServerError = TaskError::Store(StoreError::Io {
            path: "/srv/cadenza/secret-dir/metadata.json".into(),
            source: std::io::Error::other("disk on fire"),
        })
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "internal server error");
        assert!(logs_contain("disk on fire"));
        assert!(logs_contain("secret-dir"));
    }
}
