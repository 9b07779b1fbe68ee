//! Task status, download, deletion and listing.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use cadenza_core::TaskId;
use tracing::info;
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::task::{DeleteResponse, TaskStatusResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(get_status, download_result, delete_task, list_tasks),
    components(schemas(TaskStatusResponse, DeleteResponse))
)]
pub struct TasksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status/{task_id}", get(get_status))
        .route("/download/{task_id}", get(download_result))
        .route("/tasks/{task_id}", delete(delete_task))
        .route("/tasks", get(list_tasks))
}

/// Ids that are not UUIDs cannot name a task.
fn parse_id(raw: &str) -> Result<TaskId, ServerError> {
    raw.parse()
        .map_err(|_| ServerError::NotFound("Task not found".to_owned()))
}

#[utoipa::path(
    get,
    path = "/api/status/{task_id}",
    tag = "tasks",
    params(("task_id" = String, Path, description = "Task id returned on submission")),
    responses(
        (status = 200, description = "Current task state", body = TaskStatusResponse),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ServerError> {
    let id = parse_id(&task_id)?;
    let task = state.registry.get(id)?;
    Ok(Json(task.into()))
}

/// Download the generated WAV of a completed task.
#[utoipa::path(
    get,
    path = "/api/download/{task_id}",
    tag = "tasks",
    params(("task_id" = String, Path, description = "Task id returned on submission")),
    responses(
        (status = 200, description = "Generated audio", content_type = "audio/wav"),
        (status = 404, description = "Task or output not found"),
        (status = 409, description = "Task not completed yet"),
    )
)]
pub async fn download_result(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let id = parse_id(&task_id)?;
    let (task, audio) = state.registry.download(id).await?;
    let headers = [
        (header::CONTENT_TYPE, "audio/wav".to_owned()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.wav\"", task.id),
        ),
    ];
    Ok((headers, audio))
}

/// Delete a task and its files. Deleting an unknown task succeeds.
///
/// A task still processing keeps running, but its result is discarded.
#[utoipa::path(
    delete,
    path = "/api/tasks/{task_id}",
    tag = "tasks",
    params(("task_id" = String, Path, description = "Task id returned on submission")),
    responses((status = 200, description = "Task deleted", body = DeleteResponse))
)]
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<DeleteResponse>, ServerError> {
    let deleted = match task_id.parse::<TaskId>() {
        Ok(id) => state.registry.delete(id).await?,
        Err(_) => false,
    };
    if deleted {
        info!(task_id = %task_id, "task deleted by client");
    }
    Ok(Json(DeleteResponse {
        message: format!("Task {task_id} deleted successfully"),
        deleted,
    }))
}

/// Every known task, newest first.
#[utoipa::path(
    get,
    path = "/api/tasks",
    tag = "tasks",
    responses((status = 200, description = "Tasks listed", body = [TaskStatusResponse]))
)]
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<TaskStatusResponse>> {
    Json(state.registry.list().into_iter().map(Into::into).collect())
}
