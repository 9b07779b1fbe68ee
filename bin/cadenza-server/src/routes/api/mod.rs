pub mod submit;
pub mod tasks;

use std::sync::Arc;

use axum::Router;
use utoipa::OpenApi;

use crate::state::AppState;

/// Routes nested under `/api`.
pub fn router(max_upload_bytes: usize) -> Router<Arc<AppState>> {
    Router::new()
        .merge(submit::router(max_upload_bytes))
        .merge(tasks::router())
}

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut spec = submit::SubmitApi::openapi();
    spec.merge(tasks::TasksApi::openapi());
    spec
}
