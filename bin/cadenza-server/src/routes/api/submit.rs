//! Submission endpoints: `POST /api/generate` and `POST /api/edit`.
//!
//! Both accept multipart/form-data, validate it, persist the uploads and
//! return a task id immediately. Generation happens in the background; poll
//! `GET /api/status/{task_id}`.

use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use cadenza_core::task::DEFAULT_AUDIO_LENGTH;
use cadenza_core::{Submission, TaskKind, Upload};
use tracing::{debug, info};
use utoipa::OpenApi;

use crate::error::ServerError;
use crate::schemas::task::{EditForm, GenerateForm, SubmitResponse};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(generate, edit),
    components(schemas(SubmitResponse, GenerateForm, EditForm))
)]
pub struct SubmitApi;

pub fn router(max_upload_bytes: usize) -> Router<Arc<AppState>> {
    Router::new()
        .route("/generate", post(generate))
        .route("/edit", post(edit))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}

/// Generate a song from timed lyrics and a style reference.
///
/// Exactly one of `ref_audio` or `ref_prompt` must be given.
#[utoipa::path(
    post,
    path = "/api/generate",
    tag = "tasks",
    request_body(content = GenerateForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Task queued", body = SubmitResponse),
        (status = 400, description = "Invalid submission"),
        (status = 413, description = "Upload too large"),
        (status = 503, description = "Queue full"),
    )
)]
pub async fn generate(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<SubmitResponse>, ServerError> {
    let submission = read_submission(TaskKind::Generate, multipart).await?;
    let task = state.registry.enqueue(submission).await?;
    info!(task_id = %task.id, "generation task accepted");
    Ok(Json(SubmitResponse::queued(
        task.id,
        "Music generation task queued successfully",
    )))
}

/// Regenerate segments of an existing song.
///
/// `edit_segments` is a JSON list of `[start, end]` pairs in seconds, with
/// `-1` for the start or end of the song, e.g. `[[-1,25],[50,-1]]`.
#[utoipa::path(
    post,
    path = "/api/edit",
    tag = "tasks",
    request_body(content = EditForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Task queued", body = SubmitResponse),
        (status = 400, description = "Invalid submission"),
        (status = 413, description = "Upload too large"),
        (status = 503, description = "Queue full"),
    )
)]
pub async fn edit(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<SubmitResponse>, ServerError> {
    let submission = read_submission(TaskKind::Edit, multipart).await?;
    let task = state.registry.enqueue(submission).await?;
    info!(task_id = %task.id, "edit task accepted");
    Ok(Json(SubmitResponse::queued(
        task.id,
        "Music editing task queued successfully",
    )))
}

/// Collect form fields into an unvalidated [`Submission`]. Only shape
/// errors (unreadable parts, non-numeric numbers) are reported here.
async fn read_submission(kind: TaskKind, mut multipart: Multipart) -> Result<Submission, ServerError> {
    let mut lyrics: Option<Bytes> = None;
    let mut submission = Submission {
        kind,
        lyrics: Bytes::new(),
        ref_audio: None,
        ref_prompt: None,
        audio_length: DEFAULT_AUDIO_LENGTH,
        chunked: true,
        batch_infer_num: 1,
        ref_song: None,
        edit_segments: None,
    };

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "lyrics" => lyrics = read_file(field).await?.map(|upload| upload.bytes),
            "ref_audio" => submission.ref_audio = read_file(field).await?,
            "ref_song" => submission.ref_song = read_file(field).await?,
            "ref_prompt" => submission.ref_prompt = read_text(field).await?,
            "edit_segments" => submission.edit_segments = read_text(field).await?,
            "audio_length" => {
                if let Some(v) = read_text(field).await? {
                    submission.audio_length = parse_number(&name, &v)?;
                }
            }
            "batch_infer_num" => {
                if let Some(v) = read_text(field).await? {
                    submission.batch_infer_num = parse_number(&name, &v)?;
                }
            }
            "chunked" => {
                if let Some(v) = read_text(field).await? {
                    submission.chunked = parse_bool(&v).ok_or_else(|| {
                        ServerError::BadRequest(format!("chunked must be a boolean, got '{v}'"))
                    })?;
                }
            }
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    submission.lyrics =
        lyrics.ok_or_else(|| ServerError::BadRequest("lyrics file is required".to_owned()))?;
    Ok(submission)
}

/// A file part. Browsers send an empty, unnamed part for an unset file
/// input; that counts as absent.
async fn read_file(field: Field<'_>) -> Result<Option<Upload>, ServerError> {
    let file_name = field.file_name().unwrap_or_default().to_owned();
    let bytes = field.bytes().await.map_err(multipart_error)?;
    if file_name.is_empty() && bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(Upload::new(file_name, bytes)))
}

async fn read_text(field: Field<'_>) -> Result<Option<String>, ServerError> {
    let text = field.text().await.map_err(multipart_error)?;
    let text = text.trim();
    Ok((!text.is_empty()).then(|| text.to_owned()))
}

fn parse_number(name: &str, value: &str) -> Result<u32, ServerError> {
    value
        .parse()
        .map_err(|_| ServerError::BadRequest(format!("{name} must be a non-negative integer, got '{value}'")))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn multipart_error(e: MultipartError) -> ServerError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::PayloadTooLarge(format!("upload exceeds the size limit: {}", e.body_text()))
    } else {
        ServerError::BadRequest(format!("Failed to read multipart field: {}", e.body_text()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn booleans() {
        assert_eq!(parse_bool("True"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn numbers_must_be_integers() {
        assert_eq!(parse_number("audio_length", "120").unwrap(), 120);
        assert!(matches!(
            parse_number("audio_length", "95.5"),
            Err(ServerError::BadRequest(_))
        ));
    }
}
