use cadenza_core::{Task, TaskId};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Returned by `POST /api/generate` and `POST /api/edit`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmitResponse {
    pub task_id: String,
    /// Always `queued` on acceptance.
    pub status: String,
    pub message: String,
}

impl SubmitResponse {
    pub fn queued(id: TaskId, message: &str) -> Self {
        Self {
            task_id: id.to_string(),
            status: "queued".to_owned(),
            message: message.to_owned(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TaskStatusResponse {
    pub task_id: String,
    /// `generate` or `edit`.
    pub kind: String,
    /// `queued`, `processing`, `completed` or `failed`.
    pub status: String,
    /// 0-100; 100 only once completed.
    pub progress: u8,
    pub message: Option<String>,
    /// Primary artifact, relative to the task directory. Set only when completed.
    pub output_path: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
    /// Set only when failed.
    pub error: Option<String>,
}

impl From<Task> for TaskStatusResponse {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id.to_string(),
            kind: task.kind.to_string(),
            status: task.status.to_string(),
            progress: task.progress,
            message: task.message,
            output_path: task.output_path,
            created_at: task.created_at.to_rfc3339(),
            completed_at: task.completed_at.map(|t| t.to_rfc3339()),
            error: task.error,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteResponse {
    pub message: String,
    /// `false` when the task was already gone.
    pub deleted: bool,
}

/// Multipart form accepted by `POST /api/generate`.
#[allow(dead_code)]
#[derive(ToSchema)]
pub struct GenerateForm {
    /// Timed lyrics (`.lrc`).
    #[schema(format = Binary)]
    pub lyrics: String,
    /// Style exemplar audio; exclusive with `ref_prompt`.
    #[schema(format = Binary)]
    pub ref_audio: Option<String>,
    /// Style description; exclusive with `ref_audio`.
    pub ref_prompt: Option<String>,
    /// Seconds: 95, or 96-285. Defaults to 95.
    pub audio_length: Option<u32>,
    /// Chunked decoding. Defaults to true.
    pub chunked: Option<bool>,
    /// Songs per batch. Defaults to 1.
    pub batch_infer_num: Option<u32>,
}

/// Multipart form accepted by `POST /api/edit`.
#[allow(dead_code)]
#[derive(ToSchema)]
pub struct EditForm {
    #[schema(format = Binary)]
    pub lyrics: String,
    /// The song whose segments are regenerated.
    #[schema(format = Binary)]
    pub ref_song: String,
    /// JSON list of `[start, end]` pairs in seconds; `-1` marks an open end,
    /// e.g. `[[-1,25],[50,-1]]`.
    pub edit_segments: String,
    #[schema(format = Binary)]
    pub ref_audio: Option<String>,
    pub ref_prompt: Option<String>,
    pub audio_length: Option<u32>,
    pub chunked: Option<bool>,
    pub batch_infer_num: Option<u32>,
}
