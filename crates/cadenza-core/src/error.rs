//! Error taxonomy for the task orchestration core.
//!
//! Submission-time failures ([`ValidationError`]) are returned to the caller
//! before any task exists. Processing-time failures ([`ExecutionError`]) are
//! captured into the task record and only surface through status polls.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Failure message recorded on tasks found mid-processing at startup.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// A submission violated one of the input constraints.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Either ref_audio or ref_prompt must be provided")]
    MissingStyleReference,

    #[error("Only one of ref_audio or ref_prompt should be provided")]
    ConflictingStyleReference,

    #[error("Audio length must be 95 or between 96-285 seconds (got {0})")]
    AudioLength(u32),

    #[error("batch_infer_num must be at least 1 (got {0})")]
    BatchCount(u32),

    #[error("ref_prompt is too long ({len} bytes, max {max})")]
    PromptTooLong { len: usize, max: usize },

    #[error("uploaded file '{field}' is empty")]
    EmptyUpload { field: &'static str },

    #[error("invalid lyrics: {0}")]
    Lyrics(String),

    #[error("edit tasks require a reference song")]
    MissingReferenceSong,

    #[error("edit tasks require edit_segments")]
    MissingEditSegments,

    #[error("invalid edit_segments: {0}")]
    EditSegments(String),

    #[error("'{field}' is only accepted for edit tasks")]
    UnexpectedEditField { field: &'static str },
}

/// Persistence failures raised by [`crate::store::FsTaskStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found in storage")]
    NotFound(TaskId),

    #[error("task {0} already exists in storage")]
    AlreadyExists(TaskId),

    #[error("corrupt metadata for task {id}: {source}")]
    Corrupt {
        id: TaskId,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StoreError {
        let path = path.into();
        move |source| StoreError::Io { path, source }
    }
}

/// The Generation Executor could not produce audio.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("generation failed: {0}")]
    Failed(String),

    #[error("generation produced no audio")]
    NoOutput,

    #[error("generation timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("generation panicked: {0}")]
    Panicked(String),

    #[error("audio encoding failed: {0}")]
    Encode(String),

    #[error("executor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by [`crate::registry::TaskRegistry`] operations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {id} is not completed yet (status: {status})")]
    DownloadNotReady { id: TaskId, status: TaskStatus },

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("task queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Store(#[from] StoreError),
}
