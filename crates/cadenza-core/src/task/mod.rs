//! Task model and lifecycle state machine.
//!
//! ```text
//! queued --> processing --> completed
//!                      \--> failed
//! ```
//!
//! Transitions are one-directional. `output_path` is set exactly when a task
//! is `completed`, `error` exactly when it is `failed`.

mod descriptor;
mod lyrics;
mod segments;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::TaskError;

pub use descriptor::{
    EditInput, InputDescriptor, StyleReference, Submission, Upload, ValidSubmission, ValidStyle,
    DEFAULT_AUDIO_LENGTH, MAX_AUDIO_LENGTH, MAX_PROMPT_BYTES, MIN_AUDIO_LENGTH,
};
pub use lyrics::validate_lyrics;
pub use segments::{parse_edit_segments, segments_to_json, EditSegment};

/// Opaque task handle; also the name of the task's storage directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskKind {
    Generate,
    Edit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }
}

/// The persisted metadata record of one task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Primary artifact, relative to the task directory.
    #[serde(default)]
    pub output_path: Option<String>,
    /// Every artifact written to `output/`, primary first.
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub input: InputDescriptor,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A freshly submitted task in the `queued` state.
    pub fn new(id: TaskId, kind: TaskKind, input: InputDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            status: TaskStatus::Queued,
            progress: 0,
            message: Some("queued".to_owned()),
            error: None,
            output_path: None,
            artifacts: Vec::new(),
            input,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.transition(TaskStatus::Processing)?;
        self.progress = 0;
        self.message = Some("processing".to_owned());
        self.updated_at = now;
        Ok(())
    }

    /// Records executor progress. Values never decrease and stay below 100
    /// until the task completes. Returns `true` when the record changed.
    pub fn set_progress(&mut self, percent: u8, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Processing {
            return false;
        }
        let percent = percent.min(99);
        if percent <= self.progress {
            return false;
        }
        self.progress = percent;
        self.updated_at = now;
        true
    }

    /// `artifacts` are paths relative to the task directory, primary first.
    pub fn mark_completed(
        &mut self,
        artifacts: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        self.transition(TaskStatus::Completed)?;
        self.progress = 100;
        self.message = Some("completed".to_owned());
        self.output_path = artifacts.first().cloned();
        self.artifacts = artifacts;
        self.error = None;
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.transition(TaskStatus::Failed)?;
        let error = error.into();
        self.message = Some(format!("failed: {error}"));
        self.error = Some(error);
        self.output_path = None;
        self.artifacts.clear();
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Created strictly before `cutoff`.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.created_at < cutoff
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn prompt_task() -> Task {
        Task::new(
            TaskId::new(),
            TaskKind::Generate,
            InputDescriptor {
                lyrics_file: "lyrics.lrc".into(),
                style: StyleReference::Prompt {
                    text: "folk, acoustic guitar".into(),
                },
                audio_length: 95,
                chunked: true,
                batch_infer_num: 1,
                edit: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn new_task_is_queued_with_zero_progress() {
        let task = prompt_task();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress, 0);
        assert!(task.completed_at.is_none());
        assert!(task.output_path.is_none());
        assert!(task.error.is_none());
    }

    #[test]
    fn happy_path_sets_output_and_full_progress() {
        let mut task = prompt_task();
        task.mark_processing(Utc::now()).unwrap();
        assert!(task.set_progress(40, Utc::now()));
        task.mark_completed(vec!["output/output.wav".into()], Utc::now())
            .unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.output_path.as_deref(), Some("output/output.wav"));
        assert!(task.error.is_none());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn failure_sets_error_and_clears_output() {
        let mut task = prompt_task();
        task.mark_processing(Utc::now()).unwrap();
        task.mark_failed("model exploded", Utc::now()).unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("model exploded"));
        assert!(task.output_path.is_none());
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn progress_is_monotonic_and_capped_below_completion() {
        let mut task = prompt_task();
        assert!(!task.set_progress(10, Utc::now()), "queued tasks ignore progress");

        task.mark_processing(Utc::now()).unwrap();
        assert!(task.set_progress(30, Utc::now()));
        assert!(!task.set_progress(20, Utc::now()));
        assert_eq!(task.progress, 30);
        assert!(task.set_progress(100, Utc::now()));
        assert_eq!(task.progress, 99);
    }

    #[test]
    fn terminal_states_do_not_reenter_the_machine() {
        let mut task = prompt_task();
        assert!(matches!(
            task.mark_completed(vec![], Utc::now()),
            Err(TaskError::InvalidTransition { .. })
        ));

        task.mark_processing(Utc::now()).unwrap();
        task.mark_failed("boom", Utc::now()).unwrap();
        assert!(task.mark_processing(Utc::now()).is_err());
        assert!(task.mark_completed(vec!["output/output.wav".into()], Utc::now()).is_err());
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[test]
    fn transition_table() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Processing.can_transition_to(Queued));
    }

    #[test]
    fn status_strings_round_trip() {
        assert_eq!(TaskStatus::Processing.to_string(), "processing");
        assert_eq!("completed".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert_eq!(TaskKind::Edit.to_string(), "edit");
    }

    #[test]
    fn task_id_rejects_path_like_input() {
        assert!("../etc".parse::<TaskId>().is_err());
        let id = TaskId::new();
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
    }
}
