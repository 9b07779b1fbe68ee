//! Generation Executor: the pluggable backend that turns a stored task's
//! inputs into audio.

mod command;
mod silent;

pub use command::CommandExecutor;
pub use silent::SilentExecutor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::error::ExecutionError;
use crate::task::{EditSegment, StyleReference, Task, TaskId, TaskKind};

/// Runs one generation job.
///
/// Implementations return one WAV file per batch item. They may report
/// progress through `progress`; reports are advisory.
#[async_trait]
pub trait GenerationExecutor: Send + Sync + 'static {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    async fn generate(
        &self,
        request: GenerationRequest,
        progress: ProgressReporter,
    ) -> Result<Vec<Bytes>, ExecutionError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum StyleInput {
    Audio(PathBuf),
    Prompt(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct EditRequest {
    pub ref_song_path: PathBuf,
    pub segments: Vec<EditSegment>,
}

/// Everything a backend needs, with input files resolved to absolute paths.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub lyrics_path: PathBuf,
    pub style: StyleInput,
    pub audio_length: u32,
    pub chunked: bool,
    pub batch_infer_num: u32,
    pub edit: Option<EditRequest>,
}

impl GenerationRequest {
    /// Resolve `task`'s input descriptor against its `input/` directory.
    pub fn for_task(task: &Task, input_dir: &Path) -> Self {
        let input = &task.input;
        let style = match &input.style {
            StyleReference::Audio { file } => StyleInput::Audio(input_dir.join(file)),
            StyleReference::Prompt { text } => StyleInput::Prompt(text.clone()),
        };
        Self {
            task_id: task.id,
            kind: task.kind,
            lyrics_path: input_dir.join(&input.lyrics_file),
            style,
            audio_length: input.audio_length,
            chunked: input.chunked,
            batch_infer_num: input.batch_infer_num,
            edit: input.edit.as_ref().map(|edit| EditRequest {
                ref_song_path: input_dir.join(&edit.ref_song_file),
                segments: edit.segments.clone(),
            }),
        }
    }
}

/// Executor-side handle for publishing progress percentages.
///
/// Backed by a `watch` channel, so bursts coalesce and the consumer only
/// ever sees the latest value. Reports never decrease.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<u8>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, watch::Receiver<u8>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// A reporter nobody listens to.
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        self.tx.send_if_modified(|current| {
            if percent > *current {
                *current = percent;
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> u8 {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::{EditInput, InputDescriptor};
    use chrono::Utc;

    #[test]
    fn progress_is_monotonic() {
        let (reporter, rx) = ProgressReporter::channel();
        reporter.report(30);
        reporter.report(10);
        assert_eq!(*rx.borrow(), 30);
        reporter.report(250);
        assert_eq!(reporter.current(), 100);
    }

    #[test]
    fn request_resolves_input_paths() {
        let input = InputDescriptor {
            lyrics_file: "lyrics.lrc".into(),
            style: StyleReference::Audio { file: "ref_audio_a.wav".into() },
            audio_length: 120,
            chunked: false,
            batch_infer_num: 2,
            edit: Some(EditInput {
                ref_song_file: "ref_song_b.wav".into(),
                segments: crate::task::parse_edit_segments("[[0,10]]").unwrap(),
            }),
        };
        let task = Task::new(TaskId::new(), TaskKind::Edit, input, Utc::now());
        let dir = Path::new("/data/t/input");

        let request = GenerationRequest::for_task(&task, dir);
        assert_eq!(request.lyrics_path, dir.join("lyrics.lrc"));
        assert_eq!(request.style, StyleInput::Audio(dir.join("ref_audio_a.wav")));
        assert_eq!(request.edit.unwrap().ref_song_path, dir.join("ref_song_b.wav"));
        assert_eq!(request.batch_infer_num, 2);
    }
}
