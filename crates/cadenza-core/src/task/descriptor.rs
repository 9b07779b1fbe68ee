use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::lyrics::validate_lyrics;
use super::segments::{parse_edit_segments, EditSegment};
use super::TaskKind;
use crate::error::ValidationError;

pub const MIN_AUDIO_LENGTH: u32 = 95;
pub const MAX_AUDIO_LENGTH: u32 = 285;
pub const DEFAULT_AUDIO_LENGTH: u32 = MIN_AUDIO_LENGTH;
pub const MAX_PROMPT_BYTES: usize = 1024;

/// Style conditioning for a task. Exactly one kind is ever stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StyleReference {
    /// An exemplar audio file stored under `input/`.
    Audio { file: String },
    /// A free-text style description.
    Prompt { text: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditInput {
    /// Song to edit, stored under `input/`.
    pub ref_song_file: String,
    pub segments: Vec<EditSegment>,
}

/// Validated job parameters persisted with the task. File references are
/// names inside the task's `input/` directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub lyrics_file: String,
    pub style: StyleReference,
    pub audio_length: u32,
    pub chunked: bool,
    pub batch_infer_num: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<EditInput>,
}

/// An uploaded file held in memory until the task directory exists.
#[derive(Clone, Debug)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Bytes,
}

impl Upload {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }
}

/// A raw, unvalidated submission as received from a client.
#[derive(Clone, Debug)]
pub struct Submission {
    pub kind: TaskKind,
    pub lyrics: Bytes,
    pub ref_audio: Option<Upload>,
    pub ref_prompt: Option<String>,
    pub audio_length: u32,
    pub chunked: bool,
    pub batch_infer_num: u32,
    pub ref_song: Option<Upload>,
    pub edit_segments: Option<String>,
}

impl Submission {
    /// A `generate` submission with default length, chunking and batch size.
    pub fn generate(lyrics: impl Into<Bytes>) -> Self {
        Self {
            kind: TaskKind::Generate,
            lyrics: lyrics.into(),
            ref_audio: None,
            ref_prompt: None,
            audio_length: DEFAULT_AUDIO_LENGTH,
            chunked: true,
            batch_infer_num: 1,
            ref_song: None,
            edit_segments: None,
        }
    }

    /// An `edit` submission of `ref_song` over `edit_segments`.
    pub fn edit(lyrics: impl Into<Bytes>, ref_song: Upload, edit_segments: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Edit,
            ref_song: Some(ref_song),
            edit_segments: Some(edit_segments.into()),
            ..Self::generate(lyrics)
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.ref_prompt = Some(prompt.into());
        self
    }

    pub fn with_ref_audio(mut self, upload: Upload) -> Self {
        self.ref_audio = Some(upload);
        self
    }

    pub fn with_audio_length(mut self, seconds: u32) -> Self {
        self.audio_length = seconds;
        self
    }

    /// Checks every submission constraint. Nothing is written on failure.
    pub fn validate(self) -> Result<ValidSubmission, ValidationError> {
        // A blank prompt counts as absent, like an empty form field.
        let prompt = self
            .ref_prompt
            .map(|p| p.trim().to_owned())
            .filter(|p| !p.is_empty());
        let style = match (self.ref_audio, prompt) {
            (Some(_), Some(_)) => return Err(ValidationError::ConflictingStyleReference),
            (None, None) => return Err(ValidationError::MissingStyleReference),
            (Some(audio), None) => {
                if audio.bytes.is_empty() {
                    return Err(ValidationError::EmptyUpload { field: "ref_audio" });
                }
                ValidStyle::Audio(audio)
            }
            (None, Some(text)) => {
                if text.len() > MAX_PROMPT_BYTES {
                    return Err(ValidationError::PromptTooLong {
                        len: text.len(),
                        max: MAX_PROMPT_BYTES,
                    });
                }
                ValidStyle::Prompt(text)
            }
        };

        if !(MIN_AUDIO_LENGTH..=MAX_AUDIO_LENGTH).contains(&self.audio_length) {
            return Err(ValidationError::AudioLength(self.audio_length));
        }
        if self.batch_infer_num < 1 {
            return Err(ValidationError::BatchCount(self.batch_infer_num));
        }

        let lyrics = validate_lyrics(&self.lyrics)?;

        let edit = match self.kind {
            TaskKind::Generate => {
                if self.ref_song.is_some() {
                    return Err(ValidationError::UnexpectedEditField { field: "ref_song" });
                }
                if self.edit_segments.is_some() {
                    return Err(ValidationError::UnexpectedEditField {
                        field: "edit_segments",
                    });
                }
                None
            }
            TaskKind::Edit => {
                let song = self.ref_song.ok_or(ValidationError::MissingReferenceSong)?;
                if song.bytes.is_empty() {
                    return Err(ValidationError::EmptyUpload { field: "ref_song" });
                }
                let raw = self
                    .edit_segments
                    .ok_or(ValidationError::MissingEditSegments)?;
                Some((song, parse_edit_segments(&raw)?))
            }
        };

        Ok(ValidSubmission {
            kind: self.kind,
            lyrics,
            style,
            audio_length: self.audio_length,
            chunked: self.chunked,
            batch_infer_num: self.batch_infer_num,
            edit,
        })
    }
}

#[derive(Clone, Debug)]
pub enum ValidStyle {
    Audio(Upload),
    Prompt(String),
}

/// A submission that passed [`Submission::validate`].
#[derive(Clone, Debug)]
pub struct ValidSubmission {
    pub kind: TaskKind,
    pub lyrics: String,
    pub style: ValidStyle,
    pub audio_length: u32,
    pub chunked: bool,
    pub batch_infer_num: u32,
    pub edit: Option<(Upload, Vec<EditSegment>)>,
}
