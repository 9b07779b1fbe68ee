//! Edit-segment parsing.
//!
//! Segments arrive as a JSON list of `[start, end]` pairs in seconds. `-1`
//! is a sentinel: as a start it means "from the beginning of the audio", as
//! an end it means "to the end of the audio".

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const OPEN_BOUND: f64 = -1.0;

/// A time range of an existing song to regenerate. `None` bounds are open.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "[f64; 2]", try_from = "[f64; 2]")]
pub struct EditSegment {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl EditSegment {
    fn lower(&self) -> f64 {
        self.start.unwrap_or(0.0)
    }

    fn upper(&self) -> f64 {
        self.end.unwrap_or(f64::INFINITY)
    }
}

impl fmt::Display for EditSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            Some(s) => write!(f, "{s}s")?,
            None => f.write_str("start")?,
        }
        f.write_str("-to-")?;
        match self.end {
            Some(e) => write!(f, "{e}s"),
            None => f.write_str("end"),
        }
    }
}

impl From<EditSegment> for [f64; 2] {
    fn from(seg: EditSegment) -> Self {
        [seg.start.unwrap_or(OPEN_BOUND), seg.end.unwrap_or(OPEN_BOUND)]
    }
}

impl TryFrom<[f64; 2]> for EditSegment {
    type Error = ValidationError;

    fn try_from([start, end]: [f64; 2]) -> Result<Self, Self::Error> {
        let start = bound(start, "start")?;
        let end = bound(end, "end")?;
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Err(ValidationError::EditSegments(format!(
                    "segment start ({s}) must be before its end ({e})"
                )));
            }
        }
        Ok(Self { start, end })
    }
}

fn bound(value: f64, which: &str) -> Result<Option<f64>, ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::EditSegments(format!(
            "segment {which} must be a finite number"
        )));
    }
    if value == OPEN_BOUND {
        return Ok(None);
    }
    if value < 0.0 {
        return Err(ValidationError::EditSegments(format!(
            "segment {which} ({value}) is negative; use -1 for an open bound"
        )));
    }
    Ok(Some(value))
}

/// Parses and validates `[[start, end], ...]`.
///
/// The list must be non-empty and its segments must not overlap (touching
/// boundaries are allowed). Returned segments are sorted by start time.
pub fn parse_edit_segments(raw: &str) -> Result<Vec<EditSegment>, ValidationError> {
    let pairs: Vec<Vec<f64>> = serde_json::from_str(raw.trim()).map_err(|e| {
        ValidationError::EditSegments(format!("expected [[start,end],...]: {e}"))
    })?;
    if pairs.is_empty() {
        return Err(ValidationError::EditSegments(
            "at least one segment is required".to_owned(),
        ));
    }

    let mut segments = pairs
        .into_iter()
        .map(|pair| match pair.as_slice() {
            [start, end] => EditSegment::try_from([*start, *end]),
            other => Err(ValidationError::EditSegments(format!(
                "each segment needs exactly 2 values, got {}",
                other.len()
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    segments.sort_by(|a, b| a.lower().total_cmp(&b.lower()));
    for pair in segments.windows(2) {
        if pair[0].upper() > pair[1].lower() {
            return Err(ValidationError::EditSegments(format!(
                "segments {} and {} overlap",
                pair[0], pair[1]
            )));
        }
    }
    Ok(segments)
}

/// Serialises segments back into the `-1`-sentinel wire form.
pub fn segments_to_json(segments: &[EditSegment]) -> String {
    let pairs: Vec<[f64; 2]> = segments.iter().map(|s| (*s).into()).collect();
    serde_json::to_string(&pairs).unwrap_or_else(|_| "[]".to_owned())
}
