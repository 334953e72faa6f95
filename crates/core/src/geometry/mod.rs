//! Audible windows of timeline items.
//!
//! Pure functions that clip content segments and in-progress recordings
//! against their container and loop bounds. All values are in seconds.

use serde::{Deserialize, Serialize};

use crate::{LooplineError, Result};

/// Placement of a content segment relative to its parent clip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContentPlacement {
    pub start: f64,
    pub duration: f64,
    /// Offset into the source material at which the segment begins.
    #[serde(default)]
    pub offset: f64,
}

/// Placement of a clip on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipBounds {
    pub start: f64,
    pub duration: f64,
}

/// Timeline-absolute window of a content segment once clipped to its clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledWindow {
    pub start: f64,
    /// May be zero or negative, in which case nothing should be scheduled.
    pub duration: f64,
    pub offset: f64,
}

impl ScheduledWindow {
    pub fn is_audible(&self) -> bool {
        self.duration > 0.0
    }
}

/// Clips `content` against the bounds of `clip`.
///
/// The returned offset composes the segment's own source offset with the
/// part trimmed away when the segment starts before its clip.
pub fn calculate_event_scheduling(
    content: &ContentPlacement,
    clip: &ClipBounds,
) -> Result<ScheduledWindow> {
    if content.offset < 0.0 {
        return Err(LooplineError::NegativeOffset(content.offset));
    }

    let clip_end = clip.start + clip.duration;
    let content_start = clip.start + content.start;
    let content_end = content_start + content.duration;

    let start = content_start.max(clip.start);
    let end = content_end.min(clip_end);

    Ok(ScheduledWindow {
        start,
        duration: end - start,
        offset: content.offset + (-content.start).max(0.0),
    })
}

/// A recording that is still being captured or not yet finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRecording {
    pub audio_store_key: String,
    /// Start of the loop region the recording was made in.
    pub cab_start: f64,
    /// Length of that loop region. `None` when recording without a loop.
    pub cab_duration: Option<f64>,
    /// Timecode at which capture began.
    pub recording_start: f64,
    /// Input latency to subtract from `recording_start`.
    #[serde(default)]
    pub latency_compensation: f64,
}

/// Audible window of one loop pass of an [`ActiveRecording`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRecordingWindow {
    pub id: String,
    pub start: f64,
    /// `None` for recordings without a loop region.
    pub duration: Option<f64>,
    pub offset: f64,
}

/// Event id of the `loop_number`-th pass of the recording stored under `key`.
pub fn active_recording_event_id(key: &str, loop_number: u32) -> String {
    format!("active_{key}_{loop_number}")
}

/// Computes where the `loop_number`-th pass of an in-progress recording
/// should sound, and how far into the captured source it starts.
///
/// Pass 0 covers the (possibly partial) first pass. Every later pass plays
/// the whole loop region and keeps reading forward through the source.
pub fn create_active_recording_event(
    recording: &ActiveRecording,
    loop_number: u32,
) -> Result<ActiveRecordingWindow> {
    let id = active_recording_event_id(&recording.audio_store_key, loop_number);
    let recording_start = recording.recording_start - recording.latency_compensation;

    let Some(cab_duration) = recording.cab_duration else {
        if loop_number > 0 {
            return Err(LooplineError::InvalidLoopNumber(loop_number));
        }
        return Ok(ActiveRecordingWindow {
            id,
            start: recording.cab_start.max(recording_start),
            duration: None,
            offset: (recording.cab_start - recording_start).max(0.0),
        });
    };

    let relative_start = recording_start - recording.cab_start;
    let first_loop_start = relative_start.max(0.0);
    let first_loop_duration = cab_duration - first_loop_start;
    let first_loop_offset = (-relative_start).max(0.0);

    let window = if loop_number == 0 {
        ActiveRecordingWindow {
            id,
            start: recording.cab_start + first_loop_start,
            duration: Some(first_loop_duration),
            offset: first_loop_offset,
        }
    } else {
        ActiveRecordingWindow {
            id,
            start: recording.cab_start,
            duration: Some(cab_duration),
            offset: first_loop_offset
                + first_loop_duration
                + f64::from(loop_number - 1) * cab_duration,
        }
    };

    Ok(window)
}
