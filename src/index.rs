//! Per-session frame index.
//!
//! One `FrameMeta` per stored frame, at the same ordinal. The persisted form is
//! line oriented: `<start_time>,<end_time>\n` in decimal microseconds.

use crate::error::{Error, Result};

/// Timing record of one frame, in microseconds since the epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameMeta {
    /// When the frame was requested from the device.
    pub start_time: i64,
    /// When the frame was fully received.
    pub end_time: i64,
}

impl FrameMeta {
    pub fn new(start_time: i64, end_time: i64) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    pub fn contains(&self, time: i64) -> bool {
        self.start_time <= time && time <= self.end_time
    }
}

/// Serialises the full index. Output is empty for an empty slice.
pub fn encode_index(frames: &[FrameMeta]) -> String {
    let mut out = String::with_capacity(frames.len() * 34);
    for frame in frames {
        out.push_str(&frame.start_time.to_string());
        out.push(',');
        out.push_str(&frame.end_time.to_string());
        out.push('\n');
    }
    out
}

/// Parses a persisted index. Any malformed line fails the whole parse.
pub fn parse_index(session_id: &str, text: &str) -> Result<Vec<FrameMeta>> {
    let body = text.strip_suffix('\n').unwrap_or(text);
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let mut frames = Vec::new();
    for (idx, line) in body.split('\n').enumerate() {
        let bad = |reason: &str| Error::BadIndex {
            session: session_id.to_string(),
            line: idx + 1,
            reason: reason.to_string(),
        };
        let (start, end) = line
            .split_once(',')
            .ok_or_else(|| bad("expected <start>,<end>"))?;
        let start_time = start
            .parse::<i64>()
            .map_err(|_| bad("start time is not an integer"))?;
        let end_time = end
            .parse::<i64>()
            .map_err(|_| bad("end time is not an integer"))?;
        frames.push(FrameMeta::new(start_time, end_time));
    }
    Ok(frames)
}

/// Finds the frame closest to `target` microseconds after the first frame's
/// request time.
///
/// Single forward pass that stops where the distance to the target starts to
/// grow; correct only because start times are non-decreasing. A target exactly
/// between two frames resolves to the earlier one. Returns `None` when the
/// target lies past the end of the last frame.
pub fn nearest_frame(frames: &[FrameMeta], target: i64) -> Option<usize> {
    // i128 holds any difference of two i64 timestamps
    let base = i128::from(frames.first()?.start_time);
    let target = i128::from(target);
    // first ordinal of the current run of equal start times
    let mut run_start = 0;
    for (i, pair) in frames.windows(2).enumerate() {
        let offset = i128::from(pair[0].start_time) - base;
        let next_offset = i128::from(pair[1].start_time) - base;
        if next_offset == offset {
            continue;
        }
        if next_offset.abs_diff(target) >= offset.abs_diff(target) {
            return Some(run_start);
        }
        run_start = i + 1;
    }

    let last = frames.len() - 1;
    (base + target <= i128::from(frames[last].end_time)).then_some(last)
}

/// First ordinal whose `[start_time, end_time]` window contains `time`.
pub fn frame_containing(frames: &[FrameMeta], time: i64) -> Option<usize> {
    frames.iter().position(|frame| frame.contains(time))
}
