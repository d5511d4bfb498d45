//! Frame sampling
//!
//! Decides which raw camera frames become timelapse frames. A frame is kept
//! when at least one sampling interval of wall-clock time has passed since the
//! last kept frame; kept frames are stamped with contiguous output timestamps
//! at the fixed output frame rate, which is what compresses real time.

use crate::recorder::state::RecordingState;
use crate::utils::error::{CaptureError, CaptureResult};
use std::time::Duration;

/// Outcome of offering a raw frame to the sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDecision {
    Accept {
        sequence_index: u64,
        output_timestamp: Duration,
    },
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Session is not in the Recording state
    NotRecording,
    /// Less than one interval since the last kept frame
    TooSoon,
}

/// Per-session sampling cursor
#[derive(Debug, Clone)]
pub struct FrameSampler {
    interval: Duration,
    output_frame_rate: u32,
    last_sample: Option<Duration>,
}

impl FrameSampler {
    pub fn new(interval: Duration, output_frame_rate: u32) -> Self {
        Self {
            interval,
            output_frame_rate,
            last_sample: None,
        }
    }

    /// Decide whether a frame captured at `captured_at` should be kept.
    /// Does not advance the cursor; call [`FrameSampler::commit`] once the
    /// frame has actually been stored.
    pub fn decide(&self, state: RecordingState, captured_at: Duration, frame_count: u64) -> SampleDecision {
        if state != RecordingState::Recording {
            return SampleDecision::Drop(DropReason::NotRecording);
        }

        let due = match self.last_sample {
            None => true,
            Some(last) => captured_at > last && captured_at - last >= self.interval,
        };
        if !due {
            return SampleDecision::Drop(DropReason::TooSoon);
        }

        SampleDecision::Accept {
            sequence_index: frame_count,
            output_timestamp: output_timestamp(frame_count, self.output_frame_rate),
        }
    }

    /// Record that the frame captured at `captured_at` was kept
    pub fn commit(&mut self, captured_at: Duration) {
        self.last_sample = Some(captured_at);
    }
}

/// Position of frame `sequence_index` in the compiled video
pub fn output_timestamp(sequence_index: u64, output_frame_rate: u32) -> Duration {
    let nanos = sequence_index as u128 * 1_000_000_000 / output_frame_rate.max(1) as u128;
    Duration::from_nanos(nanos as u64)
}

/// Validate a user-supplied sampling interval in seconds
pub fn interval_from_secs(seconds: f64) -> CaptureResult<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(CaptureError::InvalidConfig(format!(
            "sampling interval must be a positive number of seconds, got {}",
            seconds
        )));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Expected frame count for `real` seconds of capture
pub fn expected_frames(real: Duration, interval: Duration) -> u64 {
    if interval.is_zero() {
        return 0;
    }
    (real.as_nanos() / interval.as_nanos()) as u64
}
