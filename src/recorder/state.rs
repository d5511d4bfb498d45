//! Recording state management
//!
//! Defines the recording state machine, active-time tracking and the
//! observable snapshot published to the UI layer.

use crate::capture::traits::{CameraPosition, Orientation};
use crate::export::types::CompiledVideo;
use crate::utils::error::{CaptureError, CaptureResult, ErrorResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Current state of the recording pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No session; frames are ignored
    #[default]
    Idle,
    /// Sampling frames and accumulating active time
    Recording,
    /// Session held open; frames dropped, clock frozen
    Paused,
    /// Capture finished, compilation not yet started
    Stopped,
    /// Frames are being assembled into a video
    Compiling,
    /// A compiled video is available
    Completed,
    /// Compilation failed
    Failed,
}

impl RecordingState {
    /// Recording or Paused
    pub fn is_capturing(&self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }

    /// Apply a transition, returning the next state
    pub fn apply(self, transition: Transition) -> CaptureResult<RecordingState> {
        use RecordingState::*;
        use Transition::*;

        match (self, transition) {
            (Idle, Start) => Ok(Recording),
            (Recording, Pause) => Ok(Paused),
            (Paused, Resume) => Ok(Recording),
            (Recording | Paused, Stop) => Ok(Stopped),
            (Stopped, BeginCompile) | (Failed, Retry) => Ok(Compiling),
            (Compiling, Complete) => Ok(Completed),
            (Stopped | Compiling, Fail) => Ok(Failed),
            (from, transition) => Err(CaptureError::InvalidStateTransition {
                from,
                action: transition.verb(),
            }),
        }
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordingState::Idle => "idle",
            RecordingState::Recording => "recording",
            RecordingState::Paused => "paused",
            RecordingState::Stopped => "stopped",
            RecordingState::Compiling => "compiling",
            RecordingState::Completed => "completed",
            RecordingState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Edges of the recording state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Pause,
    Resume,
    Stop,
    BeginCompile,
    Complete,
    Fail,
    Retry,
}

impl Transition {
    pub fn verb(&self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Pause => "pause",
            Transition::Resume => "resume",
            Transition::Stop => "stop",
            Transition::BeginCompile => "compile",
            Transition::Complete => "complete",
            Transition::Fail => "fail",
            Transition::Retry => "retry compilation",
        }
    }
}

/// One uninterrupted stretch of Recording state
///
/// A new span is opened each time recording is started or resumed.
#[derive(Debug, Clone)]
pub struct ActiveSpan {
    /// Monotonic time the span opened
    pub started_at: Instant,

    /// Monotonic time the span closed, if it has
    pub ended_at: Option<Instant>,
}

impl ActiveSpan {
    fn duration(&self, now: Instant) -> Duration {
        self.ended_at
            .unwrap_or(now)
            .saturating_duration_since(self.started_at)
    }
}

/// Accumulates time spent in the Recording state only
#[derive(Debug, Clone, Default)]
pub struct ActiveClock {
    spans: Vec<ActiveSpan>,
}

impl ActiveClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a span; no-op if one is already running
    pub fn resume(&mut self, now: Instant) {
        if self.is_running() {
            return;
        }
        self.spans.push(ActiveSpan {
            started_at: now,
            ended_at: None,
        });
    }

    /// Close the running span; no-op if none is running
    pub fn pause(&mut self, now: Instant) {
        if let Some(span) = self.spans.last_mut() {
            if span.ended_at.is_none() {
                span.ended_at = Some(now);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.spans.last().is_some_and(|s| s.ended_at.is_none())
    }

    /// Total active time as of `now`
    pub fn active(&self, now: Instant) -> Duration {
        self.spans.iter().map(|s| s.duration(now)).sum()
    }

    pub fn spans(&self) -> &[ActiveSpan] {
        &self.spans
    }
}

/// One in-progress recording
#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub id: Uuid,
    pub state: RecordingState,
    pub sampling_interval: Duration,
    pub output_frame_rate: u32,
    pub orientation: Orientation,
    pub audio_enabled: bool,
    pub frame_count: u64,
    pub started_at: DateTime<Utc>,
    clock: ActiveClock,
}

impl CaptureSession {
    /// Create a session already in the Recording state
    pub fn start(
        sampling_interval: Duration,
        output_frame_rate: u32,
        orientation: Orientation,
        audio_enabled: bool,
        now: Instant,
    ) -> CaptureResult<Self> {
        let state = RecordingState::Idle.apply(Transition::Start)?;
        let mut clock = ActiveClock::new();
        clock.resume(now);
        Ok(Self {
            id: Uuid::new_v4(),
            state,
            sampling_interval,
            output_frame_rate,
            orientation,
            audio_enabled,
            frame_count: 0,
            started_at: Utc::now(),
            clock,
        })
    }

    /// Move along `transition`, keeping the clock in step.
    /// On error the session is left exactly as it was.
    pub fn transition(&mut self, transition: Transition, now: Instant) -> CaptureResult<()> {
        let next = self.state.apply(transition)?;
        match next {
            RecordingState::Recording => self.clock.resume(now),
            _ => self.clock.pause(now),
        }
        tracing::debug!("Session {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn active_duration(&self, now: Instant) -> Duration {
        self.clock.active(now)
    }

    pub fn clock(&self) -> &ActiveClock {
        &self.clock
    }
}

/// Point-in-time view of the pipeline for observers
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderSnapshot {
    pub state: RecordingState,
    pub frame_count: u64,
    pub active_duration: Duration,
    pub is_compiling: bool,
    pub compiled_video: Option<CompiledVideo>,
    pub last_error: Option<ErrorResponse>,
    pub position: Option<CameraPosition>,
    pub orientation: Orientation,
    pub audio_enabled: bool,
    pub sampling_interval_secs: f64,
    /// A failed compilation kept its frames and may be retried
    pub can_retry: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_lifecycle() {
        let mut state = RecordingState::Idle;
        for t in [
            Transition::Start,
            Transition::Pause,
            Transition::Resume,
            Transition::Stop,
            Transition::BeginCompile,
            Transition::Complete,
        ] {
            state = state.apply(t).unwrap();
        }
        assert_eq!(state, RecordingState::Completed);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(RecordingState::Idle.apply(Transition::Pause).is_err());
        assert!(RecordingState::Paused.apply(Transition::Pause).is_err());
        assert!(RecordingState::Recording.apply(Transition::Resume).is_err());
        assert!(RecordingState::Recording.apply(Transition::Start).is_err());
        assert!(RecordingState::Idle.apply(Transition::Stop).is_err());
        assert!(RecordingState::Completed.apply(Transition::Retry).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_excludes_paused_time() {
        let t0 = Instant::now();
        let mut session =
            CaptureSession::start(Duration::from_secs(2), 30, Orientation::Portrait, false, t0)
                .unwrap();

        let t1 = t0 + Duration::from_secs(10);
        session.transition(Transition::Pause, t1).unwrap();
        let t2 = t1 + Duration::from_secs(300);
        assert_eq!(session.active_duration(t2), Duration::from_secs(10));

        session.transition(Transition::Resume, t2).unwrap();
        let t3 = t2 + Duration::from_secs(5);
        assert_eq!(session.active_duration(t3), Duration::from_secs(15));
        assert_eq!(session.clock().spans().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_transition_leaves_session_untouched() {
        let t0 = Instant::now();
        let mut session =
            CaptureSession::start(Duration::from_secs(2), 30, Orientation::Portrait, false, t0)
                .unwrap();

        let err = session
            .transition(Transition::Resume, t0 + Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::InvalidStateTransition {
                from: RecordingState::Recording,
                action: "resume"
            }
        ));
        assert_eq!(session.state, RecordingState::Recording);
        assert!(session.clock().is_running());
    }
}
