//! Synthetic capture backend
//!
//! A camera that produces frames only when told to. Useful for headless runs
//! and for driving the pipeline deterministically: the [`SyntheticFeed`]
//! stands in for the platform's camera callback thread.

use crate::capture::traits::{
    AudioChunk, CameraBackend, CameraInfo, CameraPosition, FrameSink, Orientation,
    PermissionStatus, PixelFormat, QualityPreset, RawFrame, Resolution,
};
use crate::utils::error::{CaptureError, CaptureResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct SyntheticState {
    input: Option<CameraPosition>,
    sink: Option<FrameSink>,
    with_audio: bool,
    stream_starts: usize,
}

/// In-process camera backend
pub struct SyntheticCamera {
    state: Arc<Mutex<SyntheticState>>,
    positions: Vec<CameraPosition>,
    permission: PermissionStatus,
    failing_input: Option<CameraPosition>,
    frame_size: Resolution,
    native_orientation: Orientation,
}

impl SyntheticCamera {
    /// Front and back cameras, permission granted, 4x4 frames
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SyntheticState::default())),
            positions: vec![CameraPosition::Back, CameraPosition::Front],
            permission: PermissionStatus::Granted,
            failing_input: None,
            frame_size: Resolution {
                width: 4,
                height: 4,
            },
            native_orientation: Orientation::LandscapeRight,
        }
    }

    pub fn with_permission(mut self, permission: PermissionStatus) -> Self {
        self.permission = permission;
        self
    }

    pub fn with_positions(mut self, positions: &[CameraPosition]) -> Self {
        self.positions = positions.to_vec();
        self
    }

    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.frame_size = Resolution { width, height };
        self
    }

    /// Orientation the camera reports before any sensor update
    pub fn with_native_orientation(mut self, orientation: Orientation) -> Self {
        self.native_orientation = orientation;
        self
    }

    /// Make attaching the camera at `position` fail
    pub fn failing_input(mut self, position: CameraPosition) -> Self {
        self.failing_input = Some(position);
        self
    }

    /// Handle for pushing frames once the stream is running
    pub fn feed(&self) -> SyntheticFeed {
        SyntheticFeed {
            state: self.state.clone(),
            frame_size: self.frame_size,
        }
    }

    /// Read-only view of the backend's input/stream state
    pub fn monitor(&self) -> SyntheticMonitor {
        SyntheticMonitor {
            state: self.state.clone(),
        }
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for SyntheticCamera {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn permission_status(&self) -> PermissionStatus {
        self.permission
    }

    fn native_orientation(&self) -> Orientation {
        self.native_orientation
    }

    fn cameras(&self) -> Vec<CameraInfo> {
        self.positions
            .iter()
            .map(|&position| CameraInfo {
                id: format!("synthetic-{}", position),
                name: format!("Synthetic {} camera", position),
                position,
                supported_resolutions: vec![self.frame_size],
            })
            .collect()
    }

    fn add_input(&mut self, position: CameraPosition, _preset: QualityPreset) -> CaptureResult<()> {
        if self.failing_input == Some(position) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} camera refused the input",
                position
            )));
        }
        let mut state = self.state.lock();
        if state.input.is_some() {
            return Err(CaptureError::DeviceUnavailable(
                "an input is already attached".to_string(),
            ));
        }
        state.input = Some(position);
        Ok(())
    }

    fn remove_input(&mut self) {
        self.state.lock().input = None;
    }

    fn current_input(&self) -> Option<CameraPosition> {
        self.state.lock().input
    }

    fn start_stream(&mut self, sink: FrameSink, with_audio: bool) -> CaptureResult<()> {
        let mut state = self.state.lock();
        state.sink = Some(sink);
        state.with_audio = with_audio;
        state.stream_starts += 1;
        Ok(())
    }

    fn stop_stream(&mut self) {
        let mut state = self.state.lock();
        state.sink = None;
        state.with_audio = false;
    }
}

/// Pushes frames into a running [`SyntheticCamera`] stream
#[derive(Clone)]
pub struct SyntheticFeed {
    state: Arc<Mutex<SyntheticState>>,
    frame_size: Resolution,
}

impl SyntheticFeed {
    fn sink(&self) -> Option<FrameSink> {
        self.state.lock().sink.clone()
    }

    /// Push a solid frame captured at `captured_at`.
    /// Returns false when the stream is stopped or the consumer is saturated.
    pub fn push_frame_at(&self, captured_at: Duration) -> bool {
        let Resolution { width, height } = self.frame_size;
        let shade = (captured_at.as_millis() % 251) as u8;
        let data = [shade, 255 - shade, 128, 255].repeat((width * height) as usize);
        self.push_frame(RawFrame {
            data,
            width,
            height,
            format: PixelFormat::Rgba8,
            captured_at,
        })
    }

    /// Push a frame whose buffer does not match its dimensions
    pub fn push_corrupt_frame_at(&self, captured_at: Duration) -> bool {
        self.push_frame(RawFrame {
            data: vec![0; 3],
            width: self.frame_size.width,
            height: self.frame_size.height,
            format: PixelFormat::Rgba8,
            captured_at,
        })
    }

    pub fn push_frame(&self, frame: RawFrame) -> bool {
        match self.sink() {
            Some(sink) => sink.push_frame(frame),
            None => false,
        }
    }

    /// Push `duration` worth of mono silence at 8kHz.
    /// Dropped unless the stream was started with audio.
    pub fn push_audio_at(&self, captured_at: Duration, duration: Duration) -> bool {
        let sink = {
            let state = self.state.lock();
            if !state.with_audio {
                return false;
            }
            state.sink.clone()
        };
        let sample_rate = 8_000;
        let samples = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
        match sink {
            Some(sink) => sink.push_audio(AudioChunk {
                samples: vec![0.0; samples],
                sample_rate,
                channels: 1,
                captured_at,
            }),
            None => false,
        }
    }

    pub fn set_orientation(&self, orientation: Orientation) {
        if let Some(sink) = self.sink() {
            sink.report_orientation(orientation);
        }
    }
}

/// Observes a [`SyntheticCamera`] from outside the device lease
#[derive(Clone)]
pub struct SyntheticMonitor {
    state: Arc<Mutex<SyntheticState>>,
}

impl SyntheticMonitor {
    pub fn current_input(&self) -> Option<CameraPosition> {
        self.state.lock().input
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    pub fn stream_starts(&self) -> usize {
        self.state.lock().stream_starts
    }
}
