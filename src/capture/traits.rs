//! Capture trait definitions
//!
//! Platform-agnostic types and the backend seam for camera/microphone sources.

use crate::utils::error::CaptureResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Which physical camera to capture from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraPosition {
    Front,
    #[default]
    Back,
}

impl CameraPosition {
    /// The camera on the other side of the device
    pub fn opposite(self) -> Self {
        match self {
            CameraPosition::Front => CameraPosition::Back,
            CameraPosition::Back => CameraPosition::Front,
        }
    }
}

impl fmt::Display for CameraPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraPosition::Front => f.write_str("front"),
            CameraPosition::Back => f.write_str("back"),
        }
    }
}

/// Capture resolution and encode quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    #[default]
    Medium,
    High,
}

impl QualityPreset {
    /// Requested capture resolution
    pub fn resolution(&self) -> Resolution {
        match self {
            QualityPreset::Low => Resolution {
                width: 640,
                height: 480,
            },
            QualityPreset::Medium => Resolution {
                width: 1280,
                height: 720,
            },
            QualityPreset::High => Resolution {
                width: 1920,
                height: 1080,
            },
        }
    }

    /// CRF value for H.264 encoding
    /// Lower values = higher quality, larger files
    pub fn crf(&self) -> u8 {
        match self {
            QualityPreset::Low => 28,
            QualityPreset::Medium => 23,
            QualityPreset::High => 18,
        }
    }

    /// FFmpeg preset for H.264 encoding
    pub fn h264_preset(&self) -> &'static str {
        match self {
            QualityPreset::Low => "faster",
            QualityPreset::Medium => "medium",
            QualityPreset::High => "slow",
        }
    }
}

/// Device orientation at capture time
///
/// `LandscapeRight` is the sensor-native orientation and needs no rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Orientation {
    Portrait,
    LandscapeLeft,
    #[default]
    LandscapeRight,
    PortraitUpsideDown,
}

impl Orientation {
    /// FFmpeg filter turning sensor-native (landscape-right) frames upright
    pub fn rotation_filter(&self) -> Option<&'static str> {
        match self {
            Orientation::Portrait => Some("transpose=1"),
            Orientation::PortraitUpsideDown => Some("transpose=2"),
            Orientation::LandscapeLeft => Some("hflip,vflip"),
            Orientation::LandscapeRight => None,
        }
    }
}

/// Camera permission as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    NotDetermined,
}

/// Information about a camera
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    /// Unique device ID
    pub id: String,

    /// Device name
    pub name: String,

    /// Which side of the device the camera faces
    pub position: CameraPosition,

    /// Supported resolutions
    pub supported_resolutions: Vec<Resolution>,
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Pixel layout of a raw frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// A frame as delivered by the camera, before sampling
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Monotonic capture time since the device stream started
    pub captured_at: Duration,
}

/// Interleaved f32 microphone samples
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub captured_at: Duration,
}

/// Events pushed by a capture backend from its own thread
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Frame(RawFrame),
    Audio(AudioChunk),
}

type Deliver = dyn Fn(DeviceEvent) -> bool + Send + Sync;

/// Push-style destination for backend frames, audio and orientation changes.
///
/// Delivery never blocks: when the consumer is saturated the event is
/// dropped and `false` is returned.
#[derive(Clone)]
pub struct FrameSink {
    deliver: Arc<Deliver>,
    orientation: Arc<watch::Sender<Orientation>>,
}

impl FrameSink {
    pub fn new<F>(deliver: F, orientation: Arc<watch::Sender<Orientation>>) -> Self
    where
        F: Fn(DeviceEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
            orientation,
        }
    }

    pub fn push_frame(&self, frame: RawFrame) -> bool {
        (self.deliver)(DeviceEvent::Frame(frame))
    }

    pub fn push_audio(&self, chunk: AudioChunk) -> bool {
        (self.deliver)(DeviceEvent::Audio(chunk))
    }

    pub fn report_orientation(&self, orientation: Orientation) {
        self.orientation.send_if_modified(|current| {
            if *current == orientation {
                false
            } else {
                *current = orientation;
                true
            }
        });
    }
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink")
            .field("orientation", &*self.orientation.borrow())
            .finish()
    }
}

/// A platform camera/microphone implementation.
///
/// Backends hold at most one camera input at a time. Frames are pushed into
/// the sink handed to `start_stream` from whatever thread the platform uses.
pub trait CameraBackend: Send + 'static {
    /// Backend name for logging
    fn name(&self) -> &str;

    fn permission_status(&self) -> PermissionStatus;

    /// Orientation assumed until the backend reports one
    fn native_orientation(&self) -> Orientation {
        Orientation::LandscapeRight
    }

    fn cameras(&self) -> Vec<CameraInfo>;

    /// Attach the camera at `position` as the single input
    fn add_input(&mut self, position: CameraPosition, preset: QualityPreset) -> CaptureResult<()>;

    /// Detach the current input, if any
    fn remove_input(&mut self);

    fn current_input(&self) -> Option<CameraPosition>;

    /// Begin delivering frames (and audio, when requested) to `sink`
    fn start_stream(&mut self, sink: FrameSink, with_audio: bool) -> CaptureResult<()>;

    fn stop_stream(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_position_opposite() {
        assert_eq!(CameraPosition::Front.opposite(), CameraPosition::Back);
        assert_eq!(CameraPosition::Back.opposite(), CameraPosition::Front);
    }

    #[test]
    fn test_sink_orientation_only_notifies_on_change() {
        let (tx, mut rx) = watch::channel(Orientation::Portrait);
        let sink = FrameSink::new(|_| true, Arc::new(tx));

        sink.report_orientation(Orientation::Portrait);
        assert!(!rx.has_changed().unwrap());

        sink.report_orientation(Orientation::LandscapeLeft);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Orientation::LandscapeLeft);
    }

    #[test]
    fn test_sink_forwards_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let (tx, _rx) = watch::channel(Orientation::Portrait);
        let sink = FrameSink::new(
            move |event| {
                seen_clone.lock().push(event);
                true
            },
            Arc::new(tx),
        );

        assert!(sink.push_frame(RawFrame {
            data: vec![0; 4],
            width: 1,
            height: 1,
            format: PixelFormat::Rgba8,
            captured_at: Duration::ZERO,
        }));
        assert!(sink.push_audio(AudioChunk {
            samples: vec![0.0; 2],
            sample_rate: 48_000,
            channels: 2,
            captured_at: Duration::ZERO,
        }));

        let seen = seen.lock();
        assert!(matches!(seen[0], DeviceEvent::Frame(_)));
        assert!(matches!(seen[1], DeviceEvent::Audio(_)));
    }
}
