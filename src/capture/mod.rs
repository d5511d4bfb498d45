//! Camera and microphone capture
//!
//! Backends implement [`CameraBackend`]; [`CaptureDevice`] owns the checked
//! out backend for one configuration and streams into a [`FrameSink`].

pub mod audio;
pub mod device;
#[cfg(feature = "native-camera")]
pub mod native;
pub mod still;
pub mod synthetic;
pub mod traits;

pub use audio::{AudioTrack, AudioTrackWriter};
pub use device::{CameraResource, CaptureDevice};
#[cfg(feature = "native-camera")]
pub use native::NativeCamera;
pub use still::StillImage;
pub use synthetic::{SyntheticCamera, SyntheticFeed, SyntheticMonitor};
pub use traits::{
    AudioChunk, CameraBackend, CameraInfo, CameraPosition, DeviceEvent, FrameSink, Orientation,
    PermissionStatus, PixelFormat, QualityPreset, RawFrame, Resolution,
};
