//! Lapse Recorder - timelapse capture, compilation and voiceover.
//!
//! A [`TimelapseRecorder`] samples camera frames at a fixed wall-clock
//! interval while recording, compiles them into an H.264 video when stopped,
//! and can later merge a narration track onto the compiled video.

pub mod capture;
pub mod config;
pub mod export;
pub mod recorder;
pub mod utils;

#[cfg(test)]
mod testing;

pub use capture::{CameraPosition, CameraResource, Orientation, QualityPreset};
pub use config::RecorderConfig;
pub use export::{CompiledVideo, ExportProgress, OverlayOutcome};
pub use recorder::{RecorderEvent, RecorderSnapshot, RecordingState, TimelapseRecorder};
pub use utils::{CaptureError, CaptureResult, ErrorResponse};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default `tracing` subscriber.
///
/// Honors `RUST_LOG`; falls back to debug output for this crate. Safe to call
/// more than once, later calls are ignored.
pub fn init_tracing() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lapse_recorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_ok() {
        tracing::info!("Lapse Recorder v{}", env!("CARGO_PKG_VERSION"));
    }
}
