//! Media backend seam
//!
//! The assembler and overlay muxer talk to the encoder through these traits;
//! [`crate::export::ffmpeg::FfmpegBackend`] is the production implementation.

use crate::export::types::{EncodeSpec, ExportError};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// An open encoder accepting RGBA frames in presentation order
pub trait FrameEncoder: Send {
    fn write_frame(&mut self, rgba: &[u8]) -> Result<(), ExportError>;

    /// Close the input and wait for the container to be written
    fn finish(self: Box<Self>) -> Result<(), ExportError>;
}

pub trait MediaBackend: Send + Sync {
    /// Start an encoder writing to `spec.output_path`
    fn open_encoder(&self, spec: &EncodeSpec) -> Result<Box<dyn FrameEncoder>, ExportError>;

    /// Duration of the first stream in a media file
    fn probe_duration(&self, path: &Path) -> Result<Duration, ExportError>;

    /// Copy the video stream of `video` and the audio of `narration` into
    /// `output`, cutting the audio at `video_duration`
    fn mux_narration(
        &self,
        video: &Path,
        narration: &Path,
        video_duration: Duration,
        output: &Path,
        cancel: &AtomicBool,
    ) -> Result<(), ExportError>;
}
