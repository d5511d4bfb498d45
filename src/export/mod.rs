//! Video export module
//!
//! Assembles sampled frames into a compiled video and attaches voiceover
//! tracks to compiled videos. FFmpeg does the encoding behind the
//! [`MediaBackend`] seam.

pub mod backend;
pub mod ffmpeg;
pub mod overlay;
pub mod pipeline;
pub mod types;

pub use backend::{FrameEncoder, MediaBackend};
pub use ffmpeg::FfmpegBackend;
pub use overlay::AudioOverlayMuxer;
pub use pipeline::{AssemblyJob, VideoAssembler};
pub use types::{
    CompiledVideo, EncodeSpec, ExportError, ExportProgress, ExportStage, OverlayOutcome,
};
