//! Export types
//!
//! This module defines the encode request, progress reporting and error types
//! shared by the video assembler and the voiceover muxer.

use crate::capture::traits::{Orientation, QualityPreset};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Everything an encoder needs to turn raw frames into a container file
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSpec {
    /// Output file; must not exist yet
    pub output_path: PathBuf,
    /// Frame width in pixels (RGBA input)
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Fixed output frame rate
    pub fps: u32,
    pub quality: QualityPreset,
    /// Orientation active when the session started
    pub orientation: Orientation,
    /// Live audio track recorded during active time, muxed at normal speed
    pub audio: Option<PathBuf>,
    /// Exact video duration; the audio track is cut here
    pub duration: Duration,
}

/// A finished timelapse container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledVideo {
    pub path: PathBuf,
    /// `frame_count / output_frame_rate`
    pub duration_secs: f64,
    pub frame_count: u64,
    pub output_frame_rate: u32,
    pub orientation: Orientation,
    pub has_audio: bool,
    pub created_at: DateTime<Utc>,
}

impl CompiledVideo {
    pub fn duration(&self) -> Duration {
        video_duration(self.frame_count, self.output_frame_rate)
    }
}

/// Playback length of `frame_count` frames at `fps`
pub fn video_duration(frame_count: u64, fps: u32) -> Duration {
    let nanos = frame_count as u128 * 1_000_000_000 / fps.max(1) as u128;
    Duration::from_nanos(nanos as u64)
}

/// Result of merging a narration track onto a compiled video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayOutcome {
    pub path: PathBuf,
    pub video_duration: f64,
    pub narration_duration: f64,
    /// Narration was longer than the video and got cut
    pub narration_truncated: bool,
}

/// Export progress stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ExportStage {
    /// Checking frames and opening the encoder
    Preparing,
    /// Writing frames
    Encoding,
    /// Waiting for the encoder to close the container
    Finalizing,
    Complete,
}

/// Export progress information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProgress {
    /// Progress percentage (0.0 to 100.0)
    pub percent: f32,
    pub stage: ExportStage,
    pub current_frame: u64,
    pub total_frames: u64,
}

impl ExportProgress {
    pub fn preparing(total_frames: u64) -> Self {
        Self {
            percent: 0.0,
            stage: ExportStage::Preparing,
            current_frame: 0,
            total_frames,
        }
    }

    pub fn encoding(current_frame: u64, total_frames: u64) -> Self {
        let percent = if total_frames > 0 {
            5.0 + (current_frame as f32 / total_frames as f32) * 90.0
        } else {
            5.0
        };
        Self {
            percent,
            stage: ExportStage::Encoding,
            current_frame,
            total_frames,
        }
    }

    pub fn finalizing(total_frames: u64) -> Self {
        Self {
            percent: 95.0,
            stage: ExportStage::Finalizing,
            current_frame: total_frames,
            total_frames,
        }
    }

    pub fn complete(total_frames: u64) -> Self {
        Self {
            percent: 100.0,
            stage: ExportStage::Complete,
            current_frame: total_frames,
            total_frames,
        }
    }
}

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    #[error("Encoder busy: {0}")]
    EncoderBusy(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("No frames to encode")]
    EmptyRecording,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Export cancelled")]
    Cancelled,
}

impl ExportError {
    /// Whether the same job may succeed if tried again unchanged
    pub fn is_transient(&self) -> bool {
        match self {
            ExportError::EncoderBusy(_) => true,
            ExportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_duration_is_exact() {
        assert_eq!(video_duration(300, 30), Duration::from_secs(10));
        assert_eq!(video_duration(1, 30), Duration::from_nanos(33_333_333));
        assert_eq!(video_duration(0, 30), Duration::ZERO);
    }

    #[test]
    fn test_transient_errors() {
        assert!(ExportError::EncoderBusy("x".into()).is_transient());
        assert!(ExportError::Io(std::io::ErrorKind::TimedOut.into()).is_transient());
        assert!(!ExportError::Io(std::io::ErrorKind::NotFound.into()).is_transient());
        assert!(!ExportError::EmptyRecording.is_transient());
        assert!(!ExportError::Encoding("broken pipe".into()).is_transient());
    }

    #[test]
    fn test_encoding_progress_range() {
        assert_eq!(ExportProgress::encoding(0, 10).percent, 5.0);
        assert_eq!(ExportProgress::encoding(10, 10).percent, 95.0);
        assert_eq!(ExportProgress::complete(10).percent, 100.0);
    }

    #[test]
    fn test_progress_serializes_tagged_stage() {
        let json = serde_json::to_value(ExportProgress::finalizing(4)).unwrap();
        assert_eq!(json["stage"]["type"], "finalizing");
        assert_eq!(json["totalFrames"], 4);
    }
}
