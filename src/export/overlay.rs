//! Voiceover overlay
//!
//! Attaches a narration track to an already compiled video. The video stream
//! is copied untouched; narration longer than the video is cut. The result is
//! written to a temporary sibling of the output path and only renamed into
//! place once the mux has succeeded, so the inputs are never modified and a
//! failed run leaves nothing behind.

use crate::export::backend::MediaBackend;
use crate::export::types::{ExportError, OverlayOutcome};
use crate::utils::error::{CaptureError, CaptureResult};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct AudioOverlayMuxer {
    media: Arc<dyn MediaBackend>,
    cancel_flag: Arc<AtomicBool>,
}

impl AudioOverlayMuxer {
    pub fn new(media: Arc<dyn MediaBackend>, cancel_flag: Arc<AtomicBool>) -> Self {
        Self { media, cancel_flag }
    }

    /// Merge `voiceover` onto `video`, writing `output`. Blocking.
    pub fn run(&self, video: &Path, voiceover: &Path, output: &Path) -> CaptureResult<OverlayOutcome> {
        validate_paths(video, voiceover, output)?;

        let video_duration = self
            .media
            .probe_duration(video)
            .map_err(|e| overlay_error("cannot read video", e))?;
        let narration_duration = self
            .media
            .probe_duration(voiceover)
            .map_err(|e| overlay_error("cannot read voiceover", e))?;

        if video_duration.is_zero() {
            return Err(CaptureError::OverlayFailed(format!("{:?} has no duration", video)));
        }
        if narration_duration.is_zero() {
            return Err(CaptureError::OverlayFailed(format!(
                "voiceover {:?} is empty",
                voiceover
            )));
        }

        let truncated = narration_duration > video_duration;
        if truncated {
            tracing::info!(
                "Voiceover is {:?} longer than the video, truncating",
                narration_duration - video_duration
            );
        }

        let parent = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let staging = tempfile::Builder::new()
            .prefix(".voiceover-")
            .suffix(".mp4")
            .tempfile_in(parent)?;

        if self.cancel_flag.load(Ordering::SeqCst) {
            return Err(CaptureError::Cancelled);
        }

        self.media
            .mux_narration(video, voiceover, video_duration, staging.path(), &self.cancel_flag)
            .map_err(|e| overlay_error("mux failed", e))?;

        // Dropping `staging` on any error above removes it
        staging
            .persist(output)
            .map_err(|e| CaptureError::OverlayFailed(format!("cannot move output into place: {}", e.error)))?;

        tracing::info!(
            "Voiceover merged into {:?} (video {:?}, narration {:?})",
            output,
            video_duration,
            narration_duration
        );

        Ok(OverlayOutcome {
            path: output.to_path_buf(),
            video_duration: video_duration.as_secs_f64(),
            narration_duration: narration_duration.as_secs_f64(),
            narration_truncated: truncated,
        })
    }
}

fn validate_paths(video: &Path, voiceover: &Path, output: &Path) -> CaptureResult<()> {
    if !video.is_file() {
        return Err(CaptureError::OverlayFailed(format!("video {:?} not found", video)));
    }
    if !voiceover.is_file() {
        return Err(CaptureError::OverlayFailed(format!(
            "voiceover {:?} not found",
            voiceover
        )));
    }
    if same_file(output, video) || same_file(output, voiceover) {
        return Err(CaptureError::OverlayFailed(
            "output path must differ from both inputs".to_string(),
        ));
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn overlay_error(context: &str, error: ExportError) -> CaptureError {
    match error {
        ExportError::Cancelled => CaptureError::Cancelled,
        other => CaptureError::OverlayFailed(format!("{}: {}", context, other)),
    }
}
