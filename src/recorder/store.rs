//! Frame store
//!
//! Append-only, ordered spool of sampled frames for one capture session.
//! Frames are written as PNG files inside a private temporary directory that
//! is removed when the store is dropped.

use crate::capture::still::StillImage;
use crate::utils::error::{CaptureError, CaptureResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// A kept frame and its place in the compiled video
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampledFrame {
    pub sequence_index: u64,
    /// Position in the compiled video
    pub output_timestamp: Duration,
    /// Camera time the frame was captured at
    pub captured_at: Duration,
    pub width: u32,
    pub height: u32,
    pub path: PathBuf,
}

/// Ordered frames for one session
#[derive(Debug)]
pub struct FrameStore {
    dir: TempDir,
    frames: Vec<SampledFrame>,
}

impl FrameStore {
    /// Create an empty store in a fresh directory under `root`
    pub fn create_in(root: &Path) -> CaptureResult<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix("session-")
            .tempdir_in(root)?;
        tracing::debug!("Frame store created at {:?}", dir.path());
        Ok(Self {
            dir,
            frames: Vec::new(),
        })
    }

    /// Spool `still` as the next frame.
    ///
    /// `sequence_index` must equal the current length, and every frame must
    /// share the first frame's dimensions. Nothing is kept on error.
    pub fn append(
        &mut self,
        still: &StillImage,
        sequence_index: u64,
        output_timestamp: Duration,
        captured_at: Duration,
    ) -> CaptureResult<&SampledFrame> {
        if sequence_index != self.frames.len() as u64 {
            return Err(CaptureError::FrameCapture(format!(
                "frame {} appended out of order (store holds {})",
                sequence_index,
                self.frames.len()
            )));
        }
        if let Some(first) = self.frames.first() {
            if (first.width, first.height) != (still.width, still.height) {
                return Err(CaptureError::FrameCapture(format!(
                    "frame is {}x{}, session is {}x{}",
                    still.width, still.height, first.width, first.height
                )));
            }
        }

        let path = self.dir.path().join(format!("frame-{:08}.png", sequence_index));
        if let Err(e) = still.write_png(&path) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        self.frames.push(SampledFrame {
            sequence_index,
            output_timestamp,
            captured_at,
            width: still.width,
            height: still.height,
            path,
        });
        Ok(&self.frames[self.frames.len() - 1])
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames in sequence order
    pub fn frames(&self) -> &[SampledFrame] {
        &self.frames
    }

    /// The session directory
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Path for an auxiliary session file (e.g. the live audio track)
    pub fn session_file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
