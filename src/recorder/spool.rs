//! Frame spool
//!
//! Accepted frames are converted and written to the session's [`FrameStore`]
//! on a dedicated writer thread, so PNG encoding never runs on the recorder
//! task. The writer numbers frames in the order it stores them and reports
//! each one back; the store is handed back once the spool is finished.

use crate::capture::still::StillImage;
use crate::capture::traits::RawFrame;
use crate::recorder::sampler::output_timestamp;
use crate::recorder::store::FrameStore;
use crate::utils::error::{CaptureError, CaptureResult};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outcome of one spooled frame
#[derive(Debug, Clone, PartialEq)]
pub enum SpoolReport {
    Stored {
        session_id: Uuid,
        sequence_index: u64,
        output_timestamp: Duration,
    },
    Dropped {
        session_id: Uuid,
        captured_at: Duration,
        reason: String,
    },
}

impl SpoolReport {
    pub fn session_id(&self) -> Uuid {
        match self {
            SpoolReport::Stored { session_id, .. } | SpoolReport::Dropped { session_id, .. } => {
                *session_id
            }
        }
    }
}

pub struct FrameSpool {
    jobs: Option<mpsc::Sender<RawFrame>>,
    writer: Option<JoinHandle<FrameStore>>,
}

impl FrameSpool {
    /// Start a writer thread that owns `store` until [`FrameSpool::finish`].
    ///
    /// At most `depth` frames wait for the writer.
    pub fn spawn(
        store: FrameStore,
        session_id: Uuid,
        output_frame_rate: u32,
        depth: usize,
        reports: mpsc::UnboundedSender<SpoolReport>,
    ) -> CaptureResult<Self> {
        let (jobs, mut rx) = mpsc::channel::<RawFrame>(depth.max(1));

        let writer = std::thread::Builder::new()
            .name("frame-spool".to_string())
            .spawn(move || {
                let mut store = store;
                while let Some(frame) = rx.blocking_recv() {
                    let sequence_index = store.len() as u64;
                    let timestamp = output_timestamp(sequence_index, output_frame_rate);
                    let captured_at = frame.captured_at;

                    let stored = StillImage::from_owned(frame).and_then(|still| {
                        store
                            .append(&still, sequence_index, timestamp, captured_at)
                            .map(|_| ())
                    });
                    let report = match stored {
                        Ok(()) => SpoolReport::Stored {
                            session_id,
                            sequence_index,
                            output_timestamp: timestamp,
                        },
                        Err(e) => {
                            tracing::warn!("Dropping frame captured at {:?}: {}", captured_at, e);
                            SpoolReport::Dropped {
                                session_id,
                                captured_at,
                                reason: e.to_string(),
                            }
                        }
                    };
                    let _ = reports.send(report);
                }
                tracing::debug!("Frame spool for session {} drained ({} frames)", session_id, store.len());
                store
            })?;

        Ok(Self {
            jobs: Some(jobs),
            writer: Some(writer),
        })
    }

    /// Queue an accepted frame, waiting while the writer is `depth` frames behind
    pub async fn push(&self, frame: RawFrame) -> CaptureResult<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| CaptureError::FrameCapture("frame spool is closed".to_string()))?;
        jobs.send(frame)
            .await
            .map_err(|_| CaptureError::FrameCapture("frame spool writer exited".to_string()))
    }

    /// Close the queue, wait for queued frames to be written and take the store back
    pub async fn finish(mut self) -> CaptureResult<FrameStore> {
        self.jobs = None;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| CaptureError::FrameCapture("frame spool already finished".to_string()))?;

        tokio::task::spawn_blocking(move || writer.join())
            .await
            .map_err(|e| CaptureError::FrameCapture(format!("frame spool join failed: {}", e)))?
            .map_err(|_| CaptureError::FrameCapture("frame spool writer panicked".to_string()))
    }
}
