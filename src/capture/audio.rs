//! Live audio track recording using hound
//!
//! Microphone chunks received while a session is actively recording are
//! appended to a float WAV file. Paused time never reaches the writer, so the
//! track spans active time only.

use crate::capture::traits::AudioChunk;
use crate::utils::error::{CaptureError, CaptureResult};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A finished audio capture on disk
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    pub path: PathBuf,
    pub duration: Duration,
}

/// Appends audio chunks to a WAV file, created lazily from the first chunk
pub struct AudioTrackWriter {
    path: PathBuf,
    writer: Option<WavWriter<BufWriter<File>>>,
    spec: Option<WavSpec>,
    frames_written: u64,
}

impl AudioTrackWriter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            writer: None,
            spec: None,
            frames_written: 0,
        }
    }

    /// Append one chunk. A chunk whose format differs from the first is
    /// rejected and nothing is written.
    pub fn append(&mut self, chunk: &AudioChunk) -> CaptureResult<()> {
        if chunk.channels == 0 || chunk.sample_rate == 0 {
            return Err(CaptureError::FrameCapture(
                "audio chunk without channels or sample rate".to_string(),
            ));
        }

        let spec = WavSpec {
            channels: chunk.channels,
            sample_rate: chunk.sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };

        if let Some(existing) = self.spec {
            if existing != spec {
                return Err(CaptureError::FrameCapture(format!(
                    "audio format changed mid-session: {}Hz/{}ch -> {}Hz/{}ch",
                    existing.sample_rate, existing.channels, spec.sample_rate, spec.channels
                )));
            }
        }

        if self.writer.is_none() {
            let writer = WavWriter::create(&self.path, spec).map_err(|e| {
                CaptureError::FrameCapture(format!("Failed to create audio track: {}", e))
            })?;
            tracing::info!(
                "Audio track started: {:?} ({}Hz, {}ch)",
                self.path,
                spec.sample_rate,
                spec.channels
            );
            self.spec = Some(spec);
            self.writer = Some(writer);
        }

        if let Some(writer) = self.writer.as_mut() {
            for &sample in &chunk.samples {
                writer.write_sample(sample).map_err(|e| {
                    CaptureError::FrameCapture(format!("Audio write error: {}", e))
                })?;
            }
        }
        self.frames_written += (chunk.samples.len() / chunk.channels as usize) as u64;
        Ok(())
    }

    /// Duration of audio appended so far
    pub fn duration(&self) -> Duration {
        match self.spec {
            Some(spec) => {
                Duration::from_nanos(self.frames_written * 1_000_000_000 / spec.sample_rate as u64)
            }
            None => Duration::ZERO,
        }
    }

    /// Flush the WAV header. Returns None when no audio was ever appended.
    pub fn finalize(mut self) -> CaptureResult<Option<AudioTrack>> {
        let duration = self.duration();
        match self.writer.take() {
            Some(writer) => {
                writer.finalize().map_err(|e| {
                    CaptureError::FrameCapture(format!("Failed to finalize audio track: {}", e))
                })?;
                tracing::info!("Audio track finalized: {:?} ({:?})", self.path, duration);
                Ok(Some(AudioTrack {
                    path: self.path.clone(),
                    duration,
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(samples: usize, sample_rate: u32, channels: u16) -> AudioChunk {
        AudioChunk {
            samples: vec![0.25; samples],
            sample_rate,
            channels,
            captured_at: Duration::ZERO,
        }
    }

    #[test]
    fn test_empty_writer_produces_no_track() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.wav");
        let writer = AudioTrackWriter::new(&path);
        assert!(writer.finalize().unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_duration_counts_frames_not_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.wav");
        let mut writer = AudioTrackWriter::new(&path);

        // One second of stereo at 8kHz
        writer.append(&chunk(16_000, 8_000, 2)).unwrap();
        let track = writer.finalize().unwrap().unwrap();

        assert_eq!(track.duration, Duration::from_secs(1));
        let reader = hound::WavReader::open(&track.path).unwrap();
        assert_eq!(reader.duration(), 8_000);
    }

    #[test]
    fn test_format_change_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = AudioTrackWriter::new(&dir.path().join("live.wav"));

        writer.append(&chunk(800, 8_000, 1)).unwrap();
        let result = writer.append(&chunk(800, 48_000, 1));

        assert!(matches!(result, Err(CaptureError::FrameCapture(_))));
        assert_eq!(writer.duration(), Duration::from_millis(100));
    }
}
