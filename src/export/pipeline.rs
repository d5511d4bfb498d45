//! Video assembly pipeline
//!
//! Drains a session's frame store, in sequence order, into one encoder and
//! produces a [`CompiledVideo`]. The output file either exists complete or
//! not at all: a failed or cancelled run removes whatever was written.

use crate::capture::traits::{Orientation, QualityPreset};
use crate::export::backend::MediaBackend;
use crate::export::types::{video_duration, CompiledVideo, EncodeSpec, ExportError, ExportProgress};
use crate::recorder::store::FrameStore;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Output settings for one compilation
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyJob {
    pub output_path: PathBuf,
    pub output_frame_rate: u32,
    pub quality: QualityPreset,
    pub orientation: Orientation,
    /// Live audio recorded during the session
    pub audio: Option<PathBuf>,
}

/// Decoded RGBA frame
struct DecodedFrame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

/// Deletes the output file unless disarmed
struct PartialOutput {
    path: PathBuf,
    armed: bool,
}

impl PartialOutput {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::warn!("Removed partial output {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!("Failed to remove partial output {:?}: {}", self.path, e),
        }
    }
}

/// Turns a frame store into a compiled video
pub struct VideoAssembler {
    media: Arc<dyn MediaBackend>,
    cancel_flag: Arc<AtomicBool>,
}

impl VideoAssembler {
    pub fn new(media: Arc<dyn MediaBackend>, cancel_flag: Arc<AtomicBool>) -> Self {
        Self { media, cancel_flag }
    }

    /// Run the assembly. Blocking; call from a blocking context.
    pub fn run<F>(
        &self,
        store: &FrameStore,
        job: &AssemblyJob,
        progress_callback: F,
    ) -> Result<CompiledVideo, ExportError>
    where
        F: Fn(ExportProgress),
    {
        let frames = store.frames();
        let total = frames.len() as u64;
        progress_callback(ExportProgress::preparing(total));

        let first = frames.first().ok_or(ExportError::EmptyRecording)?;
        if job.output_frame_rate == 0 {
            return Err(ExportError::InvalidConfig("output frame rate is zero".to_string()));
        }
        if job.output_path.exists() {
            return Err(ExportError::InvalidConfig(format!(
                "output {:?} already exists",
                job.output_path
            )));
        }
        if let Some(parent) = job.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let audio = match &job.audio {
            Some(path) if path.exists() => Some(path.clone()),
            Some(path) => {
                tracing::warn!("Live audio track {:?} missing, compiling without audio", path);
                None
            }
            None => None,
        };

        let spec = EncodeSpec {
            output_path: job.output_path.clone(),
            width: first.width,
            height: first.height,
            fps: job.output_frame_rate,
            quality: job.quality,
            orientation: job.orientation,
            audio: audio.clone(),
            duration: video_duration(total, job.output_frame_rate),
        };

        tracing::info!(
            "Assembling {} frames ({}x{}) @ {}fps into {:?}",
            total,
            spec.width,
            spec.height,
            spec.fps,
            spec.output_path
        );

        self.check_cancelled()?;

        // Declared before the encoder so the encoder is dropped (and killed) first
        let guard = PartialOutput::new(&job.output_path);
        let mut encoder = self.media.open_encoder(&spec)?;

        let report_every = (total / 100).max(1);
        for (i, frame) in frames.iter().enumerate() {
            self.check_cancelled()?;

            let decoded = load_png_image(&frame.path)?;
            if (decoded.width, decoded.height) != (spec.width, spec.height) {
                return Err(ExportError::Decoding(format!(
                    "frame {} is {}x{}, expected {}x{}",
                    frame.sequence_index, decoded.width, decoded.height, spec.width, spec.height
                )));
            }
            encoder.write_frame(&decoded.data)?;

            let written = i as u64 + 1;
            if written % report_every == 0 || written == total {
                progress_callback(ExportProgress::encoding(written, total));
            }
        }

        self.check_cancelled()?;
        progress_callback(ExportProgress::finalizing(total));
        encoder.finish()?;
        guard.disarm();

        progress_callback(ExportProgress::complete(total));
        tracing::info!("Compiled video written to {:?}", job.output_path);

        Ok(CompiledVideo {
            path: job.output_path.clone(),
            duration_secs: spec.duration.as_secs_f64(),
            frame_count: total,
            output_frame_rate: job.output_frame_rate,
            orientation: job.orientation,
            has_audio: audio.is_some(),
            created_at: Utc::now(),
        })
    }

    fn check_cancelled(&self) -> Result<(), ExportError> {
        if self.cancel_flag.load(Ordering::SeqCst) {
            return Err(ExportError::Cancelled);
        }
        Ok(())
    }
}

/// Load a PNG image as RGBA data
fn load_png_image(path: &Path) -> Result<DecodedFrame, ExportError> {
    let file = std::fs::File::open(path)?;
    let decoder = png::Decoder::new(file);
    let mut reader = decoder
        .read_info()
        .map_err(|e| ExportError::Decoding(format!("PNG decode error: {}", e)))?;

    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut buf)
        .map_err(|e| ExportError::Decoding(format!("PNG frame error: {}", e)))?;

    let data = match info.color_type {
        png::ColorType::Rgba => buf[..info.buffer_size()].to_vec(),
        png::ColorType::Rgb => {
            let rgb = &buf[..info.buffer_size()];
            let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
            for chunk in rgb.chunks(3) {
                rgba.extend_from_slice(chunk);
                rgba.push(255);
            }
            rgba
        }
        _ => {
            return Err(ExportError::Decoding(format!(
                "Unsupported PNG color type: {:?}",
                info.color_type
            )));
        }
    };

    Ok(DecodedFrame {
        data,
        width: info.width,
        height: info.height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::still::StillImage;
    use crate::testing::FakeMedia;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn store_with(root: &Path, count: u64) -> FrameStore {
        let mut store = FrameStore::create_in(root).unwrap();
        for i in 0..count {
            let still = StillImage {
                width: 2,
                height: 2,
                rgba: vec![i as u8; 16],
            };
            store
                .append(&still, i, Duration::from_millis(i * 33), Duration::from_secs(i * 2))
                .unwrap();
        }
        store
    }

    fn job(dir: &Path) -> AssemblyJob {
        AssemblyJob {
            output_path: dir.join("out").join("timelapse.mp4"),
            output_frame_rate: 30,
            quality: QualityPreset::Low,
            orientation: Orientation::LandscapeRight,
            audio: None,
        }
    }

    fn assembler(media: FakeMedia) -> (VideoAssembler, Arc<FakeMedia>, Arc<AtomicBool>) {
        let media = Arc::new(media);
        let cancel = Arc::new(AtomicBool::new(false));
        (VideoAssembler::new(media.clone(), cancel.clone()), media, cancel)
    }

    #[test]
    fn test_compiled_duration_is_frames_over_fps() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 300);
        let (assembler, media, _) = assembler(FakeMedia::new());

        let video = assembler.run(&store, &job(dir.path()), |_| {}).unwrap();

        assert_eq!(video.frame_count, 300);
        assert_eq!(video.duration_secs, 10.0);
        assert_eq!(video.duration(), Duration::from_secs(10));
        assert!(video.path.exists());
        assert_eq!(media.frames_written(), 300);
        assert_eq!(media.probe_duration(&video.path).unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_empty_store_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 0);
        let (assembler, media, _) = assembler(FakeMedia::new());
        let job = job(dir.path());

        let result = assembler.run(&store, &job, |_| {});

        assert!(matches!(result, Err(ExportError::EmptyRecording)));
        assert!(!job.output_path.exists());
        assert_eq!(media.encoders_opened(), 0);
    }

    #[test]
    fn test_encoder_failure_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 10);
        let (assembler, _, _) = assembler(FakeMedia::new().failing_after(4));
        let job = job(dir.path());

        let result = assembler.run(&store, &job, |_| {});

        assert!(matches!(result, Err(ExportError::Encoding(_))));
        assert!(!job.output_path.exists());
    }

    #[test]
    fn test_cancel_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 10);
        let (assembler, _, cancel) = assembler(FakeMedia::new());
        let job = job(dir.path());

        let result = assembler.run(&store, &job, |p| {
            if p.current_frame == 3 {
                cancel.store(true, Ordering::SeqCst);
            }
        });

        assert!(matches!(result, Err(ExportError::Cancelled)));
        assert!(!job.output_path.exists());
    }

    #[test]
    fn test_existing_output_is_not_touched() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 2);
        let (assembler, _, _) = assembler(FakeMedia::new());
        let job = job(dir.path());
        std::fs::create_dir_all(job.output_path.parent().unwrap()).unwrap();
        std::fs::write(&job.output_path, b"keep me").unwrap();

        let result = assembler.run(&store, &job, |_| {});

        assert!(matches!(result, Err(ExportError::InvalidConfig(_))));
        assert_eq!(std::fs::read(&job.output_path).unwrap(), b"keep me");
    }

    #[test]
    fn test_frames_written_in_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 5);
        let (assembler, media, _) = assembler(FakeMedia::new());

        assembler.run(&store, &job(dir.path()), |_| {}).unwrap();

        // Each test frame is filled with its own index
        assert_eq!(media.first_bytes(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_progress_ends_complete() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 3);
        let (assembler, _, _) = assembler(FakeMedia::new());
        let seen = Mutex::new(Vec::new());

        assembler
            .run(&store, &job(dir.path()), |p| seen.lock().push(p.percent))
            .unwrap();

        let seen = seen.into_inner();
        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&100.0));
        assert!(seen.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_live_audio_is_passed_to_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 30);
        let audio = dir.path().join("live.wav");
        crate::testing::write_wav(&audio, Duration::from_secs(60));
        let (assembler, media, _) = assembler(FakeMedia::new());
        let mut job = job(dir.path());
        job.audio = Some(audio.clone());

        let video = assembler.run(&store, &job, |_| {}).unwrap();

        assert!(video.has_audio);
        // Audio is cut at the video length, not sped up
        assert_eq!(
            crate::testing::fake_audio_duration(&video.path),
            Some(Duration::from_secs(1))
        );
        assert_eq!(media.last_spec().unwrap().audio, Some(audio));
    }
}
