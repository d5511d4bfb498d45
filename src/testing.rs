//! In-process media backend for tests
//!
//! Writes small text "containers" instead of invoking ffmpeg, and reads WAV
//! durations with hound so corrupt audio behaves like it would in production.

use crate::export::backend::{FrameEncoder, MediaBackend};
use crate::export::types::{EncodeSpec, ExportError};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAGIC: &str = "fake-video";

#[derive(Default)]
struct FakeState {
    busy_remaining: u32,
    fail_after: Option<u64>,
    frame_delay: Duration,
    mux_delay: Duration,
    muxes_started: u32,
    audio_inputs: Vec<Duration>,
    opened: u32,
    frames_written: u64,
    first_bytes: Vec<u8>,
    last_spec: Option<EncodeSpec>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeMedia {
    state: Arc<Mutex<FakeState>>,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` encoder opens with `EncoderBusy`
    pub fn busy_times(self, n: u32) -> Self {
        self.state.lock().busy_remaining = n;
        self
    }

    /// Fail with an encoding error once `n` frames have been written
    pub fn failing_after(self, n: u64) -> Self {
        self.state.lock().fail_after = Some(n);
        self
    }

    /// Sleep this long on every frame
    pub fn with_frame_delay(self, delay: Duration) -> Self {
        self.state.lock().frame_delay = delay;
        self
    }

    /// Keep every narration mux running for `delay` unless cancelled
    pub fn with_mux_delay(self, delay: Duration) -> Self {
        self.state.lock().mux_delay = delay;
        self
    }

    pub fn muxes_started(&self) -> u32 {
        self.state.lock().muxes_started
    }

    /// Length of the live audio track handed to the last encoder that had one
    pub fn last_audio_input(&self) -> Option<Duration> {
        self.state.lock().audio_inputs.last().copied()
    }

    pub fn encoders_opened(&self) -> u32 {
        self.state.lock().opened
    }

    pub fn frames_written(&self) -> u64 {
        self.state.lock().frames_written
    }

    /// First byte of every frame written, in order
    pub fn first_bytes(&self) -> Vec<u8> {
        self.state.lock().first_bytes.clone()
    }

    pub fn last_spec(&self) -> Option<EncodeSpec> {
        self.state.lock().last_spec.clone()
    }
}

struct FakeEncoder {
    state: Arc<Mutex<FakeState>>,
    spec: EncodeSpec,
    file: std::fs::File,
    written: u64,
}

impl FrameEncoder for FakeEncoder {
    fn write_frame(&mut self, rgba: &[u8]) -> Result<(), ExportError> {
        let (fail_after, delay) = {
            let state = self.state.lock();
            (state.fail_after, state.frame_delay)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if fail_after == Some(self.written) {
            return Err(ExportError::Encoding("injected encoder failure".to_string()));
        }
        writeln!(self.file, "frame")?;
        self.written += 1;

        let mut state = self.state.lock();
        state.frames_written += 1;
        state.first_bytes.push(rgba.first().copied().unwrap_or_default());
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), ExportError> {
        let duration = self.spec.duration;
        writeln!(self.file, "frames={}", self.written)?;
        writeln!(self.file, "duration_ns={}", duration.as_nanos())?;
        if let Some(audio) = &self.spec.audio {
            let audio_len = wav_duration(audio)?;
            self.state.lock().audio_inputs.push(audio_len);
            writeln!(self.file, "audio_ns={}", audio_len.min(duration).as_nanos())?;
        }
        Ok(())
    }
}

impl MediaBackend for FakeMedia {
    fn open_encoder(&self, spec: &EncodeSpec) -> Result<Box<dyn FrameEncoder>, ExportError> {
        let mut state = self.state.lock();
        if state.busy_remaining > 0 {
            state.busy_remaining -= 1;
            return Err(ExportError::EncoderBusy("fake encoder busy".to_string()));
        }
        state.opened += 1;
        state.last_spec = Some(spec.clone());

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&spec.output_path)?;
        writeln!(file, "{}", MAGIC)?;

        Ok(Box::new(FakeEncoder {
            state: self.state.clone(),
            spec: spec.clone(),
            file,
            written: 0,
        }))
    }

    fn probe_duration(&self, path: &Path) -> Result<Duration, ExportError> {
        if path.extension().is_some_and(|ext| ext == "wav") {
            return wav_duration(path);
        }
        let text = std::fs::read_to_string(path)?;
        field(&text, "duration_ns")
            .ok_or_else(|| ExportError::Decoding(format!("{:?} is not a video", path)))
    }

    fn mux_narration(
        &self,
        video: &Path,
        narration: &Path,
        video_duration: Duration,
        output: &Path,
        cancel: &AtomicBool,
    ) -> Result<(), ExportError> {
        let text = std::fs::read_to_string(video)?;
        let narration_len = wav_duration(narration)?;
        let delay = {
            let mut state = self.state.lock();
            state.muxes_started += 1;
            state.mux_delay
        };
        std::fs::write(output, "partial\n")?;
        let started = std::time::Instant::now();
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(ExportError::Cancelled);
            }
            if started.elapsed() >= delay {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut out = String::new();
        for line in text.lines().filter(|l| !l.starts_with("audio_ns=")) {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&format!(
            "audio_ns={}\n",
            narration_len.min(video_duration).as_nanos()
        ));
        std::fs::write(output, out)?;
        Ok(())
    }
}

fn field(text: &str, key: &str) -> Option<Duration> {
    text.lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix('='))
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_nanos)
}

fn wav_duration(path: &Path) -> Result<Duration, ExportError> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| ExportError::Decoding(format!("unreadable audio {:?}: {}", path, e)))?;
    let rate = reader.spec().sample_rate.max(1) as u64;
    Ok(Duration::from_nanos(reader.duration() as u64 * 1_000_000_000 / rate))
}

/// Write a silent 8kHz mono WAV of `duration`
pub(crate) fn write_wav(path: &Path, duration: Duration) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let samples = duration.as_millis() as u64 * 8;
    for _ in 0..samples {
        writer.write_sample(0i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// Write a fake compiled video of `duration`
pub(crate) fn write_fake_video(path: &Path, duration: Duration) {
    let text = format!(
        "{}\nframes={}\nduration_ns={}\n",
        MAGIC,
        duration.as_secs() * 30,
        duration.as_nanos()
    );
    std::fs::write(path, text).unwrap();
}

/// Audio length recorded in a fake container
pub(crate) fn fake_audio_duration(path: &Path) -> Option<Duration> {
    let text = std::fs::read_to_string(path).ok()?;
    field(&text, "audio_ns")
}
