//! FFmpeg encoder and muxer wrappers
//!
//! Frames are piped to an `ffmpeg` child process as raw RGBA; durations are
//! read with `ffprobe`. Argument lists are built by pure functions so they can
//! be tested without the binaries installed.

use crate::export::backend::{FrameEncoder, MediaBackend};
use crate::export::types::{EncodeSpec, ExportError};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const AUDIO_BITRATE: &str = "192k";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const EVEN_CROP: &str = "crop=trunc(iw/2)*2:trunc(ih/2)*2";

/// Media backend driving the `ffmpeg`/`ffprobe` executables
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegBackend {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl MediaBackend for FfmpegBackend {
    fn open_encoder(&self, spec: &EncodeSpec) -> Result<Box<dyn FrameEncoder>, ExportError> {
        let args = build_encoder_args(spec);
        tracing::info!("Starting FFmpeg encoder: {:?}", args);
        let encoder = VideoEncoder::spawn(&self.ffmpeg, &args)?;
        Ok(Box::new(encoder))
    }

    fn probe_duration(&self, path: &Path) -> Result<Duration, ExportError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .map_err(|e| ExportError::Ffmpeg(format!("Failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExportError::Decoding(format!(
                "ffprobe failed for {:?}: {}",
                path,
                stderr.trim()
            )));
        }

        parse_probe_duration(&String::from_utf8_lossy(&output.stdout))
    }

    fn mux_narration(
        &self,
        video: &Path,
        narration: &Path,
        video_duration: Duration,
        output: &Path,
        cancel: &AtomicBool,
    ) -> Result<(), ExportError> {
        let args = build_overlay_args(video, narration, video_duration, output);
        tracing::info!("Starting FFmpeg overlay mux: {:?}", args);

        let mut process = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        let status = loop {
            if cancel.load(Ordering::SeqCst) {
                let _ = process.kill();
                let _ = process.wait();
                return Err(ExportError::Cancelled);
            }
            match process.try_wait()? {
                Some(status) => break status,
                None => std::thread::sleep(POLL_INTERVAL),
            }
        };

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = process.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(classify_failure(&stderr));
        }

        Ok(())
    }
}

/// Video encoder fed with raw RGBA frames over stdin
pub struct VideoEncoder {
    process: Option<Child>,
    stdin: Option<ChildStdin>,
    frame_count: u64,
}

impl VideoEncoder {
    fn spawn(ffmpeg: &Path, args: &[String]) -> Result<Self, ExportError> {
        let mut process = Command::new(ffmpeg)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| ExportError::Ffmpeg("Failed to capture FFmpeg stdin".to_string()))?;

        Ok(Self {
            process: Some(process),
            stdin: Some(stdin),
            frame_count: 0,
        })
    }
}

impl FrameEncoder for VideoEncoder {
    fn write_frame(&mut self, rgba: &[u8]) -> Result<(), ExportError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ExportError::Encoding("encoder input already closed".to_string()))?;
        stdin
            .write_all(rgba)
            .map_err(|e| ExportError::Encoding(format!("Failed to write frame: {}", e)))?;
        self.frame_count += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), ExportError> {
        // Close stdin to signal EOF to FFmpeg
        drop(self.stdin.take());

        let process = self
            .process
            .take()
            .ok_or_else(|| ExportError::Ffmpeg("encoder process already reaped".to_string()))?;
        let output = process
            .wait_with_output()
            .map_err(|e| ExportError::Ffmpeg(format!("Failed to wait for FFmpeg: {}", e)))?;

        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }

        tracing::info!("FFmpeg encoder finished: {} frames written", self.frame_count);
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut process) = self.process.take() {
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

fn spawn_error(e: std::io::Error) -> ExportError {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => {
            ExportError::EncoderBusy(format!("Failed to start FFmpeg: {}", e))
        }
        _ => ExportError::Ffmpeg(format!("Failed to start FFmpeg: {}", e)),
    }
}

/// Map FFmpeg's stderr on a failed run to an error, spotting resource contention
fn classify_failure(stderr: &str) -> ExportError {
    let stderr = stderr.trim();
    let busy = ["Resource temporarily unavailable", "Device or resource busy"]
        .iter()
        .any(|marker| stderr.contains(marker));
    if busy {
        ExportError::EncoderBusy(stderr.to_string())
    } else {
        ExportError::Ffmpeg(format!("FFmpeg exited with error: {}", stderr))
    }
}

fn format_secs(duration: Duration) -> String {
    format!("{:.6}", duration.as_secs_f64())
}

/// Crop to even dimensions (yuv420p needs them), then rotate
fn video_filter(spec: &EncodeSpec) -> Option<String> {
    let mut filters = Vec::new();
    if spec.width % 2 != 0 || spec.height % 2 != 0 {
        filters.push(EVEN_CROP.to_string());
    }
    if let Some(rotation) = spec.orientation.rotation_filter() {
        filters.push(rotation.to_string());
    }
    (!filters.is_empty()).then(|| filters.join(","))
}

/// Arguments for encoding raw RGBA frames from stdin into an H.264 MP4
pub fn build_encoder_args(spec: &EncodeSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        // Never overwrite
        "-n".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgba".into(),
        "-s".into(),
        format!("{}x{}", spec.width, spec.height),
        "-r".into(),
        spec.fps.to_string(),
        "-i".into(),
        "-".into(),
    ];

    if let Some(audio) = &spec.audio {
        args.extend(["-i".into(), audio.to_string_lossy().to_string()]);
    }

    if let Some(filter) = video_filter(spec) {
        args.extend(["-vf".into(), filter]);
    }

    args.extend([
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        spec.quality.h264_preset().to_string(),
        "-crf".into(),
        spec.quality.crf().to_string(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ]);

    if spec.audio.is_some() {
        // Audio plays at normal speed under the sped-up video
        args.extend([
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "1:a:0".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            AUDIO_BITRATE.into(),
        ]);
    }

    args.extend([
        "-t".into(),
        format_secs(spec.duration),
        "-movflags".into(),
        "+faststart".into(),
        spec.output_path.to_string_lossy().to_string(),
    ]);
    args
}

/// Arguments for copying the video stream and attaching a narration track
pub fn build_overlay_args(
    video: &Path,
    narration: &Path,
    video_duration: Duration,
    output: &Path,
) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        video.to_string_lossy().to_string(),
        "-i".into(),
        narration.to_string_lossy().to_string(),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "1:a:0".into(),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        AUDIO_BITRATE.into(),
        // Cut the narration, never the video
        "-t".into(),
        format_secs(video_duration),
        "-movflags".into(),
        "+faststart".into(),
        "-f".into(),
        "mp4".into(),
        output.to_string_lossy().to_string(),
    ]
}

fn parse_probe_duration(stdout: &str) -> Result<Duration, ExportError> {
    let value = stdout.trim();
    let secs: f64 = value
        .parse()
        .map_err(|_| ExportError::Decoding(format!("Unexpected ffprobe output: {:?}", value)))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ExportError::Decoding(format!("Invalid duration: {}", secs)));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::traits::{Orientation, QualityPreset};

    fn spec(audio: Option<&str>, orientation: Orientation) -> EncodeSpec {
        EncodeSpec {
            output_path: PathBuf::from("/tmp/out.mp4"),
            width: 1280,
            height: 720,
            fps: 30,
            quality: QualityPreset::Medium,
            orientation,
            audio: audio.map(PathBuf::from),
            duration: Duration::from_secs(10),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_encoder_args_video_only() {
        let args = build_encoder_args(&spec(None, Orientation::LandscapeRight));

        assert!(args.contains(&"-n".to_string()));
        assert_eq!(value_after(&args, "-s"), Some("1280x720"));
        assert_eq!(value_after(&args, "-r"), Some("30"));
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-crf"), Some("23"));
        assert_eq!(value_after(&args, "-t"), Some("10.000000"));
        assert!(value_after(&args, "-vf").is_none());
        assert!(value_after(&args, "-c:a").is_none());
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }

    #[test]
    fn test_encoder_args_with_audio() {
        let args = build_encoder_args(&spec(Some("/tmp/live.wav"), Orientation::LandscapeRight));

        let inputs: Vec<&str> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-i")
            .filter_map(|(i, _)| args.get(i + 1).map(String::as_str))
            .collect();
        assert_eq!(inputs, vec!["-", "/tmp/live.wav"]);
        assert_eq!(value_after(&args, "-c:a"), Some("aac"));
        // No speed change is applied to the audio
        assert!(!args.iter().any(|a| a.contains("atempo")));
        assert!(!args.contains(&"-shortest".to_string()));
    }

    #[test]
    fn test_encoder_args_rotation() {
        let args = build_encoder_args(&spec(None, Orientation::Portrait));
        assert_eq!(value_after(&args, "-vf"), Some("transpose=1"));
    }

    #[test]
    fn test_encoder_args_odd_size_is_cropped_before_rotation() {
        let mut odd = spec(None, Orientation::LandscapeRight);
        odd.width = 641;
        odd.height = 481;
        let args = build_encoder_args(&odd);
        assert_eq!(value_after(&args, "-vf"), Some(EVEN_CROP));
        assert_eq!(value_after(&args, "-s"), Some("641x481"));

        odd.orientation = Orientation::Portrait;
        let args = build_encoder_args(&odd);
        assert_eq!(
            value_after(&args, "-vf"),
            Some("crop=trunc(iw/2)*2:trunc(ih/2)*2,transpose=1")
        );
    }

    #[test]
    fn test_overlay_args_copy_video_and_cut_audio() {
        let args = build_overlay_args(
            Path::new("/v/in.mp4"),
            Path::new("/v/voice.m4a"),
            Duration::from_millis(12_500),
            Path::new("/v/out.mp4"),
        );

        assert_eq!(value_after(&args, "-c:v"), Some("copy"));
        assert_eq!(value_after(&args, "-t"), Some("12.500000"));
        assert_eq!(
            args.iter().filter(|a| *a == "-map").count(),
            2,
            "exactly one video and one audio stream"
        );
        assert_eq!(args.last().map(String::as_str), Some("/v/out.mp4"));
    }

    #[test]
    fn test_parse_probe_duration() {
        assert_eq!(
            parse_probe_duration("10.000000\n").unwrap(),
            Duration::from_secs(10)
        );
        assert!(parse_probe_duration("N/A").is_err());
        assert!(parse_probe_duration("").is_err());
    }

    #[test]
    fn test_classify_busy_failure() {
        assert!(classify_failure("Device or resource busy").is_transient());
        assert!(!classify_failure("Invalid data found when processing input").is_transient());
    }
}
