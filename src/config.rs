//! Recorder configuration
//!
//! JSON settings for the capture pipeline. Every field has a default, so an
//! empty object (or no file at all) is a valid configuration.

use crate::capture::traits::{CameraPosition, Orientation, QualityPreset};
use crate::recorder::sampler::interval_from_secs;
use crate::utils::error::{CaptureError, CaptureResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Wall-clock seconds between kept frames
    pub sampling_interval_seconds: f64,
    /// Playback rate of the compiled video
    pub output_frame_rate: u32,
    /// Record a live audio track alongside the frames
    pub audio_enabled: bool,
    pub position: CameraPosition,
    pub quality: QualityPreset,
    /// Fixed orientation overriding the camera's own (unset: use the camera's)
    pub orientation: Option<Orientation>,
    /// Scratch space for frame spools and partial outputs
    pub work_dir: PathBuf,
    /// Where compiled videos are written (defaults to `work_dir`)
    pub output_dir: Option<PathBuf>,
    /// Capacity of the coordinator's command mailbox
    pub mailbox_capacity: usize,
    /// Raw camera frames buffered ahead of the sampler; extra frames are dropped
    pub frame_queue_capacity: usize,
    /// Microphone chunks buffered ahead of the live audio writer
    pub audio_queue_capacity: usize,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            sampling_interval_seconds: 2.0,
            output_frame_rate: 30,
            audio_enabled: false,
            position: CameraPosition::Back,
            quality: QualityPreset::Medium,
            orientation: None,
            work_dir: std::env::temp_dir().join("lapse-recorder"),
            output_dir: None,
            mailbox_capacity: 64,
            frame_queue_capacity: 4,
            audio_queue_capacity: 256,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

impl RecorderConfig {
    /// Load and validate configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: RecorderConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.validate().context("Invalid configuration")?;
        tracing::debug!("Loaded recorder config from {:?}", path);
        Ok(config)
    }

    /// Write configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let payload = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, payload).context("Failed to write config file")?;
        Ok(())
    }

    pub fn validate(&self) -> CaptureResult<()> {
        interval_from_secs(self.sampling_interval_seconds)?;
        if self.output_frame_rate == 0 {
            return Err(CaptureError::InvalidConfig(
                "outputFrameRate must be at least 1".to_string(),
            ));
        }
        for (name, capacity) in [
            ("mailboxCapacity", self.mailbox_capacity),
            ("frameQueueCapacity", self.frame_queue_capacity),
            ("audioQueueCapacity", self.audio_queue_capacity),
        ] {
            if capacity == 0 {
                return Err(CaptureError::InvalidConfig(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn sampling_interval(&self) -> CaptureResult<Duration> {
        interval_from_secs(self.sampling_interval_seconds)
    }

    pub fn output_dir(&self) -> &Path {
        self.output_dir.as_deref().unwrap_or(&self.work_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: RecorderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RecorderConfig::default());
        assert_eq!(config.output_dir(), config.work_dir.as_path());
        assert_eq!(config.orientation, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_camel_case_fields() {
        let config: RecorderConfig = serde_json::from_str(
            r#"{"samplingIntervalSeconds": 5, "outputFrameRate": 24, "position": "front", "outputDir": "/videos", "orientation": "portrait"}"#,
        )
        .unwrap();
        assert_eq!(config.sampling_interval_seconds, 5.0);
        assert_eq!(config.output_frame_rate, 24);
        assert_eq!(config.position, CameraPosition::Front);
        assert_eq!(config.output_dir(), Path::new("/videos"));
        assert_eq!(config.orientation, Some(Orientation::Portrait));
    }

    #[test]
    fn test_validation() {
        let mut config = RecorderConfig::default();
        config.sampling_interval_seconds = 0.0;
        assert!(matches!(config.validate(), Err(CaptureError::InvalidConfig(_))));

        let mut config = RecorderConfig::default();
        config.output_frame_rate = 0;
        assert!(config.validate().is_err());

        let mut config = RecorderConfig::default();
        config.mailbox_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = RecorderConfig::default();
        config.frame_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("recorder.json");
        let mut config = RecorderConfig::default();
        config.audio_enabled = true;
        config.save(&path).unwrap();

        assert_eq!(RecorderConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recorder.json");
        std::fs::write(&path, r#"{"samplingIntervalSeconds": -3}"#).unwrap();

        let err = RecorderConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("sampling interval"));
    }
}
