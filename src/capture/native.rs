//! Desktop camera backend using nokhwa
//!
//! The camera is read on a dedicated thread and every decoded frame is pushed
//! as RGBA into the sink. With the `native-audio` feature the default input
//! device is opened through cpal on a second thread, since cpal streams are
//! not `Send` on every host.
//!
//! Desktop machines have no notion of front and back cameras, so the first
//! enumerated camera is reported as `Front` and the second (if any) as `Back`.

use crate::capture::traits::{
    CameraBackend, CameraInfo, CameraPosition, FrameSink, Orientation, PermissionStatus,
    PixelFormat, QualityPreset, RawFrame, Resolution,
};
use crate::utils::error::{CaptureError, CaptureResult};
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
};
use nokhwa::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Frame rate asked of the camera; sampling keeps far fewer
const CAMERA_FPS: u32 = 30;

struct Input {
    position: CameraPosition,
    index: CameraIndex,
    preset: QualityPreset,
}

pub struct NativeCamera {
    input: Option<Input>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    /// Shared origin so capture times stay monotonic across stream restarts
    epoch: Instant,
}

impl NativeCamera {
    pub fn new() -> Self {
        Self {
            input: None,
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            epoch: Instant::now(),
        }
    }

    fn enumerate() -> CaptureResult<Vec<(CameraIndex, CameraInfo)>> {
        let devices = nokhwa::query(ApiBackend::Auto)
            .map_err(|e| CaptureError::DeviceUnavailable(format!("camera query failed: {}", e)))?;

        Ok(devices
            .into_iter()
            .take(2)
            .enumerate()
            .map(|(i, info)| {
                let position = if i == 0 {
                    CameraPosition::Front
                } else {
                    CameraPosition::Back
                };
                let index = info.index().clone();
                let id = match &index {
                    CameraIndex::Index(i) => i.to_string(),
                    CameraIndex::String(s) => s.to_string(),
                };
                let camera = CameraInfo {
                    id,
                    name: info.human_name().to_string(),
                    position,
                    supported_resolutions: [
                        QualityPreset::High,
                        QualityPreset::Medium,
                        QualityPreset::Low,
                    ]
                    .iter()
                    .map(|p| p.resolution())
                    .collect(),
                };
                (index, camera)
            })
            .collect())
    }
}

impl Default for NativeCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for NativeCamera {
    fn name(&self) -> &str {
        "nokhwa"
    }

    // nokhwa asks for access itself when the first stream opens
    fn permission_status(&self) -> PermissionStatus {
        match nokhwa::query(ApiBackend::Auto) {
            Ok(_) => PermissionStatus::Granted,
            Err(e) => {
                tracing::warn!("Camera query failed, treating access as undetermined: {}", e);
                PermissionStatus::NotDetermined
            }
        }
    }

    // Desktop cameras have no orientation sensor
    fn native_orientation(&self) -> Orientation {
        Orientation::LandscapeRight
    }

    fn cameras(&self) -> Vec<CameraInfo> {
        match Self::enumerate() {
            Ok(cameras) => cameras.into_iter().map(|(_, info)| info).collect(),
            Err(e) => {
                tracing::warn!("Failed to enumerate cameras: {}", e);
                Vec::new()
            }
        }
    }

    fn add_input(&mut self, position: CameraPosition, preset: QualityPreset) -> CaptureResult<()> {
        let (index, info) = Self::enumerate()?
            .into_iter()
            .find(|(_, info)| info.position == position)
            .ok_or_else(|| CaptureError::DeviceUnavailable(format!("no {} camera", position)))?;

        tracing::info!("Using camera '{}' ({}) as {} input", info.name, info.id, position);
        self.input = Some(Input {
            position,
            index,
            preset,
        });
        Ok(())
    }

    fn remove_input(&mut self) {
        self.input = None;
    }

    fn current_input(&self) -> Option<CameraPosition> {
        self.input.as_ref().map(|i| i.position)
    }

    fn start_stream(&mut self, sink: FrameSink, with_audio: bool) -> CaptureResult<()> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no camera input attached".to_string()))?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match spawn_camera(input, sink.clone(), self.running.clone(), self.epoch) {
            Ok(handle) => self.threads.push(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        if with_audio {
            match microphone::spawn(sink, self.running.clone(), self.epoch) {
                Ok(handle) => self.threads.push(handle),
                Err(e) => {
                    self.stop_stream();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn stop_stream(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for NativeCamera {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

/// Open the camera on its own thread and wait until it is streaming
fn spawn_camera(
    input: &Input,
    sink: FrameSink,
    running: Arc<AtomicBool>,
    epoch: Instant,
) -> CaptureResult<JoinHandle<()>> {
    let index = input.index.clone();
    let preset = input.preset;
    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), String>>(1);

    let handle = std::thread::spawn(move || {
        let target = preset.resolution();
        let mut camera = match open_camera(&index, target) {
            Ok(camera) => camera,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("failed to open camera {:?}: {}", index, e)));
                return;
            }
        };
        if let Err(e) = camera.open_stream() {
            let _ = ready_tx.send(Err(format!("failed to open camera stream: {}", e)));
            return;
        }

        let resolution = camera.resolution();
        tracing::info!(
            "Camera streaming at {}x{} (preset asks for {}x{})",
            resolution.width(),
            resolution.height(),
            target.width,
            target.height
        );
        let _ = ready_tx.send(Ok(()));

        let mut delivered: u64 = 0;
        let mut dropped: u64 = 0;
        while running.load(Ordering::SeqCst) {
            let buffer = match camera.frame() {
                Ok(buffer) => buffer,
                Err(e) => {
                    tracing::debug!("Failed to capture frame: {}", e);
                    continue;
                }
            };
            let captured_at = epoch.elapsed();
            let image = match buffer.decode_image::<RgbAFormat>() {
                Ok(image) => image,
                Err(e) => {
                    tracing::debug!("Failed to decode frame: {}", e);
                    continue;
                }
            };
            let frame = RawFrame {
                width: image.width(),
                height: image.height(),
                data: image.into_raw(),
                format: PixelFormat::Rgba8,
                captured_at,
            };
            if sink.push_frame(frame) {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }

        if let Err(e) = camera.stop_stream() {
            tracing::warn!("Error stopping camera stream: {}", e);
        }
        tracing::info!(
            "Camera thread stopped ({} frames delivered, {} dropped)",
            delivered,
            dropped
        );
    });

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(message)) => {
            let _ = handle.join();
            Err(CaptureError::DeviceUnavailable(message))
        }
        Err(_) => {
            let _ = handle.join();
            Err(CaptureError::DeviceUnavailable(
                "camera thread exited before streaming".to_string(),
            ))
        }
    }
}

fn closest_format(target: Resolution) -> RequestedFormat<'static> {
    RequestedFormat::new::<RgbAFormat>(RequestedFormatType::Closest(CameraFormat::new_from(
        target.width,
        target.height,
        FrameFormat::MJPEG,
        CAMERA_FPS,
    )))
}

/// Ask for the format closest to the preset, falling back to the largest one
fn open_camera(index: &CameraIndex, target: Resolution) -> Result<Camera, nokhwa::NokhwaError> {
    match Camera::new(index.clone(), closest_format(target)) {
        Ok(camera) => Ok(camera),
        Err(e) => {
            tracing::warn!(
                "Camera has no format near {}x{} ({}), using its highest resolution",
                target.width,
                target.height,
                e
            );
            let highest =
                RequestedFormat::new::<RgbAFormat>(RequestedFormatType::AbsoluteHighestResolution);
            Camera::new(index.clone(), highest)
        }
    }
}

#[cfg(feature = "native-audio")]
mod microphone {
    use super::*;
    use crate::capture::traits::AudioChunk;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::time::Duration;

    /// Run the default input device until `running` clears
    pub(super) fn spawn(
        sink: FrameSink,
        running: Arc<AtomicBool>,
        epoch: Instant,
    ) -> CaptureResult<JoinHandle<()>> {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), String>>(1);

        let handle = std::thread::spawn(move || {
            let stream = match open_input(sink, epoch) {
                Ok(stream) => stream,
                Err(message) => {
                    let _ = ready_tx.send(Err(message));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            while running.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
            tracing::info!("Microphone thread stopped");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(message)) => {
                let _ = handle.join();
                Err(CaptureError::DeviceUnavailable(message))
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::DeviceUnavailable(
                    "microphone thread exited before streaming".to_string(),
                ))
            }
        }
    }

    fn open_input(sink: FrameSink, epoch: Instant) -> Result<cpal::Stream, String> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| "no default input device".to_string())?;
        let supported = device
            .default_input_config()
            .map_err(|e| format!("failed to query input config: {}", e))?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let sample_rate = config.sample_rate.0;
        let channels = config.channels;

        tracing::info!(
            "Microphone: {} @ {}Hz, {} channel(s), {:?}",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate,
            channels,
            sample_format
        );

        let err_fn = |err: cpal::StreamError| tracing::error!("Audio stream error: {}", err);
        let chunk = move |samples: Vec<f32>| AudioChunk {
            samples,
            sample_rate,
            channels,
            captured_at: epoch.elapsed(),
        };

        let stream = match sample_format {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    sink.push_audio(chunk(data.to_vec()));
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let samples = data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                    sink.push_audio(chunk(samples));
                },
                err_fn,
                None,
            ),
            other => return Err(format!("unsupported sample format {:?}", other)),
        }
        .map_err(|e| format!("failed to build input stream: {}", e))?;

        stream
            .play()
            .map_err(|e| format!("failed to start input stream: {}", e))?;
        Ok(stream)
    }
}

#[cfg(not(feature = "native-audio"))]
mod microphone {
    use super::*;

    pub(super) fn spawn(
        _sink: FrameSink,
        _running: Arc<AtomicBool>,
        _epoch: Instant,
    ) -> CaptureResult<JoinHandle<()>> {
        Err(CaptureError::DeviceUnavailable(
            "built without microphone support (enable the native-audio feature)".to_string(),
        ))
    }
}
