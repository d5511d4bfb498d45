//! Capture device adapter
//!
//! Owns the single camera/microphone resource. The platform backend lives in
//! a [`CameraResource`] slot and is checked out for the lifetime of one
//! configuration; dropping the [`CaptureDevice`] checks it back in.

use crate::capture::traits::{
    CameraBackend, CameraPosition, DeviceEvent, FrameSink, Orientation, PermissionStatus,
    QualityPreset,
};
use crate::utils::error::{CaptureError, CaptureResult};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

struct Shared {
    backend: Mutex<Box<dyn CameraBackend>>,
    checked_out: AtomicBool,
}

/// Owned handle to the physical capture hardware.
///
/// Cloning shares the same backend; at most one [`DeviceLease`] exists at a time.
#[derive(Clone)]
pub struct CameraResource {
    shared: Arc<Shared>,
}

impl CameraResource {
    pub fn new<B: CameraBackend>(backend: B) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend: Mutex::new(Box::new(backend)),
                checked_out: AtomicBool::new(false),
            }),
        }
    }

    /// Take exclusive ownership of the backend
    pub fn checkout(&self) -> CaptureResult<DeviceLease> {
        self.shared
            .checked_out
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CaptureError::AlreadyConfigured)?;
        tracing::debug!("Checked out capture backend '{}'", self.shared.backend.lock().name());
        Ok(DeviceLease {
            shared: self.shared.clone(),
        })
    }

    /// Whether the backend is currently checked in
    pub fn is_available(&self) -> bool {
        !self.shared.checked_out.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CameraResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraResource")
            .field("available", &self.is_available())
            .finish()
    }
}

/// Checked-out backend; returned to its resource on drop
pub struct DeviceLease {
    shared: Arc<Shared>,
}

impl DeviceLease {
    fn backend(&self) -> MutexGuard<'_, Box<dyn CameraBackend>> {
        self.shared.backend.lock()
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        tracing::debug!("Checked in capture backend '{}'", self.backend().name());
        self.shared.checked_out.store(false, Ordering::Release);
    }
}

/// A configured camera ready to stream
pub struct CaptureDevice {
    lease: DeviceLease,
    position: CameraPosition,
    preset: QualityPreset,
    streaming: Option<bool>,
    orientation: Arc<watch::Sender<Orientation>>,
}

impl CaptureDevice {
    /// Acquire the device and attach the camera at `position`
    pub fn configure(
        resource: &CameraResource,
        position: CameraPosition,
        preset: QualityPreset,
        orientation_override: Option<Orientation>,
    ) -> CaptureResult<Self> {
        let lease = resource.checkout()?;
        let mut backend = lease.backend();

        match backend.permission_status() {
            PermissionStatus::Granted => {}
            status => {
                return Err(CaptureError::PermissionDenied(format!(
                    "camera access is {:?}",
                    status
                )))
            }
        }

        ensure_camera(&**backend, position)?;
        backend.add_input(position, preset)?;
        let initial_orientation = orientation_override.unwrap_or_else(|| backend.native_orientation());

        tracing::info!(
            "Capture device configured: backend={}, position={}, preset={:?}, orientation={:?}",
            backend.name(),
            position,
            preset,
            initial_orientation
        );
        drop(backend);

        let (orientation, _) = watch::channel(initial_orientation);
        Ok(Self {
            lease,
            position,
            preset,
            streaming: None,
            orientation: Arc::new(orientation),
        })
    }

    pub fn position(&self) -> CameraPosition {
        self.position
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    /// Last orientation reported by the backend
    pub fn orientation(&self) -> Orientation {
        *self.orientation.borrow()
    }

    pub fn watch_orientation(&self) -> watch::Receiver<Orientation> {
        self.orientation.subscribe()
    }

    /// Swap to the opposite camera.
    ///
    /// The old input is restored when the new one cannot be attached, so the
    /// device is never left without an input.
    pub fn switch_position(&mut self, session_active: bool) -> CaptureResult<CameraPosition> {
        if session_active {
            return Err(CaptureError::SwitchDuringRecording);
        }

        let current = self.position;
        let target = current.opposite();
        let preset = self.preset;
        let mut backend = self.lease.backend();
        ensure_camera(&**backend, target)?;

        backend.remove_input();
        if let Err(e) = backend.add_input(target, preset) {
            tracing::warn!("Failed to attach {} camera, restoring {}: {}", target, current, e);
            if let Err(restore_err) = backend.add_input(current, preset) {
                tracing::error!("Failed to restore {} camera: {}", current, restore_err);
            }
            return Err(e);
        }
        drop(backend);

        self.position = target;
        tracing::info!("Switched camera: {} -> {}", current, target);
        Ok(target)
    }

    /// Begin streaming. Calling again with the same audio setting is a no-op.
    pub fn start<F>(&mut self, deliver: F, with_audio: bool) -> CaptureResult<()>
    where
        F: Fn(DeviceEvent) -> bool + Send + Sync + 'static,
    {
        match self.streaming {
            Some(audio) if audio == with_audio => return Ok(()),
            Some(_) => self.stop(),
            None => {}
        }

        let sink = FrameSink::new(deliver, self.orientation.clone());
        self.lease.backend().start_stream(sink, with_audio)?;
        self.streaming = Some(with_audio);
        tracing::info!("Capture stream started (audio={})", with_audio);
        Ok(())
    }

    /// Stop streaming; no-op when already stopped
    pub fn stop(&mut self) {
        if self.streaming.take().is_some() {
            self.lease.backend().stop_stream();
            tracing::info!("Capture stream stopped");
        }
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        self.stop();
        self.lease.backend().remove_input();
        tracing::info!("Capture device released");
    }
}

fn ensure_camera(backend: &dyn CameraBackend, position: CameraPosition) -> CaptureResult<()> {
    if backend.cameras().iter().any(|c| c.position == position) {
        Ok(())
    } else {
        Err(CaptureError::DeviceUnavailable(format!(
            "no {} camera on '{}'",
            position,
            backend.name()
        )))
    }
}
