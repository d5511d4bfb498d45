//! Recording coordinator
//!
//! A single tokio task owns the capture device, the session and any in-flight
//! compilation. Commands from [`TimelapseRecorder`] handles arrive through a
//! bounded mailbox; camera frames and microphone chunks each have their own
//! small queue so a burst of one never crowds out the other. Queued device
//! events are handled before commands, so a `pause()` never overtakes audio
//! captured ahead of it. Accepted frames are written by the session's
//! [`FrameSpool`] thread. Observers follow along through a `watch` snapshot
//! and a `broadcast` event stream.

use crate::capture::audio::{AudioTrack, AudioTrackWriter};
use crate::capture::device::{CameraResource, CaptureDevice};
use crate::capture::still::StillImage;
use crate::capture::traits::{AudioChunk, CameraPosition, DeviceEvent, Orientation, RawFrame};
use crate::config::RecorderConfig;
use crate::export::backend::MediaBackend;
use crate::export::ffmpeg::FfmpegBackend;
use crate::export::overlay::AudioOverlayMuxer;
use crate::export::pipeline::{AssemblyJob, VideoAssembler};
use crate::export::types::{CompiledVideo, ExportError, ExportProgress, OverlayOutcome};
use crate::recorder::sampler::{interval_from_secs, FrameSampler, SampleDecision};
use crate::recorder::spool::{FrameSpool, SpoolReport};
use crate::recorder::state::{CaptureSession, RecorderSnapshot, RecordingState, Transition};
use crate::recorder::store::FrameStore;
use crate::utils::error::{CaptureError, CaptureResult, ErrorResponse};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;
const LIVE_AUDIO_FILE: &str = "live-audio.wav";
/// Accepted frames waiting for the spool writer
const SPOOL_DEPTH: usize = 8;

/// Events emitted by the recorder
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RecorderEvent {
    Started { session_id: Uuid },
    Paused { active_duration: Duration },
    Resumed,
    Stopped { frame_count: u64, active_duration: Duration },
    FrameSampled { sequence_index: u64, output_timestamp: Duration },
    CompileProgress { progress: ExportProgress },
    Completed { video: CompiledVideo },
    Failed { error: ErrorResponse },
    Cancelled,
    /// A command was ignored because the current state does not allow it
    InvalidTransition { error: ErrorResponse },
}

type Reply<T> = oneshot::Sender<CaptureResult<T>>;

enum Command {
    Configure { position: CameraPosition, reply: Reply<()> },
    SwitchPosition { reply: Reply<CameraPosition> },
    SetCaptureInterval { seconds: f64, reply: Reply<()> },
    ToggleAudio { enabled: bool, reply: Reply<()> },
    Start { reply: Reply<()> },
    Pause { reply: Reply<()> },
    Resume { reply: Reply<()> },
    Stop { reply: Reply<()> },
    Cancel { reply: Reply<()> },
    ClearFrames { reply: Reply<()> },
    RetryCompilation { reply: Reply<()> },
    Snapshot { reply: Reply<RecorderSnapshot> },
}

enum Message {
    Command(Command),
    OverlayFailed(ErrorResponse),
    Shutdown(oneshot::Sender<()>),
}

/// Cancel flags of running voiceover merges
#[derive(Clone, Default)]
struct OverlayRegistry {
    flags: Arc<Mutex<Vec<Weak<AtomicBool>>>>,
}

impl OverlayRegistry {
    fn register(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut flags = self.flags.lock();
        flags.retain(|f| f.strong_count() > 0);
        flags.push(Arc::downgrade(&flag));
        flag
    }

    fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for flag in self.flags.lock().drain(..) {
            if let Some(flag) = flag.upgrade() {
                flag.store(true, Ordering::SeqCst);
                cancelled += 1;
            }
        }
        cancelled
    }
}

/// Handle to a running recorder. Cheap to clone; the recorder stops when
/// every handle is dropped or [`TimelapseRecorder::shutdown`] is called.
#[derive(Clone)]
pub struct TimelapseRecorder {
    tx: mpsc::Sender<Message>,
    snapshot: watch::Receiver<RecorderSnapshot>,
    events: broadcast::Sender<RecorderEvent>,
    media: Arc<dyn MediaBackend>,
    overlays: OverlayRegistry,
}

impl TimelapseRecorder {
    /// Spawn a recorder that encodes with the configured ffmpeg binaries.
    /// Must be called from within a tokio runtime.
    pub fn spawn(resource: CameraResource, config: RecorderConfig) -> CaptureResult<Self> {
        let media = Arc::new(FfmpegBackend::new(
            config.ffmpeg_path.clone(),
            config.ffprobe_path.clone(),
        ));
        Self::spawn_with_media(resource, config, media)
    }

    /// Spawn a recorder with an explicit media backend
    pub fn spawn_with_media(
        resource: CameraResource,
        config: RecorderConfig,
        media: Arc<dyn MediaBackend>,
    ) -> CaptureResult<Self> {
        config.validate()?;
        let sampling_interval = config.sampling_interval()?;

        let (tx, rx) = mpsc::channel(config.mailbox_capacity);
        let (frames_tx, frames_rx) = mpsc::channel(config.frame_queue_capacity);
        let (audio_tx, audio_rx) = mpsc::channel(config.audio_queue_capacity);
        let (spool_tx, spool_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let overlays = OverlayRegistry::default();

        let initial = RecorderSnapshot {
            orientation: config.orientation.unwrap_or_default(),
            audio_enabled: config.audio_enabled,
            sampling_interval_secs: config.sampling_interval_seconds,
            ..RecorderSnapshot::default()
        };
        let (snapshot_tx, snapshot) = watch::channel(initial);

        let actor = RecorderActor {
            rx,
            frames_rx,
            frames_tx,
            audio_rx,
            audio_tx,
            spool_rx,
            spool_tx,
            audio_enabled: config.audio_enabled,
            sampling_interval,
            config,
            resource,
            media: media.clone(),
            device: None,
            orientation_rx: None,
            session: None,
            compile: None,
            compiled: None,
            last_error: None,
            overlays: overlays.clone(),
            snapshot_tx,
            events: events.clone(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            tx,
            snapshot,
            events,
            media,
            overlays,
        })
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> CaptureResult<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Message::Command(make(reply)))
            .await
            .map_err(|_| CaptureError::RecorderClosed)?;
        response.await.map_err(|_| CaptureError::RecorderClosed)?
    }

    /// Acquire the camera at `position` and start streaming
    pub async fn configure(&self, position: CameraPosition) -> CaptureResult<()> {
        self.request(|reply| Command::Configure { position, reply }).await
    }

    /// Swap to the opposite camera; rejected while recording or paused
    pub async fn switch_position(&self) -> CaptureResult<CameraPosition> {
        self.request(|reply| Command::SwitchPosition { reply }).await
    }

    /// Set the sampling interval for the next session
    pub async fn set_capture_interval(&self, seconds: f64) -> CaptureResult<()> {
        self.request(|reply| Command::SetCaptureInterval { seconds, reply })
            .await
    }

    /// Enable or disable the live audio track for the next session
    pub async fn toggle_audio(&self, enabled: bool) -> CaptureResult<()> {
        self.request(|reply| Command::ToggleAudio { enabled, reply }).await
    }

    pub async fn start(&self) -> CaptureResult<()> {
        self.request(|reply| Command::Start { reply }).await
    }

    pub async fn pause(&self) -> CaptureResult<()> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> CaptureResult<()> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// End capture and begin compiling in the background.
    /// Use [`TimelapseRecorder::wait_for_compilation`] for the result.
    pub async fn stop(&self) -> CaptureResult<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Abort everything, discard frames and release the camera
    pub async fn cancel(&self) -> CaptureResult<()> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Discard the finished or failed take and return to Idle
    pub async fn clear_frames(&self) -> CaptureResult<()> {
        self.request(|reply| Command::ClearFrames { reply }).await
    }

    /// Compile a failed session again from its retained frames
    pub async fn retry_compilation(&self) -> CaptureResult<()> {
        self.request(|reply| Command::RetryCompilation { reply })
            .await
    }

    /// Current state with a live active duration
    pub async fn snapshot(&self) -> CaptureResult<RecorderSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Snapshot stream, updated at every state change and sampled frame
    pub fn subscribe(&self) -> watch::Receiver<RecorderSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    /// Wait until the recorder is Idle, Completed or Failed
    pub async fn wait_for_compilation(&self) -> CaptureResult<RecorderSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| {
                !s.is_compiling
                    && matches!(
                        s.state,
                        RecordingState::Idle | RecordingState::Completed | RecordingState::Failed
                    )
            })
            .await
            .map_err(|_| CaptureError::RecorderClosed)?
            .clone();
        Ok(snapshot)
    }

    /// Merge a narration track onto a compiled video, writing `output_path`.
    /// The inputs are never modified; a failure leaves no output behind.
    pub async fn add_voiceover_to_video(
        &self,
        video_path: impl AsRef<Path>,
        voiceover_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
    ) -> CaptureResult<OverlayOutcome> {
        let video = video_path.as_ref().to_path_buf();
        let voiceover = voiceover_path.as_ref().to_path_buf();
        let output = output_path.as_ref().to_path_buf();

        let cancel = self.overlays.register();
        let muxer = AudioOverlayMuxer::new(self.media.clone(), cancel);
        tracing::info!("Adding voiceover {:?} to {:?}", voiceover, video);

        let result = tokio::task::spawn_blocking(move || muxer.run(&video, &voiceover, &output))
            .await
            .unwrap_or_else(|e| Err(CaptureError::OverlayFailed(format!("overlay task failed: {}", e))));

        if let Err(e) = &result {
            if !matches!(e, CaptureError::Cancelled) {
                tracing::error!("Voiceover failed: {}", e);
                let error = ErrorResponse::from(e);
                let _ = self.events.send(RecorderEvent::Failed {
                    error: error.clone(),
                });
                let _ = self.tx.send(Message::OverlayFailed(error)).await;
            }
        }
        result
    }

    /// Cancel in-flight work and stop the recorder task
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.tx.send(Message::Shutdown(done)).await.is_ok() {
            let _ = finished.await;
        }
    }
}

/// Per-session state owned by the actor.
///
/// Field order is drop order: the audio writer closes its file before the
/// store removes the session directory.
struct ActiveSession {
    session: CaptureSession,
    sampler: FrameSampler,
    /// Frames handed to the spool so far
    queued: u64,
    audio: Option<AudioTrackWriter>,
    audio_track: Option<AudioTrack>,
    /// Owns the store while recording
    spool: Option<FrameSpool>,
    /// Absent while recording or while a compilation holds it
    store: Option<FrameStore>,
}

struct CompileOutput {
    result: Result<CompiledVideo, ExportError>,
    store: FrameStore,
}

struct InFlight {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<CompileOutput>,
}

struct RecorderActor {
    rx: mpsc::Receiver<Message>,
    frames_rx: mpsc::Receiver<RawFrame>,
    frames_tx: mpsc::Sender<RawFrame>,
    audio_rx: mpsc::Receiver<AudioChunk>,
    audio_tx: mpsc::Sender<AudioChunk>,
    spool_rx: mpsc::UnboundedReceiver<SpoolReport>,
    spool_tx: mpsc::UnboundedSender<SpoolReport>,
    config: RecorderConfig,
    resource: CameraResource,
    media: Arc<dyn MediaBackend>,
    device: Option<CaptureDevice>,
    orientation_rx: Option<watch::Receiver<Orientation>>,
    sampling_interval: Duration,
    audio_enabled: bool,
    session: Option<ActiveSession>,
    compile: Option<InFlight>,
    compiled: Option<CompiledVideo>,
    last_error: Option<ErrorResponse>,
    overlays: OverlayRegistry,
    snapshot_tx: watch::Sender<RecorderSnapshot>,
    events: broadcast::Sender<RecorderEvent>,
}

async fn compile_finished(compile: &mut Option<InFlight>) -> Result<CompileOutput, JoinError> {
    match compile.as_mut() {
        Some(in_flight) => (&mut in_flight.handle).await,
        None => std::future::pending().await,
    }
}

async fn orientation_changed(rx: &mut Option<watch::Receiver<Orientation>>) -> bool {
    match rx.as_mut() {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

impl RecorderActor {
    async fn run(mut self) {
        tracing::info!("Recorder started");
        loop {
            tokio::select! {
                biased;

                output = compile_finished(&mut self.compile) => {
                    self.compile = None;
                    self.on_compile_finished(output);
                }
                Some(report) = self.spool_rx.recv() => self.on_spooled(report),
                Some(frame) = self.frames_rx.recv() => self.on_frame(frame).await,
                Some(chunk) = self.audio_rx.recv() => self.on_audio(chunk),
                message = self.rx.recv() => match message {
                    Some(Message::Command(command)) => self.handle_command(command).await,
                    Some(Message::OverlayFailed(error)) => {
                        self.last_error = Some(error);
                        self.publish();
                    }
                    Some(Message::Shutdown(done)) => {
                        self.teardown().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                alive = orientation_changed(&mut self.orientation_rx) => {
                    if alive {
                        self.publish();
                    } else {
                        self.orientation_rx = None;
                    }
                }
            }
        }
        tracing::info!("Recorder stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Configure { position, reply } => {
                let result = self.configure(position).await;
                self.respond(reply, result);
            }
            Command::SwitchPosition { reply } => {
                let result = self.switch_position();
                self.respond(reply, result);
            }
            Command::SetCaptureInterval { seconds, reply } => {
                let result = self.set_capture_interval(seconds);
                self.respond(reply, result);
            }
            Command::ToggleAudio { enabled, reply } => {
                let result = self.toggle_audio(enabled);
                self.respond(reply, result);
            }
            Command::Start { reply } => {
                let result = self.start();
                self.respond(reply, result);
            }
            Command::Pause { reply } => {
                let result = self.pause();
                self.respond(reply, result);
            }
            Command::Resume { reply } => {
                let result = self.resume();
                self.respond(reply, result);
            }
            Command::Stop { reply } => {
                let result = self.stop().await;
                self.respond(reply, result);
            }
            Command::Cancel { reply } => {
                self.cancel().await;
                self.respond(reply, Ok(()));
            }
            Command::ClearFrames { reply } => {
                let result = self.clear_frames().await;
                self.respond(reply, result);
            }
            Command::RetryCompilation { reply } => {
                let result = self.retry_compilation();
                self.respond(reply, result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
        }
    }

    fn respond<T>(&self, reply: Reply<T>, result: CaptureResult<T>) {
        if let Err(e) = &result {
            if matches!(e, CaptureError::InvalidStateTransition { .. }) {
                let _ = self.events.send(RecorderEvent::InvalidTransition {
                    error: ErrorResponse::from(e),
                });
            }
            if e.is_non_fatal() {
                tracing::warn!("Command rejected: {}", e);
            } else {
                tracing::error!("Command failed: {}", e);
            }
        }
        let _ = reply.send(result);
    }

    fn state(&self) -> RecordingState {
        self.session
            .as_ref()
            .map(|s| s.session.state)
            .unwrap_or(RecordingState::Idle)
    }

    fn is_capturing(&self) -> bool {
        self.state().is_capturing()
    }

    fn emit(&self, event: RecorderEvent) {
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> RecorderSnapshot {
        let now = Instant::now();
        let session = self.session.as_ref();
        let orientation = match (session, &self.device) {
            (Some(s), _) => s.session.orientation,
            (None, Some(device)) => device.orientation(),
            (None, None) => self.config.orientation.unwrap_or_default(),
        };

        RecorderSnapshot {
            state: self.state(),
            frame_count: session.map(|s| s.session.frame_count).unwrap_or(0),
            active_duration: session
                .map(|s| s.session.active_duration(now))
                .unwrap_or_default(),
            is_compiling: self.compile.is_some(),
            compiled_video: self.compiled.clone(),
            last_error: self.last_error.clone(),
            position: self.device.as_ref().map(|d| d.position()),
            orientation,
            audio_enabled: self.audio_enabled,
            sampling_interval_secs: self.sampling_interval.as_secs_f64(),
            can_retry: session.is_some_and(|s| {
                s.session.state == RecordingState::Failed && s.store.is_some()
            }),
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    /// Device callback: never blocks the camera thread
    fn deliver_fn(&self) -> impl Fn(DeviceEvent) -> bool + Send + Sync + 'static {
        let frames = self.frames_tx.clone();
        let audio = self.audio_tx.clone();
        move |event| match event {
            DeviceEvent::Frame(frame) => {
                let delivered = frames.try_send(frame).is_ok();
                if !delivered {
                    tracing::debug!("Frame queue full, dropping frame");
                }
                delivered
            }
            DeviceEvent::Audio(chunk) => {
                let delivered = audio.try_send(chunk).is_ok();
                if !delivered {
                    tracing::warn!("Audio queue full, dropping chunk");
                }
                delivered
            }
        }
    }

    async fn configure(&mut self, position: CameraPosition) -> CaptureResult<()> {
        if self.device.is_some() {
            return Err(CaptureError::AlreadyConfigured);
        }

        let resource = self.resource.clone();
        let quality = self.config.quality;
        let orientation = self.config.orientation;
        let mut device = tokio::task::spawn_blocking(move || {
            CaptureDevice::configure(&resource, position, quality, orientation)
        })
        .await
        .map_err(|e| CaptureError::DeviceUnavailable(format!("configure task failed: {}", e)))??;

        device.start(self.deliver_fn(), self.audio_enabled)?;
        self.orientation_rx = Some(device.watch_orientation());
        self.device = Some(device);
        self.publish();
        Ok(())
    }

    fn switch_position(&mut self) -> CaptureResult<CameraPosition> {
        let session_active = self.is_capturing();
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no camera configured".to_string()))?;
        let position = device.switch_position(session_active)?;
        self.publish();
        Ok(position)
    }

    fn set_capture_interval(&mut self, seconds: f64) -> CaptureResult<()> {
        if self.is_capturing() {
            return Err(CaptureError::CannotChangeWhileRecording);
        }
        self.sampling_interval = interval_from_secs(seconds)?;
        tracing::info!("Capture interval set to {:?}", self.sampling_interval);
        self.publish();
        Ok(())
    }

    fn toggle_audio(&mut self, enabled: bool) -> CaptureResult<()> {
        if self.is_capturing() {
            return Err(CaptureError::CannotChangeWhileRecording);
        }
        self.audio_enabled = enabled;
        self.publish();
        Ok(())
    }

    fn start(&mut self) -> CaptureResult<()> {
        let state = self.state();
        if state != RecordingState::Idle {
            return Err(CaptureError::InvalidStateTransition {
                from: state,
                action: Transition::Start.verb(),
            });
        }

        let deliver = self.deliver_fn();
        let audio_enabled = self.audio_enabled;
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no camera configured".to_string()))?;
        device.start(deliver, audio_enabled)?;
        let orientation = device.orientation();

        let store = FrameStore::create_in(&self.config.work_dir)?;
        let audio = audio_enabled.then(|| AudioTrackWriter::new(&store.session_file(LIVE_AUDIO_FILE)));
        let session = CaptureSession::start(
            self.sampling_interval,
            self.config.output_frame_rate,
            orientation,
            audio_enabled,
            Instant::now(),
        )?;
        let session_id = session.id;
        let spool = FrameSpool::spawn(
            store,
            session_id,
            self.config.output_frame_rate,
            SPOOL_DEPTH,
            self.spool_tx.clone(),
        )?;

        tracing::info!(
            "Recording started: session={}, interval={:?}, orientation={:?}, audio={}",
            session_id,
            self.sampling_interval,
            orientation,
            audio_enabled
        );

        self.session = Some(ActiveSession {
            sampler: FrameSampler::new(self.sampling_interval, self.config.output_frame_rate),
            session,
            queued: 0,
            audio,
            audio_track: None,
            spool: Some(spool),
            store: None,
        });
        self.last_error = None;
        self.emit(RecorderEvent::Started { session_id });
        self.publish();
        Ok(())
    }

    fn session_mut(&mut self, transition: Transition) -> CaptureResult<&mut ActiveSession> {
        self.session
            .as_mut()
            .ok_or(CaptureError::InvalidStateTransition {
                from: RecordingState::Idle,
                action: transition.verb(),
            })
    }

    fn pause(&mut self) -> CaptureResult<()> {
        let now = Instant::now();
        let active = self.session_mut(Transition::Pause)?;
        active.session.transition(Transition::Pause, now)?;
        let active_duration = active.session.active_duration(now);

        tracing::info!("Recording paused at {:?} active", active_duration);
        self.emit(RecorderEvent::Paused { active_duration });
        self.publish();
        Ok(())
    }

    fn resume(&mut self) -> CaptureResult<()> {
        let active = self.session_mut(Transition::Resume)?;
        active.session.transition(Transition::Resume, Instant::now())?;

        tracing::info!("Recording resumed");
        self.emit(RecorderEvent::Resumed);
        self.publish();
        Ok(())
    }

    async fn stop(&mut self) -> CaptureResult<()> {
        let now = Instant::now();
        let spool = {
            let active = self.session_mut(Transition::Stop)?;
            active.session.transition(Transition::Stop, now)?;

            if let Some(writer) = active.audio.take() {
                match writer.finalize() {
                    Ok(Some(track)) => {
                        tracing::info!("Live audio track holds {:?}", track.duration);
                        active.audio_track = Some(track);
                    }
                    Ok(None) => tracing::warn!("Audio was enabled but no audio arrived"),
                    Err(e) => tracing::warn!("Live audio track lost: {}", e),
                }
            }
            active.spool.take()
        };

        // Wait for frames still queued for the writer
        if let Some(spool) = spool {
            match spool.finish().await {
                Ok(store) => {
                    if let Some(active) = self.session.as_mut() {
                        active.store = Some(store);
                    }
                }
                Err(e) => {
                    if let Some(active) = self.session.as_mut() {
                        active.session.transition(Transition::Fail, now)?;
                        active.audio_track = None;
                    }
                    self.fail(&e);
                    return Err(e);
                }
            }
        }
        while let Ok(report) = self.spool_rx.try_recv() {
            self.on_spooled(report);
        }

        let (frame_count, active_duration) = match self.session.as_mut() {
            Some(active) => {
                let stored = active.store.as_ref().map(|s| s.len() as u64).unwrap_or(0);
                active.session.frame_count = stored;
                (stored, active.session.active_duration(now))
            }
            None => (0, Duration::ZERO),
        };

        tracing::info!(
            "Recording stopped: {} frames over {:?} active",
            frame_count,
            active_duration
        );
        self.emit(RecorderEvent::Stopped {
            frame_count,
            active_duration,
        });

        if frame_count == 0 {
            if let Some(active) = self.session.as_mut() {
                active.session.transition(Transition::Fail, now)?;
                active.audio_track = None;
                active.store = None;
            }
            let error = CaptureError::EmptyRecording;
            self.fail(&error);
            return Err(error);
        }

        self.begin_compile(Transition::BeginCompile)
    }

    fn retry_compilation(&mut self) -> CaptureResult<()> {
        let active = self.session_mut(Transition::Retry)?;
        if active.session.state == RecordingState::Failed && active.store.is_none() {
            return Err(CaptureError::InvalidStateTransition {
                from: RecordingState::Failed,
                action: Transition::Retry.verb(),
            });
        }
        tracing::info!("Retrying compilation");
        self.begin_compile(Transition::Retry)
    }

    fn begin_compile(&mut self, transition: Transition) -> CaptureResult<()> {
        let now = Instant::now();
        let output_dir = self.config.output_dir().to_path_buf();
        let quality = self.config.quality;
        let media = self.media.clone();
        let events = self.events.clone();
        let active = self.session_mut(transition)?;

        // Refusals leave the session as it was
        active.session.state.apply(transition)?;
        let store = active.store.take().ok_or(CaptureError::InvalidStateTransition {
            from: active.session.state,
            action: transition.verb(),
        })?;
        active.session.transition(transition, now)?;

        let session = &active.session;
        let job = AssemblyJob {
            output_path: output_path(&output_dir, session),
            output_frame_rate: session.output_frame_rate,
            quality,
            orientation: session.orientation,
            audio: active.audio_track.as_ref().map(|t| t.path.clone()),
        };
        tracing::info!("Compiling {} frames into {:?}", store.len(), job.output_path);

        let cancel = Arc::new(AtomicBool::new(false));
        let assembler = VideoAssembler::new(media, cancel.clone());
        let handle = tokio::task::spawn_blocking(move || {
            let result = assembler.run(&store, &job, |progress| {
                let _ = events.send(RecorderEvent::CompileProgress { progress });
            });
            CompileOutput { result, store }
        });

        self.compile = Some(InFlight { cancel, handle });
        self.last_error = None;
        self.publish();
        Ok(())
    }

    fn on_compile_finished(&mut self, output: Result<CompileOutput, JoinError>) {
        let now = Instant::now();
        let Some(active) = self.session.as_mut() else {
            return;
        };

        let (result, store) = match output {
            Ok(CompileOutput { result, store }) => (result, Some(store)),
            Err(e) => (Err(ExportError::Encoding(format!("compile task failed: {}", e))), None),
        };

        match result {
            Ok(video) => {
                if let Err(e) = active.session.transition(Transition::Complete, now) {
                    tracing::error!("Compilation finished in unexpected state: {}", e);
                }
                // Frames and live audio are no longer needed
                drop(store);
                active.audio_track = None;

                tracing::info!(
                    "Compilation complete: {:?} ({} frames, {:.3}s)",
                    video.path,
                    video.frame_count,
                    video.duration_secs
                );
                self.compiled = Some(video.clone());
                self.emit(RecorderEvent::Completed { video });
                self.publish();
            }
            Err(e) => {
                if let Err(transition_err) = active.session.transition(Transition::Fail, now) {
                    tracing::error!("Compilation failed in unexpected state: {}", transition_err);
                }
                let error = CaptureError::from(e);
                let retain = matches!(error, CaptureError::CompilationFailed { retryable: true, .. });
                if retain {
                    active.store = store;
                    tracing::warn!("Compilation failed, frames kept for retry: {}", error);
                } else {
                    active.audio_track = None;
                    drop(store);
                }
                self.fail(&error);
            }
        }
    }

    fn fail(&mut self, error: &CaptureError) {
        tracing::error!("Recording failed: {}", error);
        let response = ErrorResponse::from(error);
        self.last_error = Some(response.clone());
        self.emit(RecorderEvent::Failed { error: response });
        self.publish();
    }

    async fn on_frame(&mut self, frame: RawFrame) {
        let Some(active) = self.session.as_mut() else {
            return;
        };

        let decision = active.sampler.decide(
            active.session.state,
            frame.captured_at,
            active.queued,
        );
        let SampleDecision::Accept { sequence_index, .. } = decision else {
            return;
        };

        if let Err(e) = StillImage::check(&frame) {
            tracing::warn!("Dropping frame captured at {:?}: {}", frame.captured_at, e);
            return;
        }
        let Some(spool) = active.spool.as_ref() else {
            return;
        };

        let captured_at = frame.captured_at;
        if let Err(e) = spool.push(frame).await {
            tracing::warn!("Dropping frame captured at {:?}: {}", captured_at, e);
            return;
        }
        active.sampler.commit(captured_at);
        active.queued += 1;
        tracing::debug!("Queued frame {} captured at {:?}", sequence_index, captured_at);
    }

    /// A frame finished (or failed) writing on the spool thread
    fn on_spooled(&mut self, report: SpoolReport) {
        let Some(active) = self.session.as_mut() else {
            return;
        };
        if active.session.id != report.session_id() {
            return;
        }

        match report {
            SpoolReport::Stored {
                sequence_index,
                output_timestamp,
                ..
            } => {
                active.session.frame_count = sequence_index + 1;
                tracing::debug!("Sampled frame {} -> {:?}", sequence_index, output_timestamp);
                self.emit(RecorderEvent::FrameSampled {
                    sequence_index,
                    output_timestamp,
                });
                self.publish();
            }
            SpoolReport::Dropped {
                captured_at, reason, ..
            } => {
                tracing::warn!("Frame captured at {:?} was not stored: {}", captured_at, reason);
            }
        }
    }

    fn on_audio(&mut self, chunk: AudioChunk) {
        let Some(active) = self.session.as_mut() else {
            return;
        };
        if active.session.state != RecordingState::Recording {
            return;
        }
        if let Some(writer) = active.audio.as_mut() {
            if let Err(e) = writer.append(&chunk) {
                tracing::warn!("Dropping audio chunk: {}", e);
            }
        }
    }

    /// Abort a running compilation and discard its output
    async fn abort_compile(&mut self) {
        if let Some(in_flight) = self.compile.take() {
            in_flight.cancel.store(true, Ordering::SeqCst);
            match in_flight.handle.await {
                Ok(CompileOutput { result: Ok(video), .. }) => {
                    // Finished before it saw the flag
                    remove_video(&video.path);
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Compile task failed during cancel: {}", e),
            }
            tracing::info!("Compilation cancelled");
        }
    }

    /// Drop the session, waiting for its spool writer so nothing lands on disk afterwards
    async fn close_session(&mut self) {
        let Some(mut active) = self.session.take() else {
            return;
        };
        drop(active.audio.take());
        if let Some(spool) = active.spool.take() {
            if let Err(e) = spool.finish().await {
                tracing::error!("Frame spool failed while closing: {}", e);
            }
        }
    }

    async fn discard_take(&mut self) {
        self.close_session().await;
        if let Some(video) = self.compiled.take() {
            remove_video(&video.path);
        }
        self.last_error = None;
    }

    async fn cancel(&mut self) {
        let cancelled_overlays = self.overlays.cancel_all();
        if cancelled_overlays > 0 {
            tracing::info!("Cancelled {} voiceover merge(s)", cancelled_overlays);
        }
        self.abort_compile().await;
        self.discard_take().await;

        // Releases the device lease
        self.device = None;
        self.orientation_rx = None;

        tracing::info!("Recording cancelled");
        self.emit(RecorderEvent::Cancelled);
        self.publish();
    }

    async fn clear_frames(&mut self) -> CaptureResult<()> {
        let state = self.state();
        if !matches!(
            state,
            RecordingState::Idle | RecordingState::Completed | RecordingState::Failed
        ) {
            return Err(CaptureError::InvalidStateTransition {
                from: state,
                action: "clear frames",
            });
        }
        self.discard_take().await;
        tracing::info!("Frames cleared");
        self.publish();
        Ok(())
    }

    async fn teardown(&mut self) {
        self.overlays.cancel_all();
        self.abort_compile().await;
        self.close_session().await;
        self.device = None;
        self.orientation_rx = None;
        self.publish();
    }
}

fn output_path(dir: &Path, session: &CaptureSession) -> PathBuf {
    let id = session.id.simple().to_string();
    dir.join(format!(
        "timelapse-{}-{}.mp4",
        session.started_at.format("%Y%m%d-%H%M%S"),
        &id[..8]
    ))
}

fn remove_video(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!("Removed compiled video {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!("Failed to remove {:?}: {}", path, e),
    }
}
