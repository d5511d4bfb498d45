//! Timelapse recording
//!
//! - `state`: session lifecycle and active-time accounting
//! - `sampler`: decides which device frames become timelapse frames
//! - `store`: on-disk spool of sampled frames
//! - `coordinator`: the actor tying device, sampler and compiler together

pub mod coordinator;
pub mod sampler;
pub mod spool;
pub mod state;
pub mod store;

pub use coordinator::{RecorderEvent, TimelapseRecorder};
pub use sampler::{FrameSampler, SampleDecision};
pub use spool::{FrameSpool, SpoolReport};
pub use state::{RecorderSnapshot, RecordingState};
pub use store::{FrameStore, SampledFrame};
