//! Error types and handling
//!
//! Common error types used across the capture pipeline.

use crate::export::types::ExportError;
use crate::recorder::state::RecordingState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline-wide error type
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Capture device is already configured")]
    AlreadyConfigured,

    #[error("Cannot switch camera while a recording is active")]
    SwitchDuringRecording,

    #[error("Cannot {action} while {from}")]
    InvalidStateTransition {
        from: RecordingState,
        action: &'static str,
    },

    #[error("Cannot change capture settings while recording")]
    CannotChangeWhileRecording,

    #[error("Recording contains no frames")]
    EmptyRecording,

    #[error("Compilation failed: {reason}")]
    CompilationFailed { reason: String, retryable: bool },

    #[error("Voiceover overlay failed: {0}")]
    OverlayFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Frame capture error: {0}")]
    FrameCapture(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Recorder is no longer running")]
    RecorderClosed,
}

impl CaptureError {
    /// Stable identifier used by the UI layer
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::PermissionDenied(_) => "PERMISSION_DENIED",
            CaptureError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            CaptureError::AlreadyConfigured => "ALREADY_CONFIGURED",
            CaptureError::SwitchDuringRecording => "SWITCH_DURING_RECORDING",
            CaptureError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            CaptureError::CannotChangeWhileRecording => "CANNOT_CHANGE_WHILE_RECORDING",
            CaptureError::EmptyRecording => "EMPTY_RECORDING",
            CaptureError::CompilationFailed { .. } => "COMPILATION_FAILED",
            CaptureError::OverlayFailed(_) => "OVERLAY_FAILED",
            CaptureError::InvalidConfig(_) => "INVALID_CONFIG",
            CaptureError::FrameCapture(_) => "FRAME_CAPTURE_ERROR",
            CaptureError::Io(_) => "IO_ERROR",
            CaptureError::Cancelled => "CANCELLED",
            CaptureError::RecorderClosed => "RECORDER_CLOSED",
        }
    }

    /// Whether the session survives this error untouched
    pub fn is_non_fatal(&self) -> bool {
        matches!(
            self,
            CaptureError::InvalidStateTransition { .. }
                | CaptureError::CannotChangeWhileRecording
                | CaptureError::SwitchDuringRecording
                | CaptureError::FrameCapture(_)
        )
    }
}

impl From<ExportError> for CaptureError {
    fn from(error: ExportError) -> Self {
        match error {
            ExportError::EmptyRecording => CaptureError::EmptyRecording,
            ExportError::Cancelled => CaptureError::Cancelled,
            other => CaptureError::CompilationFailed {
                retryable: other.is_transient(),
                reason: other.to_string(),
            },
        }
    }
}

/// Error response for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&CaptureError> for ErrorResponse {
    fn from(error: &CaptureError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

impl From<CaptureError> for ErrorResponse {
    fn from(error: CaptureError) -> Self {
        ErrorResponse::from(&error)
    }
}

/// Result type alias using CaptureError
pub type CaptureResult<T> = Result<T, CaptureError>;
