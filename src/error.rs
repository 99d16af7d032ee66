//! Error types surfaced by the capture session
//!
//! `CaptureError` is what acquisition, encoders and the recording engine
//! return. The session never hands these to callers directly: it records the
//! matching `ErrorCode` in its snapshot and drops back to idle.

use serde::Serialize;

/// Stable error vocabulary exposed on the session snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    #[default]
    None,
    PermissionDenied,
    DeviceUnavailable,
    NoRecorderAvailable,
    UnsupportedCapability,
    EncoderInitializationFailed,
}

impl ErrorCode {
    pub fn is_none(&self) -> bool {
        matches!(self, ErrorCode::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::None => "NONE",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::DeviceUnavailable => "DEVICE_UNAVAILABLE",
            ErrorCode::NoRecorderAvailable => "NO_RECORDER_AVAILABLE",
            ErrorCode::UnsupportedCapability => "UNSUPPORTED_CAPABILITY",
            ErrorCode::EncoderInitializationFailed => "ENCODER_INITIALIZATION_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while acquiring media or running the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    PermissionDenied(String),
    DeviceUnavailable(String),
    UnsupportedCapability(String),
    NoRecorderAvailable(String),
    EncoderInitializationFailed(String),
}

impl CaptureError {
    /// The observable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            CaptureError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            CaptureError::DeviceUnavailable(_) => ErrorCode::DeviceUnavailable,
            CaptureError::UnsupportedCapability(_) => ErrorCode::UnsupportedCapability,
            CaptureError::NoRecorderAvailable(_) => ErrorCode::NoRecorderAvailable,
            CaptureError::EncoderInitializationFailed(_) => ErrorCode::EncoderInitializationFailed,
        }
    }
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::PermissionDenied(e) => write!(f, "Permission to capture denied: {}", e),
            CaptureError::DeviceUnavailable(e) => write!(f, "Capture device unavailable: {}", e),
            CaptureError::UnsupportedCapability(e) => {
                write!(f, "Capture capability not supported: {}", e)
            }
            CaptureError::NoRecorderAvailable(e) => write!(f, "No recorder available: {}", e),
            CaptureError::EncoderInitializationFailed(e) => {
                write!(f, "Encoder initialization failed: {}", e)
            }
        }
    }
}

impl std::error::Error for CaptureError {}

/// Errors returned when a command cannot be delivered to the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// The session loop has shut down (teardown or drop).
    Closed,
    /// The command queue is full; the caller may retry.
    Busy,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Closed => write!(f, "Session has been torn down"),
            SessionError::Busy => write!(f, "Session command queue is full"),
        }
    }
}

impl std::error::Error for SessionError {}

impl<T> From<tokio::sync::mpsc::error::TrySendError<T>> for SessionError {
    fn from(err: tokio::sync::mpsc::error::TrySendError<T>) -> Self {
        match err {
            tokio::sync::mpsc::error::TrySendError::Full(_) => SessionError::Busy,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SessionError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SessionError::Closed
    }
}
