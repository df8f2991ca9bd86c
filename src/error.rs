//! Custom error types for the application.
//!
//! Each layer owns a focused error enum: [`LinkError`] for the trigger device
//! link, [`WorkerError`] for capture worker processes and [`ConfigError`] for
//! configuration loading. `SyncError` is the top-level type that the
//! coordinator, the recording session and library callers see. Using `#[from]`,
//! it is created from the layer errors with the `?` operator.
//!
//! Per-camera failures during a broadcast never become a `SyncError`: they stay
//! inside the camera's slot of a [`crate::FanOutResult`].

use crate::config::ConfigError;
use crate::trigger::link::LinkError;
use crate::trigger::TriggerState;
use crate::worker::WorkerError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, SyncError>;

/// Top-level error for synchronized capture operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The trigger device link failed.
    #[error("Trigger link error: {0}")]
    Link(#[from] LinkError),

    /// A capture worker failed outside of a broadcast operation.
    #[error("Capture worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File system error (session directories, metadata).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No camera is available to record with.
    #[error("No cameras available")]
    NoCameras,

    /// A camera id that the coordinator does not manage.
    #[error("Unknown camera '{0}'")]
    UnknownCamera(String),

    /// The trigger device is not idle and cannot start a new session.
    #[error("Trigger device is busy (state {0})")]
    DeviceBusy(TriggerState),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::UnknownCamera("cam9".to_string());
        assert_eq!(err.to_string(), "Unknown camera 'cam9'");
    }

    #[test]
    fn test_layer_errors_convert() {
        let err: SyncError = LinkError::NotConnected.into();
        assert!(err.to_string().starts_with("Trigger link error"));

        let err: SyncError = WorkerError::Command("Camera not connected".into()).into();
        assert!(err.to_string().contains("Camera not connected"));
    }

    #[test]
    fn test_device_busy_names_state() {
        let err = SyncError::DeviceBusy(TriggerState::Recording);
        assert_eq!(err.to_string(), "Trigger device is busy (state RECORDING)");
    }
}
