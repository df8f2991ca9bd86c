//! Capture worker processes.
//!
//! Every camera is served by its own long-lived worker process. The host
//! writes one JSON command per line to the worker's stdin and reads prefixed
//! protocol lines from its stdout:
//!
//! ```text
//! STATUS:<text>        progress and readiness
//! WARNING:<text>       non-fatal problems
//! ERROR:<text>         command failure or asynchronous error
//! DATA:<json>          command result
//! PREVIEW:<data uri>   preview frame
//! FRAME_SAVED:<json>   one frame written to disk
//! ```
//!
//! [`CaptureWorker`] owns the process and serializes commands; the protocol
//! types live in [`protocol`].

pub mod process;
pub mod protocol;

pub use process::CaptureWorker;
pub use protocol::{
    CaptureResult, CaptureSettings, ConnectResponse, DetectedCamera, FrameInfo, InitResponse,
    TriggerMode, WorkerCommand, WorkerMessage, WorkerStatus,
};

use std::time::Duration;
use thiserror::Error;

/// Errors raised while driving a worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The program could not be started.
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// Writing to the worker's stdin failed.
    #[error("Worker I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The process is running but never reported readiness.
    #[error("Worker did not become ready within {0:?}")]
    StartupTimeout(Duration),

    /// The process ended. `code` is `None` when it was killed or the pipe closed.
    #[error("Worker exited (code {code:?})")]
    Exited {
        /// Exit status, if the process reported one.
        code: Option<i32>,
    },

    /// A command got no reply in time. The worker stays usable.
    #[error("Worker did not answer {command} within {after:?}")]
    Timeout {
        /// Name of the unanswered command.
        command: String,
        /// Timeout that expired.
        after: Duration,
    },

    /// The worker answered with `ERROR:<msg>` or reported `success: false`.
    #[error("Worker reported: {0}")]
    Command(String),

    /// The worker answered with something the command cannot use.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A command or reply could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The worker exited or was killed while a command was pending.
    #[error("Worker connection closed")]
    Closed,
}

/// How to launch workers and how long to wait on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Executable to run.
    pub program: String,
    /// Arguments placed before `--camera-id <id>`.
    pub args: Vec<String>,
    /// How long to wait for the first `STATUS:` line.
    pub startup_timeout: Duration,
    /// How long to wait for each command's reply.
    pub command_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["python/main.py".to_string(), "--ipc".to_string()],
            startup_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
        }
    }
}

/// Unsolicited notifications from one worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// `STATUS:` text that answered no command.
    Status(String),
    /// `WARNING:` text.
    Warning(String),
    /// `ERROR:` text. Also fails the pending command, if any.
    Error(String),
    /// Preview frame nobody asked for.
    Preview(String),
    /// One frame written to disk.
    FrameSaved(FrameInfo),
    /// The worker is gone. Sent once.
    Exited {
        /// Exit status, if the process reported one.
        code: Option<i32>,
    },
}
