//! Core library for camsync.
//!
//! camsync hardware-synchronizes image capture across 2-4 cameras. A
//! microcontroller emits simultaneous trigger pulses on every active camera
//! line, while one capture worker process per camera saves the frames those
//! pulses produce. This crate contains:
//!
//! - [`trigger::controller`]: the trigger device state machine, written
//!   against small hardware traits so it runs on the board and on the host.
//! - [`trigger::link`]: the host-side serial driver for the device protocol.
//! - [`worker`]: the driver for one long-lived capture worker process.
//! - [`coordinator`]: concurrent fan-out over all workers and the sync verdict.
//! - [`session`]: the recording orchestrator and persisted session metadata.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod line_buffer;
pub mod session;
pub mod trigger;
pub mod worker;

pub use coordinator::{CaptureCoordinator, FanOutResult, SyncVerdict};
pub use error::{AppResult, SyncError};
pub use trigger::link::TriggerLink;
pub use trigger::{TriggerState, TriggerStatus};
pub use worker::CaptureWorker;
