//! Trigger device: firmware state machine, hardware seams and host link.

pub mod controller;
pub mod discovery;
pub mod hal;
pub mod link;
pub mod protocol;
pub mod sim;

pub use controller::{ControllerConfig, TriggerController};
pub use link::{LinkConfig, LinkError, LinkEvent, LinkState, TriggerLink};
pub use protocol::{Command, DeviceMessage, ProtocolError, TriggerState, TriggerStatus};
