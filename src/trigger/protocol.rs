//! Trigger device line protocol.
//!
//! Commands flow host -> device, [`DeviceMessage`]s flow device -> host. Both
//! directions are ASCII, one item per `\n`-terminated line. The same types are
//! used by the device state machine to decode commands and format replies, and
//! by the host link to encode commands and decode replies, so the two ends
//! cannot drift apart.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lowest accepted trigger rate.
pub const MIN_FPS: u32 = 1;
/// Highest accepted trigger rate.
pub const MAX_FPS: u32 = 165;
/// Fewest trigger lines that can be active.
pub const MIN_CAMERAS: u8 = 1;
/// Number of trigger outputs on the board.
pub const MAX_CAMERAS: u8 = 4;

/// Rate the device boots with.
pub const DEFAULT_FPS: u32 = 30;
/// Active line count the device boots with.
pub const DEFAULT_CAMERAS: u8 = MAX_CAMERAS;

/// Frame interval for a rate, truncated to whole microseconds.
pub fn interval_micros(fps: u32) -> u32 {
    1_000_000 / fps.max(1)
}

/// Bit mask selecting the first `cameras` trigger lines.
pub fn camera_mask(cameras: u8) -> u8 {
    let n = cameras.min(MAX_CAMERAS);
    ((1u16 << n) - 1) as u8
}

/// Decoding failures on either side of the link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Rate outside `MIN_FPS..=MAX_FPS` or not a number.
    #[error("FPS must be 1-165")]
    FpsOutOfRange,

    /// Camera count outside `MIN_CAMERAS..=MAX_CAMERAS` or not a number.
    #[error("Cameras must be 1-4")]
    CamerasOutOfRange,

    /// Line matches no command. Carries the upper-cased line.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// State name in a `STATUS:` line is not recognized.
    #[error("Unknown state: {0}")]
    UnknownState(String),
}

/// Device operating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerState {
    /// Not armed, lines low.
    Idle,
    /// Waiting for `START` or the start button.
    Armed,
    /// Pulsing at the configured rate.
    Recording,
    /// Transient: the kill switch fired and the final count is pending.
    Stopping,
}

impl TriggerState {
    /// Wire name used in `STATUS:` lines.
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerState::Idle => "IDLE",
            TriggerState::Armed => "ARMED",
            TriggerState::Recording => "RECORDING",
            TriggerState::Stopping => "STOPPING",
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(TriggerState::Idle),
            "ARMED" => Ok(TriggerState::Armed),
            "RECORDING" => Ok(TriggerState::Recording),
            "STOPPING" => Ok(TriggerState::Stopping),
            other => Err(ProtocolError::UnknownState(other.to_string())),
        }
    }
}

/// Immutable snapshot of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerStatus {
    /// Current operating state.
    pub state: TriggerState,
    /// Pulses fired since recording last started.
    pub frame_count: u32,
    /// Configured trigger rate.
    pub fps: u32,
    /// Number of trigger lines pulsed.
    pub active_cameras: u8,
}

impl Default for TriggerStatus {
    fn default() -> Self {
        Self {
            state: TriggerState::Idle,
            frame_count: 0,
            fps: DEFAULT_FPS,
            active_cameras: DEFAULT_CAMERAS,
        }
    }
}

/// Host -> device instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `ARM`
    Arm,
    /// `DISARM`
    Disarm,
    /// `START`
    Start,
    /// `STOP`
    Stop,
    /// `TRIGGER`: one pulse regardless of state.
    Trigger,
    /// `FPS:<n>`
    SetFps(u32),
    /// `CAMERAS:<n>`
    SetCameras(u8),
    /// `STATUS`
    Status,
    /// `PING`
    Ping,
}

impl Command {
    /// Decode one command line.
    ///
    /// Surrounding whitespace is ignored and matching is case-insensitive.
    /// Range checks happen here so both ends reject the same values.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let upper = line.trim().to_ascii_uppercase();

        if let Some(value) = upper.strip_prefix("FPS:") {
            return match value.trim().parse::<u32>() {
                Ok(fps) if (MIN_FPS..=MAX_FPS).contains(&fps) => Ok(Command::SetFps(fps)),
                _ => Err(ProtocolError::FpsOutOfRange),
            };
        }
        if let Some(value) = upper.strip_prefix("CAMERAS:") {
            return match value.trim().parse::<u8>() {
                Ok(n) if (MIN_CAMERAS..=MAX_CAMERAS).contains(&n) => Ok(Command::SetCameras(n)),
                _ => Err(ProtocolError::CamerasOutOfRange),
            };
        }

        match upper.as_str() {
            "ARM" => Ok(Command::Arm),
            "DISARM" => Ok(Command::Disarm),
            "START" => Ok(Command::Start),
            "STOP" => Ok(Command::Stop),
            "TRIGGER" => Ok(Command::Trigger),
            "STATUS" => Ok(Command::Status),
            "PING" => Ok(Command::Ping),
            _ => Err(ProtocolError::UnknownCommand(upper)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Arm => f.write_str("ARM"),
            Command::Disarm => f.write_str("DISARM"),
            Command::Start => f.write_str("START"),
            Command::Stop => f.write_str("STOP"),
            Command::Trigger => f.write_str("TRIGGER"),
            Command::SetFps(fps) => write!(f, "FPS:{fps}"),
            Command::SetCameras(n) => write!(f, "CAMERAS:{n}"),
            Command::Status => f.write_str("STATUS"),
            Command::Ping => f.write_str("PING"),
        }
    }
}

/// Device -> host line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// `READY`, sent once after boot.
    Ready,
    /// `ARMED`
    Armed,
    /// `DISARMED`
    Disarmed,
    /// `RECORDING`
    Recording,
    /// `STOPPED:<n>` with the final pulse count.
    Stopped(u32),
    /// `KILLED`, the kill switch ended recording.
    Killed,
    /// `BUTTON:<name>`, a physical button was pressed.
    Button(String),
    /// `FRAME:<n>` progress report.
    Frame(u32),
    /// `FPS_SET:<n>`
    FpsSet(u32),
    /// `CAMERAS_SET:<n>`
    CamerasSet(u8),
    /// `STATUS:<state>:<frames>:<fps>:<cams>`
    Status(TriggerStatus),
    /// `ERROR:<msg>`
    Error(String),
    /// `PONG`
    Pong,
    /// `TRIGGERED:<n>` after a manual pulse.
    Triggered(u32),
}

impl DeviceMessage {
    /// Decode one device line, `None` when it matches no known message.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();

        // ERROR text may itself contain ':' so it is matched first.
        if let Some(msg) = line.strip_prefix("ERROR:") {
            return Some(DeviceMessage::Error(msg.to_string()));
        }

        match line {
            "READY" => return Some(DeviceMessage::Ready),
            "ARMED" => return Some(DeviceMessage::Armed),
            "DISARMED" => return Some(DeviceMessage::Disarmed),
            "RECORDING" => return Some(DeviceMessage::Recording),
            "KILLED" => return Some(DeviceMessage::Killed),
            "PONG" => return Some(DeviceMessage::Pong),
            _ => {}
        }

        let (tag, rest) = line.split_once(':')?;
        match tag {
            "STOPPED" => rest.parse().ok().map(DeviceMessage::Stopped),
            "FRAME" => rest.parse().ok().map(DeviceMessage::Frame),
            "TRIGGERED" => rest.parse().ok().map(DeviceMessage::Triggered),
            "FPS_SET" => rest.parse().ok().map(DeviceMessage::FpsSet),
            "CAMERAS_SET" => rest.parse().ok().map(DeviceMessage::CamerasSet),
            "BUTTON" if !rest.is_empty() => Some(DeviceMessage::Button(rest.to_string())),
            "STATUS" => parse_status(rest).map(DeviceMessage::Status),
            _ => None,
        }
    }
}

fn parse_status(rest: &str) -> Option<TriggerStatus> {
    let mut fields = rest.split(':');
    let state = fields.next()?.parse().ok()?;
    let frame_count = fields.next()?.parse().ok()?;
    let fps = fields.next()?.parse().ok()?;
    let active_cameras = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(TriggerStatus {
        state,
        frame_count,
        fps,
        active_cameras,
    })
}

impl fmt::Display for DeviceMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMessage::Ready => f.write_str("READY"),
            DeviceMessage::Armed => f.write_str("ARMED"),
            DeviceMessage::Disarmed => f.write_str("DISARMED"),
            DeviceMessage::Recording => f.write_str("RECORDING"),
            DeviceMessage::Stopped(n) => write!(f, "STOPPED:{n}"),
            DeviceMessage::Killed => f.write_str("KILLED"),
            DeviceMessage::Button(name) => write!(f, "BUTTON:{name}"),
            DeviceMessage::Frame(n) => write!(f, "FRAME:{n}"),
            DeviceMessage::FpsSet(n) => write!(f, "FPS_SET:{n}"),
            DeviceMessage::CamerasSet(n) => write!(f, "CAMERAS_SET:{n}"),
            DeviceMessage::Status(s) => write!(
                f,
                "STATUS:{}:{}:{}:{}",
                s.state, s.frame_count, s.fps, s.active_cameras
            ),
            DeviceMessage::Error(msg) => write!(f, "ERROR:{msg}"),
            DeviceMessage::Pong => f.write_str("PONG"),
            DeviceMessage::Triggered(n) => write!(f, "TRIGGERED:{n}"),
        }
    }
}
