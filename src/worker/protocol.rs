//! Worker wire types.

use super::WorkerError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Host -> worker command, serialized as one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Liveness check.
    Ping,
    /// Ask for the worker's version string.
    Version,
    /// List cameras visible to the worker.
    DetectCameras,
    /// Bind the worker to one camera.
    Init {
        /// Camera this worker serves.
        camera_id: String,
        /// Address to use instead of discovery.
        #[serde(skip_serializing_if = "Option::is_none")]
        camera_ip: Option<String>,
    },
    /// Open the camera.
    Connect {
        /// Overrides the address given to `init`.
        #[serde(skip_serializing_if = "Option::is_none")]
        camera_ip: Option<String>,
    },
    /// Close the camera.
    Disconnect,
    /// Apply capture settings.
    Configure {
        /// Settings forwarded as-is.
        settings: CaptureSettings,
    },
    /// Grab one frame as a data URI.
    GetPreview {
        /// Image format, e.g. `jpeg`.
        format: String,
        /// Encoder quality, 1-100.
        quality: u8,
    },
    /// Start saving triggered frames.
    StartCapture {
        /// Folder the frames are written into.
        output_dir: PathBuf,
    },
    /// Stop saving and report the frame count.
    StopCapture,
    /// Report worker and camera state.
    Status,
}

impl WorkerCommand {
    /// Wire name, used in logs and timeout errors.
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::Ping => "ping",
            WorkerCommand::Version => "version",
            WorkerCommand::DetectCameras => "detect_cameras",
            WorkerCommand::Init { .. } => "init",
            WorkerCommand::Connect { .. } => "connect",
            WorkerCommand::Disconnect => "disconnect",
            WorkerCommand::Configure { .. } => "configure",
            WorkerCommand::GetPreview { .. } => "get_preview",
            WorkerCommand::StartCapture { .. } => "start_capture",
            WorkerCommand::StopCapture => "stop_capture",
            WorkerCommand::Status => "status",
        }
    }

    /// JSON encoding terminated by `\n`.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Whether the camera free-runs or waits for trigger pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Frames are triggered by the worker itself.
    Software,
    /// Frames are triggered by the trigger device.
    #[default]
    Hardware,
}

/// Camera settings forwarded verbatim to every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Microseconds.
    pub exposure_time: f64,
    /// Sensor gain in camera units.
    pub gain: i64,
    /// Gamma correction, 1.0 disables it.
    pub gamma: f64,
    /// Hardware for synchronized recording.
    pub trigger_mode: TriggerMode,
    /// Camera input wired to the trigger device, e.g. `Line1`.
    pub trigger_source: String,
    /// Edge the camera reacts to, e.g. `RisingEdge`.
    pub trigger_activation: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            exposure_time: 8000.0,
            gain: 0,
            gamma: 1.0,
            trigger_mode: TriggerMode::Hardware,
            trigger_source: "Line1".to_string(),
            trigger_activation: "RisingEdge".to_string(),
        }
    }
}

/// Payload of a `FRAME_SAVED:` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    /// Camera that saved the frame.
    pub camera_id: String,
    /// 1-based index since capture start.
    pub frame_number: u64,
    /// Where the image was written.
    pub file_path: PathBuf,
    /// Unix time in seconds.
    pub timestamp: f64,
    /// Image width in pixels, 0 when not reported.
    #[serde(default)]
    pub width: u32,
    /// Image height in pixels, 0 when not reported.
    #[serde(default)]
    pub height: u32,
}

/// Reply to `init`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InitResponse {
    /// Whether the worker accepted the camera.
    pub success: bool,
    /// Camera the worker is now bound to.
    pub camera_id: String,
}

/// Reply to `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectResponse {
    /// Whether the command itself succeeded.
    pub success: bool,
    /// Whether the camera is open.
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct StartResponse {
    pub success: bool,
    #[serde(default)]
    pub capturing: bool,
}

/// Outcome of `stop_capture`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureResult {
    /// `false` when the worker could not finish the capture cleanly.
    pub success: bool,
    /// Frames the worker saved.
    #[serde(default)]
    pub frame_count: u64,
    /// Folder the frames went to.
    #[serde(default)]
    pub output_dir: Option<String>,
    /// Failure reason when `success` is `false`.
    #[serde(default)]
    pub error: Option<String>,
}

/// Reply to `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Whether the command itself succeeded.
    #[serde(default)]
    pub success: bool,
    /// `init` has run.
    pub initialized: bool,
    /// Camera bound by `init`.
    #[serde(default)]
    pub camera_id: Option<String>,
    /// The camera is open.
    pub connected: bool,
    /// Frames are being saved.
    pub capturing: bool,
    /// Frames saved in the current or last capture.
    #[serde(default)]
    pub frame_count: u64,
    /// Trigger mode as the camera reports it.
    #[serde(default)]
    pub trigger_mode: Option<String>,
}

/// One camera found by `detect_cameras`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedCamera {
    /// Address to pass to `init`/`connect`.
    pub ip_address: String,
    /// Vendor model string.
    pub model_name: String,
    /// Vendor serial number.
    pub serial_number: String,
    /// Empty when not reported.
    #[serde(default)]
    pub mac_address: String,
    /// Name stored on the camera, empty when unset.
    #[serde(default)]
    pub user_defined_name: String,
    /// Display name chosen by the worker.
    #[serde(default)]
    pub friendly_name: String,
    /// The worker is simulating this camera.
    #[serde(default)]
    pub is_mock: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DetectResponse {
    pub cameras: Vec<DetectedCamera>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct VersionResponse {
    pub version: String,
}

/// One decoded worker stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// `STATUS:<text>`
    Status(String),
    /// `WARNING:<text>`
    Warning(String),
    /// `ERROR:<text>`
    Error(String),
    /// `DATA:<json>`
    Data(serde_json::Value),
    /// `PREVIEW:<data uri>`
    Preview(String),
    /// `FRAME_SAVED:<json>`
    FrameSaved(FrameInfo),
}

impl WorkerMessage {
    /// Decode one line. Unknown prefixes and bad JSON are protocol errors.
    pub fn parse(line: &str) -> Result<Self, WorkerError> {
        let (tag, payload) = line
            .split_once(':')
            .ok_or_else(|| WorkerError::Protocol(format!("untagged line {line:?}")))?;

        match tag {
            "STATUS" => Ok(WorkerMessage::Status(payload.to_string())),
            "WARNING" => Ok(WorkerMessage::Warning(payload.to_string())),
            "ERROR" => Ok(WorkerMessage::Error(payload.to_string())),
            "PREVIEW" => Ok(WorkerMessage::Preview(payload.to_string())),
            "DATA" => Ok(WorkerMessage::Data(serde_json::from_str(payload)?)),
            "FRAME_SAVED" => Ok(WorkerMessage::FrameSaved(serde_json::from_str(payload)?)),
            other => Err(WorkerError::Protocol(format!("unknown tag {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_lines() {
        let line = WorkerCommand::Init {
            camera_id: "cam2".into(),
            camera_ip: Some("192.168.1.11".into()),
        }
        .to_line()
        .unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            value,
            json!({"command": "init", "camera_id": "cam2", "camera_ip": "192.168.1.11"})
        );

        let value = serde_json::to_value(WorkerCommand::StopCapture).unwrap();
        assert_eq!(value, json!({"command": "stop_capture"}));

        let value = serde_json::to_value(WorkerCommand::Connect { camera_ip: None }).unwrap();
        assert_eq!(value, json!({"command": "connect"}));
    }

    #[test]
    fn test_configure_carries_settings() {
        let value = serde_json::to_value(WorkerCommand::Configure {
            settings: CaptureSettings::default(),
        })
        .unwrap();
        assert_eq!(value["command"], "configure");
        assert_eq!(value["settings"]["exposure_time"], 8000.0);
        assert_eq!(value["settings"]["trigger_mode"], "hardware");
        assert_eq!(value["settings"]["trigger_source"], "Line1");
    }

    #[test]
    fn test_parse_frame_saved() {
        let msg = WorkerMessage::parse(
            r#"FRAME_SAVED:{"camera_id": "cam1", "frame_number": 3, "file_path": "/tmp/s/cam1/frame_000003.png", "timestamp": 1700000000.5, "width": 1920, "height": 1080}"#,
        )
        .unwrap();
        match msg {
            WorkerMessage::FrameSaved(info) => {
                assert_eq!(info.frame_number, 3);
                assert_eq!(info.width, 1920);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_keeps_payload_colons() {
        assert_eq!(
            WorkerMessage::parse("STATUS:Camera cam1 connected to 10.0.0.2:3956").unwrap(),
            WorkerMessage::Status("Camera cam1 connected to 10.0.0.2:3956".into())
        );
        assert_eq!(
            WorkerMessage::parse("PREVIEW:data:image/jpeg;base64,AAAA").unwrap(),
            WorkerMessage::Preview("data:image/jpeg;base64,AAAA".into())
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(WorkerMessage::parse("Traceback (most recent call last)").is_err());
        assert!(WorkerMessage::parse("DATA:{not json").is_err());
        assert!(WorkerMessage::parse("HELLO:world").is_err());
    }

    #[test]
    fn test_capture_result_tolerates_nulls() {
        let result: CaptureResult = serde_json::from_value(
            json!({"success": true, "frame_count": 120, "output_dir": "/tmp/s/cam1", "error": null}),
        )
        .unwrap();
        assert_eq!(result.frame_count, 120);
        assert_eq!(result.error, None);
    }
}
