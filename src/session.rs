//! Recording session orchestration.
//!
//! A session drives the trigger link and the capture coordinator through one
//! recording:
//!
//! 1. check the device is idle, program fps and camera count, arm it
//! 2. configure and start every worker writing into `<output>/session_<id>/`
//! 3. start triggering
//! 4. on stop: stop triggering and read the device count, let the workers
//!    drain, stop the workers, compare counts and write `session.json`
//!
//! A count mismatch is not an error. The session still completes, keeps all
//! recorded frames and reports the mismatch in the metadata.

use crate::coordinator::{CaptureCoordinator, SyncVerdict};
use crate::error::{AppResult, SyncError};
use crate::trigger::link::TriggerLink;
use crate::trigger::protocol::TriggerState;
use crate::worker::CaptureSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Metadata file written into every session directory.
pub const METADATA_FILE: &str = "session.json";

/// Parameters for one recording.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Trigger rate programmed into the device.
    pub fps: u32,
    /// Parent of the per-session directory.
    pub output_root: PathBuf,
    /// Sent to every worker before capture starts.
    pub settings: CaptureSettings,
    /// Wait between stopping the trigger and stopping the workers.
    pub settle: Duration,
}

/// Outcome recorded in `session.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Every camera and the device agree on the frame count.
    #[serde(rename = "OK")]
    Ok,
    /// At least one count differs.
    #[serde(rename = "MISMATCH")]
    Mismatch,
}

/// Contents of `session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// `YYYYMMDD_HHMMSS` of the start time, UTC.
    pub session_id: String,
    /// When the session started.
    pub start_time: DateTime<Utc>,
    /// When the session stopped, `None` while recording.
    pub end_time: Option<DateTime<Utc>>,
    /// Trigger rate used.
    pub fps: u32,
    /// Final frame count per camera.
    pub camera_frame_counts: BTreeMap<String, u64>,
    /// Pulses the device reports having sent, when it could be read.
    pub trigger_frame_count: Option<u32>,
    /// Whether every count agreed.
    pub sync_status: SyncStatus,
    /// Sum of the camera counts.
    pub total_frames: u64,
    /// Settings the workers were configured with.
    pub settings: CaptureSettings,
}

impl SessionMetadata {
    /// Write `session.json` into `dir`, returning its path.
    pub async fn write(&self, dir: &Path) -> AppResult<PathBuf> {
        let path = dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    /// Load `session.json` from `dir`.
    pub async fn read(dir: &Path) -> AppResult<Self> {
        let json = tokio::fs::read_to_string(dir.join(METADATA_FILE)).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// What was written to `session.json`.
    pub metadata: SessionMetadata,
    /// Camera-to-camera comparison, ignoring the device count.
    pub verdict: SyncVerdict,
    /// Folder holding the per-camera frame folders.
    pub session_dir: PathBuf,
    /// Location of `session.json`.
    pub metadata_path: PathBuf,
}

impl SessionReport {
    /// All cameras agree with each other and with the device.
    pub fn is_synced(&self) -> bool {
        self.metadata.sync_status == SyncStatus::Ok
    }
}

/// A recording in progress.
pub struct RecordingSession<'a> {
    link: &'a TriggerLink,
    coordinator: &'a CaptureCoordinator,
    options: SessionOptions,
    session_id: String,
    session_dir: PathBuf,
    start_time: DateTime<Utc>,
}

impl<'a> RecordingSession<'a> {
    /// Arm the device, start every worker, then start triggering.
    ///
    /// Fails without triggering when the device is busy or no camera starts.
    /// If triggering cannot be started, the cameras are stopped and the device
    /// is disarmed before the error is returned.
    pub async fn start(
        link: &'a TriggerLink,
        coordinator: &'a CaptureCoordinator,
        options: SessionOptions,
    ) -> AppResult<RecordingSession<'a>> {
        if coordinator.is_empty() {
            return Err(SyncError::NoCameras);
        }

        let status = link.request_status().await?;
        if status.state != TriggerState::Idle {
            return Err(SyncError::DeviceBusy(status.state));
        }

        let start_time = Utc::now();
        let session_id = start_time.format("%Y%m%d_%H%M%S").to_string();
        let session_dir = options.output_root.join(format!("session_{session_id}"));
        tokio::fs::create_dir_all(&session_dir).await?;
        info!(session_id = %session_id, dir = %session_dir.display(), fps = options.fps, "Starting session");

        let cameras = u8::try_from(coordinator.len()).unwrap_or(u8::MAX);
        link.set_fps(options.fps).await?;
        link.set_camera_count(cameras).await?;
        link.arm().await?;

        for (camera_id, error) in coordinator.configure_all(&options.settings).await.failed() {
            warn!(camera_id, error = %error, "Camera configuration failed");
        }

        let started = coordinator.start_capture(&session_dir).await;
        if started.succeeded().next().is_none() {
            disarm_after_abort(link).await;
            return Err(SyncError::NoCameras);
        }

        if let Err(e) = link.start().await {
            warn!(error = %e, "Trigger start failed, stopping cameras");
            coordinator.stop_capture().await;
            disarm_after_abort(link).await;
            return Err(e.into());
        }

        Ok(Self {
            link,
            coordinator,
            options,
            session_id,
            session_dir,
            start_time,
        })
    }

    /// Identifier derived from the start time.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// `<output_root>/session_<id>`.
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Live verdict over the counts seen so far.
    pub fn progress(&self) -> SyncVerdict {
        self.coordinator.verify_sync_status()
    }

    /// Stop triggering, stop the workers and persist the metadata.
    pub async fn stop(self) -> AppResult<SessionReport> {
        let trigger_frames = match self.link.stop_and_count().await {
            Ok(n) => Some(n),
            Err(e) => {
                // Already stopped by the kill switch, or the reply was lost.
                let mirrored = self.link.status().map(|s| s.frame_count);
                warn!(error = %e, ?mirrored, "Stop not confirmed, using mirrored count");
                mirrored
            }
        };

        tokio::time::sleep(self.options.settle).await;

        let report = self.coordinator.stop_capture().await;
        let verdict = self.coordinator.verify_sync_status();

        let matches_device =
            trigger_frames.map_or(true, |n| verdict.max_frames == u64::from(n));
        let sync_status = if verdict.synced && matches_device {
            SyncStatus::Ok
        } else {
            SyncStatus::Mismatch
        };

        if sync_status == SyncStatus::Mismatch {
            warn!(
                counts = ?report.frame_counts,
                ?trigger_frames,
                "Frame counts do not match"
            );
        }

        let metadata = SessionMetadata {
            session_id: self.session_id,
            start_time: self.start_time,
            end_time: Some(Utc::now()),
            fps: self.options.fps,
            total_frames: report.frame_counts.values().sum(),
            camera_frame_counts: report.frame_counts,
            trigger_frame_count: trigger_frames,
            sync_status,
            settings: self.options.settings,
        };
        let metadata_path = metadata.write(&self.session_dir).await?;
        info!(
            session_id = %metadata.session_id,
            status = ?metadata.sync_status,
            total_frames = metadata.total_frames,
            "Session finished"
        );

        Ok(SessionReport {
            metadata,
            verdict,
            session_dir: self.session_dir,
            metadata_path,
        })
    }
}

async fn disarm_after_abort(link: &TriggerLink) {
    if let Err(e) = link.disarm().await {
        warn!(error = %e, "Failed to disarm after aborted start");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_serializes_as_label() {
        assert_eq!(serde_json::to_string(&SyncStatus::Ok).unwrap(), "\"OK\"");
        assert_eq!(
            serde_json::to_string(&SyncStatus::Mismatch).unwrap(),
            "\"MISMATCH\""
        );
    }

    #[tokio::test]
    async fn test_metadata_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = SessionMetadata {
            session_id: "20240101_120000".into(),
            start_time: Utc::now(),
            end_time: None,
            fps: 30,
            camera_frame_counts: [("cam1".to_string(), 90), ("cam2".to_string(), 90)]
                .into_iter()
                .collect(),
            trigger_frame_count: Some(90),
            sync_status: SyncStatus::Ok,
            total_frames: 180,
            settings: CaptureSettings::default(),
        };

        let path = metadata.write(dir.path()).await.unwrap();
        assert!(path.ends_with(METADATA_FILE));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["sync_status"], "OK");
        assert_eq!(raw["camera_frame_counts"]["cam2"], 90);

        assert_eq!(SessionMetadata::read(dir.path()).await.unwrap(), metadata);
    }
}
