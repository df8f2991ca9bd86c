//! CaptureCoordinator fan-out and sync verification over in-memory workers.
//!
//! Run with: cargo test --test coordinator

mod common;

use camsync::config::CameraConfig;
use camsync::coordinator::CaptureCoordinator;
use camsync::worker::{CaptureSettings, WorkerError};
use camsync::SyncError;
use common::{FakeLauncher, Script};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn cameras(ids: &[&str]) -> Vec<CameraConfig> {
    ids.iter().map(|id| CameraConfig::new(*id, None)).collect()
}

fn frames(n: u64) -> Script {
    Script {
        frames: n,
        ..Script::default()
    }
}

async fn coordinator(launcher: FakeLauncher, ids: &[&str]) -> CaptureCoordinator {
    let mut coordinator = CaptureCoordinator::new(Arc::new(launcher));
    let init = coordinator.initialize(&cameras(ids)).await;
    assert_eq!(init.len(), ids.len());
    coordinator
}

#[tokio::test]
async fn test_initialize_keeps_only_working_cameras() {
    let launcher = FakeLauncher::new().refuse("cam2");
    let mut coordinator = CaptureCoordinator::new(Arc::new(launcher));

    let mut configs = cameras(&["cam1", "cam2", "cam3"]);
    configs.push(CameraConfig {
        enabled: false,
        ..CameraConfig::new("cam4", Some("10.0.0.4"))
    });
    let init = coordinator.initialize(&configs).await;

    // Disabled cameras are not even attempted.
    assert_eq!(init.len(), 3);
    assert!(!init.all_ok());
    assert!(matches!(init.get("cam2"), Some(Err(WorkerError::Spawn(_)))));
    assert_eq!(init.get("cam1").unwrap().as_ref().unwrap().camera_id, "cam1");
    assert_eq!(coordinator.camera_ids(), vec!["cam1", "cam3"]);
}

#[tokio::test]
async fn test_broadcasts_reach_every_worker() {
    let coordinator = coordinator(FakeLauncher::new(), &["cam1", "cam2", "cam3"]).await;

    let connected = coordinator.connect_all().await;
    assert!(connected.all_ok());
    assert_eq!(connected.succeeded().count(), 3);

    assert!(coordinator
        .configure_all(&CaptureSettings::default())
        .await
        .all_ok());

    let status = coordinator.status_all().await;
    assert!(status.iter().all(|(_, s)| s.as_ref().unwrap().initialized));
}

#[tokio::test]
async fn test_one_failing_start_does_not_block_the_others() {
    let launcher = FakeLauncher::new()
        .script("cam1", frames(5))
        .script(
            "cam2",
            Script {
                fail_start: true,
                ..Script::default()
            },
        )
        .script("cam3", frames(5));
    let coordinator = coordinator(launcher, &["cam1", "cam2", "cam3"]).await;
    let root = tempfile::tempdir().unwrap();

    let started = coordinator.start_capture(root.path()).await;

    assert_eq!(started.succeeded().collect::<Vec<_>>(), vec!["cam1", "cam3"]);
    let failed: Vec<_> = started.failed().map(|(id, _)| id).collect();
    assert_eq!(failed, vec!["cam2"]);
    assert_eq!(
        started.get("cam1").unwrap().as_ref().unwrap(),
        &root.path().join("cam1")
    );
    assert!(root.path().join("cam3").is_dir());
}

#[tokio::test]
async fn test_equal_counts_are_synced() {
    let launcher = FakeLauncher::new()
        .script("cam1", frames(120))
        .script("cam2", frames(120))
        .script("cam3", frames(120));
    let coordinator = coordinator(launcher, &["cam1", "cam2", "cam3"]).await;
    let root = tempfile::tempdir().unwrap();

    assert!(coordinator.start_capture(root.path()).await.all_ok());
    let report = coordinator.stop_capture().await;

    assert!(report.results.all_ok());
    assert!(report.frame_counts.values().all(|&n| n == 120));

    let verdict = coordinator.verify_sync_status();
    assert!(verdict.synced);
    assert_eq!(verdict.min_frames, 120);
    assert_eq!(verdict.max_frames, 120);
    assert_eq!(verdict.status_label(), "OK");
}

#[tokio::test]
async fn test_one_dropped_frame_is_a_mismatch() {
    let launcher = FakeLauncher::new()
        .script("cam1", frames(120))
        .script("cam2", frames(119))
        .script("cam3", frames(120));
    let coordinator = coordinator(launcher, &["cam1", "cam2", "cam3"]).await;
    let root = tempfile::tempdir().unwrap();

    coordinator.start_capture(root.path()).await;
    coordinator.stop_capture().await;

    let verdict = coordinator.verify_sync_status();
    assert!(!verdict.synced);
    assert_eq!(verdict.min_frames, 119);
    assert_eq!(verdict.max_frames, 120);
    assert_eq!(verdict.per_camera_counts["cam2"], 119);
    assert_eq!(verdict.status_label(), "MISMATCH");
}

#[tokio::test]
async fn test_failed_stop_falls_back_to_running_count() {
    let launcher = FakeLauncher::new()
        .script("cam1", frames(30))
        .script(
            "cam2",
            Script {
                frames: 28,
                fail_stop: true,
                ..Script::default()
            },
        )
        .script(
            "cam3",
            Script {
                frames: 27,
                reported: Some(99),
                stop_unsuccessful: true,
                ..Script::default()
            },
        );
    let coordinator = coordinator(launcher, &["cam1", "cam2", "cam3"]).await;
    let root = tempfile::tempdir().unwrap();

    coordinator.start_capture(root.path()).await;
    let report = coordinator.stop_capture().await;

    assert!(report.results.get("cam2").unwrap().is_err());
    assert_eq!(report.frame_counts["cam1"], 30);
    assert_eq!(report.frame_counts["cam2"], 28);
    // An unsuccessful result's own count is not trusted.
    assert_eq!(report.frame_counts["cam3"], 27);
    assert!(!coordinator.verify_sync_status().synced);
}

#[tokio::test]
async fn test_preview_and_detection() {
    let coordinator = coordinator(FakeLauncher::new(), &["cam1"]).await;

    let preview = coordinator.get_preview("cam1", "jpeg", 75).await.unwrap();
    assert!(preview.starts_with("data:image/jpeg"));

    assert!(matches!(
        coordinator.get_preview("cam9", "jpeg", 75).await,
        Err(SyncError::UnknownCamera(id)) if id == "cam9"
    ));

    let detected = coordinator.detect_cameras().await.unwrap();
    assert_eq!(detected[0].ip_address, "192.168.1.10");
}

#[tokio::test]
async fn test_detection_without_workers_uses_a_temporary_one() {
    let coordinator = CaptureCoordinator::new(Arc::new(FakeLauncher::new()));
    let detected = coordinator.detect_cameras().await.unwrap();
    assert_eq!(detected.len(), 1);
    assert!(coordinator.is_empty());
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let mut coordinator = coordinator(FakeLauncher::new(), &["cam1", "cam2"]).await;
    assert_eq!(coordinator.len(), 2);

    coordinator.shutdown().await;
    coordinator.shutdown().await;

    assert!(coordinator.is_empty());
    assert!(coordinator.frame_counts().is_empty());
    assert!(coordinator.connect_all().await.is_empty());
}

#[tokio::test]
async fn test_reinitialize_replaces_workers() {
    let mut coordinator = coordinator(FakeLauncher::new(), &["cam1", "cam2"]).await;
    coordinator.initialize(&cameras(&["cam3"])).await;
    assert_eq!(coordinator.camera_ids(), vec!["cam3"]);
}

#[tokio::test]
async fn test_broadcast_runs_workers_in_parallel() {
    let slow = Script {
        reply_delay: Some(Duration::from_millis(200)),
        ..Script::default()
    };
    let launcher = ["cam1", "cam2", "cam3"]
        .iter()
        .fold(FakeLauncher::new(), |l, id| l.script(id, slow.clone()));
    let coordinator = coordinator(launcher, &["cam1", "cam2", "cam3"]).await;
    let root = tempfile::tempdir().unwrap();

    let began = Instant::now();
    let started = coordinator.start_capture(root.path()).await;
    let elapsed = began.elapsed();

    assert!(started.all_ok());
    assert!(elapsed >= Duration::from_millis(200));
    // One camera at a time would take at least 600 ms.
    assert!(elapsed < Duration::from_millis(450), "took {elapsed:?}");
}
