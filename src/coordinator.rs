//! Multi-camera coordination.
//!
//! [`CaptureCoordinator`] owns one [`CaptureWorker`] per enabled camera and
//! broadcasts operations to all of them at once. Broadcasts always wait for
//! every worker and never stop at the first failure: each camera gets its own
//! slot in the returned [`FanOutResult`].
//!
//! Frame counts are tracked per camera from `FRAME_SAVED` notifications by
//! forwarding tasks that the coordinator owns. They reset when a capture
//! starts and are replaced by the workers' final counts when it stops.

use crate::config::CameraConfig;
use crate::error::{AppResult, SyncError};
use crate::worker::{
    CaptureResult, CaptureSettings, CaptureWorker, ConnectResponse, DetectedCamera, InitResponse,
    WorkerConfig, WorkerError, WorkerEvent, WorkerStatus,
};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Creates workers. The seam lets tests substitute in-memory workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker for `camera_id` and wait until it is ready.
    async fn launch(&self, camera_id: &str) -> Result<CaptureWorker, WorkerError>;
}

/// Launches real worker processes.
pub struct ProcessLauncher {
    config: WorkerConfig,
}

impl ProcessLauncher {
    /// Launcher spawning `config.program` for each camera.
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, camera_id: &str) -> Result<CaptureWorker, WorkerError> {
        CaptureWorker::spawn(camera_id, &self.config).await
    }
}

/// Per-camera outcomes of one broadcast.
#[derive(Debug)]
pub struct FanOutResult<T> {
    outcomes: BTreeMap<String, Result<T, WorkerError>>,
}

impl<T> FanOutResult<T> {
    /// Outcome for one camera, `None` if it was not part of the broadcast.
    pub fn get(&self, camera_id: &str) -> Option<&Result<T, WorkerError>> {
        self.outcomes.get(camera_id)
    }

    /// Every outcome, ordered by camera id.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Result<T, WorkerError>)> {
        self.outcomes.iter().map(|(id, r)| (id.as_str(), r))
    }

    /// Number of cameras addressed.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// No camera was addressed.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Every camera succeeded. `true` for an empty broadcast.
    pub fn all_ok(&self) -> bool {
        self.outcomes.values().all(Result::is_ok)
    }

    /// Cameras that succeeded.
    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(id, _)| id.as_str())
    }

    /// Cameras that failed, with their errors.
    pub fn failed(&self) -> impl Iterator<Item = (&str, &WorkerError)> {
        self.outcomes
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (id.as_str(), e)))
    }

    /// Outcomes keyed by camera id.
    pub fn into_inner(self) -> BTreeMap<String, Result<T, WorkerError>> {
        self.outcomes
    }
}

impl<T> FromIterator<(String, Result<T, WorkerError>)> for FanOutResult<T> {
    fn from_iter<I: IntoIterator<Item = (String, Result<T, WorkerError>)>>(iter: I) -> Self {
        Self {
            outcomes: iter.into_iter().collect(),
        }
    }
}

/// Whether every camera recorded the same number of frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncVerdict {
    /// All cameras recorded the same number of frames.
    pub synced: bool,
    /// Count per camera id.
    pub per_camera_counts: BTreeMap<String, u64>,
    /// Lowest count, 0 without cameras.
    pub min_frames: u64,
    /// Highest count, 0 without cameras.
    pub max_frames: u64,
}

impl SyncVerdict {
    /// Verdict over a set of per-camera counts.
    pub fn from_counts(counts: &BTreeMap<String, u64>) -> Self {
        let min_frames = counts.values().copied().min().unwrap_or(0);
        let max_frames = counts.values().copied().max().unwrap_or(0);
        Self {
            synced: min_frames == max_frames,
            per_camera_counts: counts.clone(),
            min_frames,
            max_frames,
        }
    }

    /// `OK` or `MISMATCH`.
    pub fn status_label(&self) -> &'static str {
        if self.synced {
            "OK"
        } else {
            "MISMATCH"
        }
    }
}

/// Worker notification tagged with its camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraEvent {
    /// Camera the event came from.
    pub camera_id: String,
    /// The worker's event.
    pub event: WorkerEvent,
}

/// Result of [`CaptureCoordinator::stop_capture`].
#[derive(Debug)]
pub struct StopReport {
    /// Final count per camera, reported or fallen back.
    pub frame_counts: BTreeMap<String, u64>,
    /// Raw `stop_capture` outcomes.
    pub results: FanOutResult<CaptureResult>,
}

#[derive(Debug, Default)]
struct FrameCounts {
    counts: BTreeMap<String, u64>,
    /// Notifications only count between capture start and stop.
    live: bool,
}

/// Session output folder for one camera.
pub fn camera_output_dir(session_root: &Path, camera_id: &str) -> PathBuf {
    session_root.join(camera_id)
}

/// Owns every capture worker.
pub struct CaptureCoordinator {
    launcher: Arc<dyn WorkerLauncher>,
    workers: BTreeMap<String, Arc<CaptureWorker>>,
    cameras: BTreeMap<String, CameraConfig>,
    counts: Arc<parking_lot::Mutex<FrameCounts>>,
    events: broadcast::Sender<CameraEvent>,
    forwarders: Vec<JoinHandle<()>>,
}

impl CaptureCoordinator {
    /// Empty coordinator. Workers are created by [`Self::initialize`].
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            launcher,
            workers: BTreeMap::new(),
            cameras: BTreeMap::new(),
            counts: Arc::new(parking_lot::Mutex::new(FrameCounts::default())),
            events,
            forwarders: Vec::new(),
        }
    }

    /// Coordinator that spawns real worker processes.
    pub fn with_process_workers(config: WorkerConfig) -> Self {
        Self::new(Arc::new(ProcessLauncher::new(config)))
    }

    /// Replace the worker set: one worker per enabled camera, each sent `init`.
    ///
    /// Cameras that fail to launch or initialize are reported and not kept.
    pub async fn initialize(&mut self, configs: &[CameraConfig]) -> FanOutResult<InitResponse> {
        self.shutdown().await;

        let launches = configs.iter().filter(|c| c.enabled).map(|config| {
            let launcher = Arc::clone(&self.launcher);
            async move {
                let outcome = async {
                    let worker = launcher.launch(&config.id).await?;
                    match worker.init(config.ip.as_deref()).await {
                        Ok(response) => Ok::<_, WorkerError>((worker, response)),
                        Err(e) => {
                            worker.kill().await;
                            Err(e)
                        }
                    }
                }
                .await;
                (config, outcome)
            }
        });
        let launched = join_all(launches).await;

        let mut outcomes = BTreeMap::new();
        for (config, outcome) in launched {
            match outcome {
                Ok((worker, response)) => {
                    info!(camera_id = %config.id, "Camera initialized");
                    self.attach(config.clone(), worker);
                    outcomes.insert(config.id.clone(), Ok(response));
                }
                Err(e) => {
                    warn!(camera_id = %config.id, error = %e, "Camera failed to initialize");
                    outcomes.insert(config.id.clone(), Err(e));
                }
            }
        }
        FanOutResult { outcomes }
    }

    fn attach(&mut self, config: CameraConfig, worker: CaptureWorker) {
        let camera_id = config.id.clone();
        let worker = Arc::new(worker);
        let rx = worker.subscribe();

        self.forwarders.push(tokio::spawn(forward_events(
            camera_id.clone(),
            Arc::downgrade(&worker),
            rx,
            Arc::clone(&self.counts),
            self.events.clone(),
        )));
        self.counts.lock().counts.insert(camera_id.clone(), 0);
        self.cameras.insert(camera_id.clone(), config);
        self.workers.insert(camera_id, worker);
    }

    /// Run `op` against every worker concurrently and collect all outcomes.
    async fn broadcast<T, F, Fut>(&self, op: F) -> FanOutResult<T>
    where
        F: Fn(Arc<CaptureWorker>) -> Fut,
        Fut: Future<Output = Result<T, WorkerError>>,
    {
        let calls = self.workers.iter().map(|(id, worker)| {
            let call = op(Arc::clone(worker));
            let id = id.clone();
            async move { (id, call.await) }
        });
        join_all(calls).await.into_iter().collect()
    }

    /// Connect every camera, each to its configured address.
    pub async fn connect_all(&self) -> FanOutResult<ConnectResponse> {
        self.broadcast(|worker| {
            let ip = self
                .cameras
                .get(worker.camera_id())
                .and_then(|c| c.ip.clone());
            async move { worker.connect(ip.as_deref()).await }
        })
        .await
    }

    /// Close every camera. Workers keep running.
    pub async fn disconnect_all(&self) -> FanOutResult<()> {
        self.broadcast(|worker| async move { worker.disconnect().await })
            .await
    }

    /// Send the same settings to every worker.
    pub async fn configure_all(&self, settings: &CaptureSettings) -> FanOutResult<()> {
        self.broadcast(|worker| {
            let settings = settings.clone();
            async move { worker.configure(&settings).await }
        })
        .await
    }

    /// Query every worker's state.
    pub async fn status_all(&self) -> FanOutResult<WorkerStatus> {
        self.broadcast(|worker| async move { worker.status().await })
            .await
    }

    /// Reset counts, then start every worker writing to `session_root/<camera_id>`.
    ///
    /// Returns each started camera's output directory.
    pub async fn start_capture(&self, session_root: &Path) -> FanOutResult<PathBuf> {
        {
            let mut counts = self.counts.lock();
            counts.counts.values_mut().for_each(|n| *n = 0);
            counts.live = true;
        }

        let result = self
            .broadcast(|worker| {
                let dir = camera_output_dir(session_root, worker.camera_id());
                async move {
                    tokio::fs::create_dir_all(&dir).await?;
                    worker.start_capture(&dir).await?;
                    Ok::<_, WorkerError>(dir)
                }
            })
            .await;

        for (camera_id, error) in result.failed() {
            warn!(camera_id, error = %error, "Capture did not start");
        }
        result
    }

    /// Stop every worker and settle the final per-camera counts.
    ///
    /// A camera whose stop fails, or reports `success: false`, keeps its last
    /// running count so a missing result shows up as a mismatch.
    pub async fn stop_capture(&self) -> StopReport {
        self.counts.lock().live = false;

        let results = self
            .broadcast(|worker| async move { worker.stop_capture().await })
            .await;

        let mut frame_counts = BTreeMap::new();
        {
            let mut counts = self.counts.lock();
            for (camera_id, outcome) in results.iter() {
                // The worker's own counter is never behind the forwarded one.
                let running = self
                    .workers
                    .get(camera_id)
                    .map(|w| w.frame_count())
                    .unwrap_or_else(|| counts.counts.get(camera_id).copied().unwrap_or(0));
                let frames = match outcome {
                    Ok(result) if result.success => result.frame_count,
                    Ok(result) => {
                        warn!(camera_id, error = ?result.error, running, "Stop reported failure, using running count");
                        running
                    }
                    Err(e) => {
                        warn!(camera_id, error = %e, running, "Stop failed, using running count");
                        running
                    }
                };
                counts.counts.insert(camera_id.to_string(), frames);
                frame_counts.insert(camera_id.to_string(), frames);
            }
        }

        StopReport {
            frame_counts,
            results,
        }
    }

    /// Sync verdict over the current counts. Safe to call mid-recording.
    pub fn verify_sync_status(&self) -> SyncVerdict {
        SyncVerdict::from_counts(&self.counts.lock().counts)
    }

    /// Current per-camera counts.
    pub fn frame_counts(&self) -> BTreeMap<String, u64> {
        self.counts.lock().counts.clone()
    }

    /// Cameras with a running worker, sorted.
    pub fn camera_ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// Number of running workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// No worker is running.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Receive every worker event, tagged with its camera.
    pub fn subscribe(&self) -> broadcast::Receiver<CameraEvent> {
        self.events.subscribe()
    }

    /// Grab a preview frame from one camera.
    pub async fn get_preview(&self, camera_id: &str, format: &str, quality: u8) -> AppResult<String> {
        let worker = self
            .workers
            .get(camera_id)
            .ok_or_else(|| SyncError::UnknownCamera(camera_id.to_string()))?;
        Ok(worker.get_preview(format, quality).await?)
    }

    /// List detectable cameras, using a throwaway worker when none is running.
    pub async fn detect_cameras(&self) -> AppResult<Vec<DetectedCamera>> {
        if let Some(worker) = self.workers.values().next() {
            return Ok(worker.detect_cameras().await?);
        }
        let worker = self.launcher.launch("detect").await?;
        let result = worker.detect_cameras().await;
        worker.kill().await;
        Ok(result?)
    }

    /// Kill every worker and forget all cameras. Idempotent.
    pub async fn shutdown(&mut self) {
        let workers = std::mem::take(&mut self.workers);
        if !workers.is_empty() {
            info!(count = workers.len(), "Shutting down capture workers");
        }
        join_all(workers.values().map(|w| w.kill())).await;

        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
        self.cameras.clear();
        *self.counts.lock() = FrameCounts::default();
    }
}

impl Drop for CaptureCoordinator {
    fn drop(&mut self) {
        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
    }
}

async fn forward_events(
    camera_id: String,
    worker: Weak<CaptureWorker>,
    mut rx: broadcast::Receiver<WorkerEvent>,
    counts: Arc<parking_lot::Mutex<FrameCounts>>,
    events: broadcast::Sender<CameraEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let WorkerEvent::FrameSaved(_) = &event {
                    let mut counts = counts.lock();
                    if counts.live {
                        *counts.counts.entry(camera_id.clone()).or_insert(0) += 1;
                    }
                }
                let exited = matches!(event, WorkerEvent::Exited { .. });
                let _ = events.send(CameraEvent {
                    camera_id: camera_id.clone(),
                    event,
                });
                if exited {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(camera_id = %camera_id, missed, "Worker events lagged, resyncing count");
                if let Some(worker) = worker.upgrade() {
                    let mut counts = counts.lock();
                    if counts.live {
                        counts.counts.insert(camera_id.clone(), worker.frame_count());
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!(camera_id = %camera_id, "Event forwarder finished");
}
