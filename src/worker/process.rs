//! Driver for one capture worker process.

use super::protocol::{
    CaptureResult, CaptureSettings, ConnectResponse, DetectResponse, DetectedCamera,
    InitResponse, StartResponse, VersionResponse, WorkerCommand, WorkerMessage, WorkerStatus,
};
use super::{WorkerConfig, WorkerError, WorkerEvent};
use crate::line_buffer::LineBuffer;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;
/// Preview frames arrive as inline data URIs and can be large.
const MAX_WORKER_LINE: usize = 16 * 1024 * 1024;
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Data,
    Preview,
}

enum Reply {
    Data(Value),
    Preview(String),
}

struct Pending {
    awaiting: Awaiting,
    tx: oneshot::Sender<Result<Reply, WorkerError>>,
}

struct Shared {
    camera_id: String,
    pending: parking_lot::Mutex<Option<Pending>>,
    frame_count: AtomicU64,
    exited: AtomicBool,
    events: broadcast::Sender<WorkerEvent>,
}

impl Shared {
    fn dispatch(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let message = match WorkerMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(camera_id = %self.camera_id, error = %e, line, "Ignoring worker line");
                return;
            }
        };

        match message {
            WorkerMessage::Status(text) => {
                debug!(camera_id = %self.camera_id, status = %text, "Worker status");
                self.emit(WorkerEvent::Status(text));
            }
            WorkerMessage::Warning(text) => {
                warn!(camera_id = %self.camera_id, warning = %text, "Worker warning");
                self.emit(WorkerEvent::Warning(text));
            }
            WorkerMessage::Error(text) => {
                warn!(camera_id = %self.camera_id, error = %text, "Worker error");
                self.resolve(|_| true, Err(WorkerError::Command(text.clone())));
                self.emit(WorkerEvent::Error(text));
            }
            WorkerMessage::Data(value) => {
                if !self.resolve(|_| true, Ok(Reply::Data(value))) {
                    debug!(camera_id = %self.camera_id, "Dropping unsolicited DATA");
                }
            }
            WorkerMessage::Preview(data) => {
                let claimed = self.pending.lock().as_ref().map(|p| p.awaiting) == Some(Awaiting::Preview);
                if claimed {
                    self.resolve(|a| a == Awaiting::Preview, Ok(Reply::Preview(data)));
                } else {
                    self.emit(WorkerEvent::Preview(data));
                }
            }
            WorkerMessage::FrameSaved(info) => {
                self.frame_count.fetch_add(1, Ordering::SeqCst);
                self.emit(WorkerEvent::FrameSaved(info));
            }
        }
    }

    /// Complete the pending command if `accepts` its kind. Returns whether one was resolved.
    fn resolve(
        &self,
        accepts: impl Fn(Awaiting) -> bool,
        result: Result<Reply, WorkerError>,
    ) -> bool {
        let mut slot = self.pending.lock();
        match slot.as_ref() {
            Some(p) if accepts(p.awaiting) => {}
            _ => return false,
        }
        if let Some(pending) = slot.take() {
            let _ = pending.tx.send(result);
            return true;
        }
        false
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    fn fail_pending(&self) {
        if let Some(pending) = self.pending.lock().take() {
            let _ = pending.tx.send(Err(WorkerError::Closed));
        }
    }

    fn mark_exited(&self, code: Option<i32>) {
        self.fail_pending();
        if !self.exited.swap(true, Ordering::SeqCst) {
            info!(camera_id = %self.camera_id, ?code, "Worker exited");
            self.emit(WorkerEvent::Exited { code });
        }
    }
}

async fn read_loop<R>(mut stdout: R, shared: Arc<Shared>, supervised: bool)
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineBuffer::new(MAX_WORKER_LINE);
    let mut buf = vec![0u8; 8192];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in framer.push(&buf[..n]) {
                    shared.dispatch(&line);
                }
            }
            Err(e) => {
                warn!(camera_id = %shared.camera_id, error = %e, "Worker stdout read failed");
                break;
            }
        }
    }
    if supervised {
        // The supervisor reports the exit code.
        shared.fail_pending();
    } else {
        shared.mark_exited(None);
    }
}

async fn supervise(mut child: Child, kill_rx: oneshot::Receiver<()>, shared: Arc<Shared>) {
    let code = tokio::select! {
        status = child.wait() => status.ok().and_then(|s| s.code()),
        // Fires on an explicit kill and when the handle is dropped.
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                warn!(camera_id = %shared.camera_id, error = %e, "Failed to kill worker");
            }
            None
        }
    };
    shared.mark_exited(code);
}

async fn forward_stderr<R>(stderr: R, camera_id: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(camera_id = %camera_id, "worker stderr: {}", line);
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to one running worker.
///
/// At most one command is in flight: the stdin lock is held from writing the
/// command until its reply, timeout or failure. Dropping the handle kills the
/// process.
pub struct CaptureWorker {
    camera_id: String,
    command_timeout: Duration,
    stdin: tokio::sync::Mutex<BoxedWriter>,
    shared: Arc<Shared>,
    kill_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CaptureWorker {
    /// Launch `program args... --camera-id <id>` and wait until it is ready.
    pub async fn spawn(camera_id: &str, config: &WorkerConfig) -> Result<Self, WorkerError> {
        info!(camera_id, program = %config.program, "Spawning capture worker");

        let mut child = Command::new(&config.program)
            .args(&config.args)
            .arg("--camera-id")
            .arg(camera_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Protocol("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Protocol("worker stdout not captured".into()))?;
        let stderr = child.stderr.take();

        let worker = Self::build(camera_id.to_string(), stdin, config);
        // Subscribed before the supervisor runs so an immediate exit is seen.
        let events = worker.subscribe();
        if let Some(stderr) = stderr {
            worker
                .tasks
                .lock()
                .push(tokio::spawn(forward_stderr(stderr, camera_id.to_string())));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *worker.kill_tx.lock() = Some(kill_tx);
        *worker.supervisor.lock() = Some(tokio::spawn(supervise(
            child,
            kill_rx,
            Arc::clone(&worker.shared),
        )));

        worker
            .start(events, stdout, true, config.startup_timeout)
            .await
    }

    /// Drive a worker over arbitrary streams, e.g. an in-memory pipe.
    ///
    /// End of `stdout` counts as the worker exiting.
    pub async fn from_io<R, W>(
        camera_id: impl Into<String>,
        stdout: R,
        stdin: W,
        config: &WorkerConfig,
    ) -> Result<Self, WorkerError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let worker = Self::build(camera_id.into(), stdin, config);
        let events = worker.subscribe();
        worker
            .start(events, stdout, false, config.startup_timeout)
            .await
    }

    fn build<W>(camera_id: String, stdin: W, config: &WorkerConfig) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                camera_id: camera_id.clone(),
                pending: parking_lot::Mutex::new(None),
                frame_count: AtomicU64::new(0),
                exited: AtomicBool::new(false),
                events,
            }),
            camera_id,
            command_timeout: config.command_timeout,
            stdin: tokio::sync::Mutex::new(Box::new(stdin)),
            kill_tx: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
            supervisor: parking_lot::Mutex::new(None),
        }
    }

    /// Start reading stdout and wait for the first `STATUS:` line.
    ///
    /// `events` must be subscribed before any task that can emit was spawned.
    async fn start<R>(
        self,
        mut events: broadcast::Receiver<WorkerEvent>,
        stdout: R,
        supervised: bool,
        startup: Duration,
    ) -> Result<Self, WorkerError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.tasks
            .lock()
            .push(tokio::spawn(read_loop(stdout, Arc::clone(&self.shared), supervised)));

        let ready = tokio::time::timeout(startup, async {
            loop {
                match events.recv().await {
                    Ok(WorkerEvent::Status(text)) => return Ok(text),
                    Ok(WorkerEvent::Exited { code }) => return Err(WorkerError::Exited { code }),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Err(WorkerError::Closed),
                }
            }
        })
        .await;

        match ready {
            Ok(Ok(text)) => {
                info!(camera_id = %self.camera_id, status = %text, "Capture worker ready");
                Ok(self)
            }
            Ok(Err(e)) => {
                self.kill().await;
                Err(e)
            }
            Err(_) => {
                warn!(camera_id = %self.camera_id, ?startup, "Capture worker never became ready");
                self.kill().await;
                Err(WorkerError::StartupTimeout(startup))
            }
        }
    }

    /// Camera this worker serves.
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// `false` once the process exited or was killed.
    pub fn is_alive(&self) -> bool {
        !self.shared.exited.load(Ordering::SeqCst)
    }

    /// Frames reported through `FRAME_SAVED` since the last capture start.
    pub fn frame_count(&self) -> u64 {
        self.shared.frame_count.load(Ordering::SeqCst)
    }

    /// Receive every subsequent [`WorkerEvent`].
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    /// Send a command and wait for its `DATA:` payload.
    pub async fn send_command(&self, command: &WorkerCommand) -> Result<Value, WorkerError> {
        match self.execute(command, Awaiting::Data).await? {
            Reply::Data(value) => Ok(value),
            Reply::Preview(_) => Err(WorkerError::Protocol(format!(
                "{} answered with a preview",
                command.name()
            ))),
        }
    }

    /// Round-trip a `ping`, returning the latency.
    pub async fn ping(&self) -> Result<Duration, WorkerError> {
        let started = Instant::now();
        self.send_command(&WorkerCommand::Ping).await?;
        Ok(started.elapsed())
    }

    /// Worker's version string.
    pub async fn version(&self) -> Result<String, WorkerError> {
        let response: VersionResponse = self.typed(&WorkerCommand::Version).await?;
        Ok(response.version)
    }

    /// Bind the worker to its camera, optionally at a fixed address.
    pub async fn init(&self, camera_ip: Option<&str>) -> Result<InitResponse, WorkerError> {
        let response: InitResponse = self
            .typed(&WorkerCommand::Init {
                camera_id: self.camera_id.clone(),
                camera_ip: camera_ip.map(str::to_string),
            })
            .await?;
        ensure(response.success, "init")?;
        Ok(response)
    }

    /// Open the camera. Fails unless the worker reports it connected.
    pub async fn connect(&self, camera_ip: Option<&str>) -> Result<ConnectResponse, WorkerError> {
        let response: ConnectResponse = self
            .typed(&WorkerCommand::Connect {
                camera_ip: camera_ip.map(str::to_string),
            })
            .await?;
        ensure(response.success && response.connected, "connect")?;
        Ok(response)
    }

    /// Close the camera. The process keeps running.
    pub async fn disconnect(&self) -> Result<(), WorkerError> {
        self.send_command(&WorkerCommand::Disconnect).await?;
        Ok(())
    }

    /// Apply capture settings.
    pub async fn configure(&self, settings: &CaptureSettings) -> Result<(), WorkerError> {
        let value = self
            .send_command(&WorkerCommand::Configure {
                settings: settings.clone(),
            })
            .await?;
        ensure(success_flag(&value), "configure")
    }

    /// Begin saving frames into `output_dir`. Resets the frame counter first.
    pub async fn start_capture(&self, output_dir: &Path) -> Result<(), WorkerError> {
        self.shared.frame_count.store(0, Ordering::SeqCst);
        let response: StartResponse = self
            .typed(&WorkerCommand::StartCapture {
                output_dir: output_dir.to_path_buf(),
            })
            .await?;
        ensure(response.success && response.capturing, "start_capture")
    }

    /// Stop saving frames. A `success: false` result is returned, not raised.
    pub async fn stop_capture(&self) -> Result<CaptureResult, WorkerError> {
        self.typed(&WorkerCommand::StopCapture).await
    }

    /// Query worker and camera state.
    pub async fn status(&self) -> Result<WorkerStatus, WorkerError> {
        self.typed(&WorkerCommand::Status).await
    }

    /// Grab one frame as an inline data URI.
    pub async fn get_preview(&self, format: &str, quality: u8) -> Result<String, WorkerError> {
        let command = WorkerCommand::GetPreview {
            format: format.to_string(),
            quality,
        };
        match self.execute(&command, Awaiting::Preview).await? {
            Reply::Preview(data) => Ok(data),
            Reply::Data(_) => Err(WorkerError::Protocol(
                "get_preview answered with DATA".into(),
            )),
        }
    }

    /// Cameras the worker can see on the network.
    pub async fn detect_cameras(&self) -> Result<Vec<DetectedCamera>, WorkerError> {
        let response: DetectResponse = self.typed(&WorkerCommand::DetectCameras).await?;
        Ok(response.cameras)
    }

    /// Terminate the worker. Safe to call more than once.
    pub async fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if tokio::time::timeout(KILL_GRACE, handle).await.is_err() {
                warn!(camera_id = %self.camera_id, "Worker did not exit after kill");
            }
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.shared.mark_exited(None);
    }

    async fn typed<T: DeserializeOwned>(&self, command: &WorkerCommand) -> Result<T, WorkerError> {
        let value = self.send_command(command).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn execute(&self, command: &WorkerCommand, awaiting: Awaiting) -> Result<Reply, WorkerError> {
        let line = command.to_line()?;
        let mut stdin = self.stdin.lock().await;
        if !self.is_alive() {
            return Err(WorkerError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        *self.shared.pending.lock() = Some(Pending { awaiting, tx });

        debug!(camera_id = %self.camera_id, command = command.name(), "Sending worker command");
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            self.shared.pending.lock().take();
            return Err(WorkerError::Io(e));
        }

        let after = self.command_timeout;
        match tokio::time::timeout(after, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerError::Closed),
            Err(_) => {
                self.shared.pending.lock().take();
                Err(WorkerError::Timeout {
                    command: command.name().to_string(),
                    after,
                })
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
        // Dropping kill_tx makes the supervisor kill and reap the child.
    }
}

fn success_flag(value: &Value) -> bool {
    value.get("success").and_then(Value::as_bool).unwrap_or(true)
}

fn ensure(ok: bool, command: &str) -> Result<(), WorkerError> {
    if ok {
        Ok(())
    } else {
        Err(WorkerError::Command(format!("{command} failed")))
    }
}
