//! Host-side driver for the trigger device.
//!
//! [`TriggerLink`] owns the serial transport. A background reader task frames
//! incoming bytes into lines, decodes each line into a [`DeviceMessage`],
//! updates the mirrored [`TriggerStatus`] and publishes one [`LinkEvent`] per
//! message on a broadcast channel.
//!
//! Two calling conventions are offered:
//!
//! - fire-and-forget (`arm`, `start`, `set_fps`, ...): the command is written
//!   and the call returns; the outcome arrives later as an event.
//! - request/response (`ping`, `request_status`, `stop_and_count`): the call
//!   waits for the matching reply or the command timeout. The protocol has no
//!   request ids, so only one such call is in flight at a time.

use super::discovery;
use super::protocol::{
    Command, DeviceMessage, TriggerState, TriggerStatus, MAX_CAMERAS, MAX_FPS, MIN_CAMERAS,
    MIN_FPS,
};
use crate::line_buffer::LineBuffer;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

/// Interval between `PING` probes while waiting for the device to answer.
const HANDSHAKE_PROBE: Duration = Duration::from_millis(500);
const EVENT_CAPACITY: usize = 256;
const MAX_DEVICE_LINE: usize = 256;

/// Errors raised by the trigger link.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Auto-detection found no candidate port.
    #[error("No trigger device found")]
    NoDevice,

    /// The serial port could not be opened or enumerated.
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Writing to the transport failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport is closed or was never opened.
    #[error("Trigger device not connected")]
    NotConnected,

    /// Neither `READY` nor `PONG` arrived in time.
    #[error("Device did not complete the handshake within {0:?}")]
    HandshakeTimeout(Duration),

    /// A request got no matching reply in time.
    #[error("No response to {command} within {after:?}")]
    Timeout {
        /// Command that went unanswered.
        command: String,
        /// Timeout that expired.
        after: Duration,
    },

    /// The device answered with `ERROR:<msg>`.
    #[error("Device error: {0}")]
    Device(String),

    /// Rejected locally, nothing was sent.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The link closed while a request was pending.
    #[error("Link closed")]
    Closed,
}

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Port path, `None` to auto-detect.
    pub port: Option<String>,
    /// Line rate, 8N1 without flow control.
    pub baud_rate: u32,
    /// Upper bound for the `READY`/`PONG` handshake.
    pub handshake_timeout: Duration,
    /// Upper bound for each request/response call.
    pub command_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            handshake_timeout: Duration::from_secs(3),
            command_timeout: Duration::from_secs(1),
        }
    }
}

/// Notifications published by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Handshake completed.
    Connected {
        /// Port the device answered on.
        port: String,
    },
    /// The transport closed. Published once per connection.
    Disconnected,
    /// One decoded device line.
    Message(DeviceMessage),
}

/// Host view of the device, including the pseudo-state for "no transport".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No open transport.
    Disconnected,
    /// Last state reported by the device.
    Device(TriggerState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Pong,
    Status,
    Stopped,
}

impl Expect {
    fn matches(self, message: &DeviceMessage) -> bool {
        matches!(
            (self, message),
            (Expect::Pong, DeviceMessage::Pong)
                | (Expect::Status, DeviceMessage::Status(_))
                | (Expect::Stopped, DeviceMessage::Stopped(_))
        )
    }
}

struct Pending {
    expect: Expect,
    tx: oneshot::Sender<Result<DeviceMessage, LinkError>>,
}

#[derive(Debug, Clone, Copy)]
struct Mirror {
    connected: bool,
    status: TriggerStatus,
}

/// State shared between the link handle and its reader task.
struct Shared {
    mirror: parking_lot::Mutex<Mirror>,
    pending: parking_lot::Mutex<Option<Pending>>,
    events: broadcast::Sender<LinkEvent>,
}

impl Shared {
    fn dispatch(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let Some(message) = DeviceMessage::parse(line) else {
            warn!(line, "Ignoring unrecognized device line");
            return;
        };
        debug!(%message, "Device message");

        apply(&mut self.mirror.lock().status, &message);
        self.resolve_pending(&message);
        // No subscribers is not an error.
        let _ = self.events.send(LinkEvent::Message(message));
    }

    fn resolve_pending(&self, message: &DeviceMessage) {
        let mut slot = self.pending.lock();
        let resolves = match (slot.as_ref(), message) {
            (Some(_), DeviceMessage::Error(_)) => true,
            (Some(p), m) => p.expect.matches(m),
            (None, _) => false,
        };
        if !resolves {
            return;
        }
        if let Some(pending) = slot.take() {
            let result = match message {
                DeviceMessage::Error(msg) => Err(LinkError::Device(msg.clone())),
                other => Ok(other.clone()),
            };
            let _ = pending.tx.send(result);
        }
    }

    fn mark_connected(&self) {
        *self.mirror.lock() = Mirror {
            connected: true,
            status: TriggerStatus::default(),
        };
    }

    fn mark_disconnected(&self) {
        let was_connected = std::mem::replace(&mut self.mirror.lock().connected, false);
        if let Some(pending) = self.pending.lock().take() {
            let _ = pending.tx.send(Err(LinkError::Closed));
        }
        if was_connected {
            let _ = self.events.send(LinkEvent::Disconnected);
        }
    }
}

/// Update the mirrored status from one device message.
fn apply(status: &mut TriggerStatus, message: &DeviceMessage) {
    match message {
        DeviceMessage::Ready => *status = TriggerStatus::default(),
        DeviceMessage::Armed => status.state = TriggerState::Armed,
        DeviceMessage::Disarmed => status.state = TriggerState::Idle,
        DeviceMessage::Recording => {
            status.state = TriggerState::Recording;
            status.frame_count = 0;
        }
        DeviceMessage::Stopped(n) => {
            status.state = TriggerState::Idle;
            status.frame_count = *n;
        }
        DeviceMessage::Killed => status.state = TriggerState::Stopping,
        DeviceMessage::Frame(n) | DeviceMessage::Triggered(n) => status.frame_count = *n,
        DeviceMessage::FpsSet(fps) => status.fps = *fps,
        DeviceMessage::CamerasSet(n) => status.active_cameras = *n,
        DeviceMessage::Status(snapshot) => *status = *snapshot,
        DeviceMessage::Button(_) | DeviceMessage::Error(_) | DeviceMessage::Pong => {}
    }
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineBuffer::new(MAX_DEVICE_LINE);
    let mut buf = [0u8; 256];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("Trigger device closed the connection");
                break;
            }
            Ok(n) => {
                for line in framer.push(&buf[..n]) {
                    shared.dispatch(&line);
                }
            }
            Err(e) => {
                warn!(error = %e, "Trigger link read failed");
                break;
            }
        }
    }
    shared.mark_disconnected();
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Driver for one trigger device connection.
pub struct TriggerLink {
    port_name: String,
    config: LinkConfig,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    request_lock: tokio::sync::Mutex<()>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

enum Hello {
    Ready,
    Pong,
}

impl TriggerLink {
    /// Open the configured (or auto-detected) serial port and handshake.
    pub async fn connect(config: LinkConfig) -> Result<Self, LinkError> {
        let port_name = match &config.port {
            Some(port) => port.clone(),
            None => discovery::find_device()?.ok_or(LinkError::NoDevice)?,
        };
        info!(port = %port_name, baud = config.baud_rate, "Opening trigger device");

        let stream = tokio_serial::new(&port_name, config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;

        let (reader, writer) = tokio::io::split(stream);
        Self::from_transport(reader, writer, port_name, config).await
    }

    /// Run the link over an already open transport.
    ///
    /// Completes once the device sent `READY` or answered a `PING` probe.
    pub async fn from_transport<R, W>(
        reader: R,
        writer: W,
        port_name: impl Into<String>,
        config: LinkConfig,
    ) -> Result<Self, LinkError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            mirror: parking_lot::Mutex::new(Mirror {
                connected: false,
                status: TriggerStatus::default(),
            }),
            pending: parking_lot::Mutex::new(None),
            events,
        });
        shared.mark_connected();

        let mut hello_rx = shared.events.subscribe();
        let handle = tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        let link = Self {
            port_name: port_name.into(),
            config,
            shared,
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            request_lock: tokio::sync::Mutex::new(()),
            reader: parking_lot::Mutex::new(Some(handle)),
        };

        let timeout = link.config.handshake_timeout;
        let hello = match tokio::time::timeout(timeout, link.await_hello(&mut hello_rx)).await {
            Ok(result) => result?,
            Err(_) => return Err(LinkError::HandshakeTimeout(timeout)),
        };

        if let Hello::Pong = hello {
            // The board did not reset on open; fetch its real state.
            match link.request_status().await {
                Ok(status) => debug!(state = %status.state, "Synchronized with running device"),
                Err(e) => {
                    warn!(error = %e, "Status query after handshake failed, assuming IDLE");
                    link.shared.mark_connected();
                }
            }
        }

        info!(port = %link.port_name, "Trigger device connected");
        let _ = link.shared.events.send(LinkEvent::Connected {
            port: link.port_name.clone(),
        });
        Ok(link)
    }

    async fn await_hello(
        &self,
        events: &mut broadcast::Receiver<LinkEvent>,
    ) -> Result<Hello, LinkError> {
        let mut probe = tokio::time::interval(HANDSHAKE_PROBE);
        loop {
            tokio::select! {
                _ = probe.tick() => self.write_command(Command::Ping).await?,
                event = events.recv() => match event {
                    Ok(LinkEvent::Message(DeviceMessage::Ready)) => return Ok(Hello::Ready),
                    Ok(LinkEvent::Message(DeviceMessage::Pong)) => return Ok(Hello::Pong),
                    Ok(LinkEvent::Disconnected) | Err(broadcast::error::RecvError::Closed) => {
                        return Err(LinkError::Closed);
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                },
            }
        }
    }

    /// Port the link was opened on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// `false` once the transport closed or `disconnect` ran.
    pub fn is_connected(&self) -> bool {
        self.shared.mirror.lock().connected
    }

    /// Mirrored device state.
    pub fn state(&self) -> LinkState {
        let mirror = self.shared.mirror.lock();
        if mirror.connected {
            LinkState::Device(mirror.status.state)
        } else {
            LinkState::Disconnected
        }
    }

    /// Last mirrored snapshot, `None` while disconnected.
    pub fn status(&self) -> Option<TriggerStatus> {
        let mirror = self.shared.mirror.lock();
        mirror.connected.then_some(mirror.status)
    }

    /// Receive every subsequent [`LinkEvent`].
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Send `ARM`.
    pub async fn arm(&self) -> Result<(), LinkError> {
        self.write_command(Command::Arm).await
    }

    /// Send `DISARM`.
    pub async fn disarm(&self) -> Result<(), LinkError> {
        self.write_command(Command::Disarm).await
    }

    /// Send `START`.
    pub async fn start(&self) -> Result<(), LinkError> {
        self.write_command(Command::Start).await
    }

    /// Send `STOP` without waiting for the count. See [`Self::stop_and_count`].
    pub async fn stop(&self) -> Result<(), LinkError> {
        self.write_command(Command::Stop).await
    }

    /// Fire a single diagnostic pulse.
    pub async fn trigger_once(&self) -> Result<(), LinkError> {
        self.write_command(Command::Trigger).await
    }

    /// Send `FPS:<n>` after checking the range locally.
    pub async fn set_fps(&self, fps: u32) -> Result<(), LinkError> {
        if !(MIN_FPS..=MAX_FPS).contains(&fps) {
            return Err(LinkError::InvalidArgument(format!(
                "FPS must be {MIN_FPS}-{MAX_FPS}, got {fps}"
            )));
        }
        self.write_command(Command::SetFps(fps)).await
    }

    /// Send `CAMERAS:<n>` after checking the range locally.
    pub async fn set_camera_count(&self, cameras: u8) -> Result<(), LinkError> {
        if !(MIN_CAMERAS..=MAX_CAMERAS).contains(&cameras) {
            return Err(LinkError::InvalidArgument(format!(
                "Cameras must be {MIN_CAMERAS}-{MAX_CAMERAS}, got {cameras}"
            )));
        }
        self.write_command(Command::SetCameras(cameras)).await
    }

    /// Round-trip a `PING`, returning the latency.
    pub async fn ping(&self) -> Result<Duration, LinkError> {
        let started = Instant::now();
        self.request(Command::Ping, Expect::Pong).await?;
        Ok(started.elapsed())
    }

    /// Poll the device for a fresh status snapshot.
    pub async fn request_status(&self) -> Result<TriggerStatus, LinkError> {
        match self.request(Command::Status, Expect::Status).await? {
            DeviceMessage::Status(status) => Ok(status),
            other => Err(LinkError::Device(format!("Unexpected reply {other}"))),
        }
    }

    /// Send `STOP` and wait for the device's final frame count.
    pub async fn stop_and_count(&self) -> Result<u32, LinkError> {
        match self.request(Command::Stop, Expect::Stopped).await? {
            DeviceMessage::Stopped(n) => Ok(n),
            other => Err(LinkError::Device(format!("Unexpected reply {other}"))),
        }
    }

    /// Close the transport. Pending requests fail with [`LinkError::Closed`].
    pub async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.shared.mark_disconnected();
        info!(port = %self.port_name, "Trigger device disconnected");
    }

    async fn request(&self, command: Command, expect: Expect) -> Result<DeviceMessage, LinkError> {
        let _guard = self.request_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        *self.shared.pending.lock() = Some(Pending { expect, tx });

        if let Err(e) = self.write_command(command).await {
            self.shared.pending.lock().take();
            return Err(e);
        }

        let after = self.config.command_timeout;
        match tokio::time::timeout(after, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                self.shared.pending.lock().take();
                Err(LinkError::Timeout {
                    command: command.to_string(),
                    after,
                })
            }
        }
    }

    async fn write_command(&self, command: Command) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(LinkError::NotConnected)?;

        debug!(%command, "Sending trigger command");
        let line = format!("{command}\n");
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for TriggerLink {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_follows_recording_cycle() {
        let mut status = TriggerStatus::default();
        apply(&mut status, &DeviceMessage::Armed);
        assert_eq!(status.state, TriggerState::Armed);
        apply(&mut status, &DeviceMessage::Recording);
        apply(&mut status, &DeviceMessage::Frame(10));
        assert_eq!(status.frame_count, 10);
        apply(&mut status, &DeviceMessage::Killed);
        assert_eq!(status.state, TriggerState::Stopping);
        apply(&mut status, &DeviceMessage::Stopped(12));
        assert_eq!(status.state, TriggerState::Idle);
        assert_eq!(status.frame_count, 12);
    }

    #[test]
    fn test_ready_resets_mirror() {
        let mut status = TriggerStatus {
            state: TriggerState::Recording,
            frame_count: 99,
            fps: 120,
            active_cameras: 2,
        };
        apply(&mut status, &DeviceMessage::Ready);
        assert_eq!(status, TriggerStatus::default());
    }

    #[test]
    fn test_error_and_pong_leave_mirror_alone() {
        let mut status = TriggerStatus::default();
        apply(&mut status, &DeviceMessage::FpsSet(90));
        let before = status;
        apply(&mut status, &DeviceMessage::Error("Not armed".into()));
        apply(&mut status, &DeviceMessage::Pong);
        apply(&mut status, &DeviceMessage::Button("START".into()));
        assert_eq!(status, before);
    }

    #[test]
    fn test_expect_matching() {
        assert!(Expect::Pong.matches(&DeviceMessage::Pong));
        assert!(!Expect::Pong.matches(&DeviceMessage::Ready));
        assert!(Expect::Stopped.matches(&DeviceMessage::Stopped(3)));
        assert!(!Expect::Status.matches(&DeviceMessage::Stopped(3)));
    }
}
