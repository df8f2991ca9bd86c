//! In-memory capture worker shared by the worker and coordinator tests.

#![allow(dead_code)]

use async_trait::async_trait;
use camsync::coordinator::WorkerLauncher;
use camsync::worker::{CaptureWorker, WorkerConfig, WorkerError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::mpsc;

/// Shared record of what fake workers received and answered.
///
/// Entries are `<camera>:<command>` when a line arrives and
/// `<camera>:<command>:replied` right before its reply lines are written.
pub type CommandLog = Arc<parking_lot::Mutex<Vec<String>>>;

pub fn command_log() -> CommandLog {
    Arc::new(parking_lot::Mutex::new(Vec::new()))
}

/// How a fake worker behaves.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Never print the readiness STATUS line.
    pub silent: bool,
    /// `FRAME_SAVED` lines emitted right after a successful start.
    pub frames: u64,
    /// Frame count reported by `stop_capture`, defaults to `frames`.
    pub reported: Option<u64>,
    pub fail_start: bool,
    /// Answer `stop_capture` with `ERROR:`.
    pub fail_stop: bool,
    /// Answer `stop_capture` with `success: false`.
    pub stop_unsuccessful: bool,
    /// Ignore these commands entirely.
    pub ignore: Vec<&'static str>,
    /// Hold back every reply this long.
    pub reply_delay: Option<Duration>,
    pub log: Option<CommandLog>,
}

pub fn test_config() -> WorkerConfig {
    WorkerConfig {
        startup_timeout: Duration::from_millis(300),
        command_timeout: Duration::from_millis(300),
        ..WorkerConfig::default()
    }
}

async fn send(writer: &mut WriteHalf<DuplexStream>, line: String) -> bool {
    writer
        .write_all(format!("{line}\n").as_bytes())
        .await
        .is_ok()
}

/// Serve the worker protocol on `io` until the host hangs up.
pub async fn run_fake_worker(io: DuplexStream, camera_id: String, script: Script) {
    let (reader, mut writer) = tokio::io::split(io);

    if !script.silent && !send(&mut writer, "STATUS:Worker ready".into()).await {
        return;
    }

    // Lines are logged as soon as they arrive, independent of the replies.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let arrivals = script.log.clone();
    let id = camera_id.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(log) = &arrivals {
                log.lock().push(format!("{id}:{}", command_name(&line)));
            }
            if tx.send(line).is_err() {
                return;
            }
        }
    });

    while let Some(line) = rx.recv().await {
        let command: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                send(&mut writer, "ERROR:Invalid JSON".into()).await;
                continue;
            }
        };
        let name = command["command"].as_str().unwrap_or_default().to_string();
        if script.ignore.contains(&name.as_str()) {
            continue;
        }
        if let Some(delay) = script.reply_delay {
            tokio::time::sleep(delay).await;
        }

        let mut out = Vec::new();
        match name.as_str() {
            "ping" => out.push(data(json!({"success": true, "pong": true}))),
            "version" => out.push(data(json!({"success": true, "version": "1.2.0"}))),
            "init" => out.push(data(json!({"success": true, "camera_id": camera_id}))),
            "connect" => out.push(data(json!({"success": true, "connected": true}))),
            "disconnect" | "configure" => out.push(data(json!({"success": true}))),
            "status" => out.push(data(json!({
                "success": true,
                "initialized": true,
                "camera_id": camera_id,
                "connected": true,
                "capturing": false,
                "frame_count": 0,
            }))),
            "detect_cameras" => out.push(data(json!({
                "success": true,
                "cameras": [{
                    "ip_address": "192.168.1.10",
                    "model_name": "GigE-1",
                    "serial_number": "S123",
                    "friendly_name": "Left",
                }],
            }))),
            "get_preview" => out.push("PREVIEW:data:image/jpeg;base64,AAAA".into()),
            "start_capture" if script.fail_start => {
                out.push("ERROR:Camera not connected".into());
            }
            "start_capture" => {
                out.push(data(json!({"success": true, "capturing": true})));
                let dir = command["output_dir"].as_str().unwrap_or(".").to_string();
                for n in 1..=script.frames {
                    out.push(format!(
                        "FRAME_SAVED:{}",
                        json!({
                            "camera_id": camera_id,
                            "frame_number": n,
                            "file_path": format!("{dir}/frame_{n:06}.png"),
                            "timestamp": n as f64 / 30.0,
                        })
                    ));
                }
            }
            "stop_capture" if script.fail_stop => out.push("ERROR:Stop failed".into()),
            "stop_capture" => out.push(data(json!({
                "success": !script.stop_unsuccessful,
                "frame_count": script.reported.unwrap_or(script.frames),
                "error": if script.stop_unsuccessful { json!("disk full") } else { Value::Null },
            }))),
            other => out.push(format!("ERROR:Unknown command: {other}")),
        }

        // Logged before writing, so the host cannot have seen the reply yet.
        if let Some(log) = &script.log {
            log.lock().push(format!("{camera_id}:{name}:replied"));
        }
        for reply in out {
            if !send(&mut writer, reply).await {
                return;
            }
        }
    }
}

fn data(value: Value) -> String {
    format!("DATA:{value}")
}

fn command_name(line: &str) -> String {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v["command"].as_str().map(str::to_string))
        .unwrap_or_else(|| "?".into())
}

/// Start a fake worker and attach a [`CaptureWorker`] to it.
pub async fn fake_worker(camera_id: &str, script: Script) -> Result<CaptureWorker, WorkerError> {
    let (host, device) = tokio::io::duplex(64 * 1024);
    tokio::spawn(run_fake_worker(device, camera_id.to_string(), script));
    let (stdout, stdin) = tokio::io::split(host);
    CaptureWorker::from_io(camera_id, stdout, stdin, &test_config()).await
}

/// Launcher handing out fake workers, scripted per camera.
#[derive(Default)]
pub struct FakeLauncher {
    scripts: HashMap<String, Script>,
    refuse: Vec<String>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, camera_id: &str, script: Script) -> Self {
        self.scripts.insert(camera_id.to_string(), script);
        self
    }

    /// Fail to launch this camera's worker.
    pub fn refuse(mut self, camera_id: &str) -> Self {
        self.refuse.push(camera_id.to_string());
        self
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, camera_id: &str) -> Result<CaptureWorker, WorkerError> {
        if self.refuse.iter().any(|id| id == camera_id) {
            return Err(WorkerError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such program",
            )));
        }
        let script = self.scripts.get(camera_id).cloned().unwrap_or_default();
        fake_worker(camera_id, script).await
    }
}
