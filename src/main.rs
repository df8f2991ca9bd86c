//! camsync command line entry point.

use anyhow::{bail, Context, Result};
use camsync::config::{SyncConfig, DEFAULT_CONFIG_FILE};
use camsync::session::{RecordingSession, SessionOptions};
use camsync::trigger::controller::{ControllerConfig, TriggerController};
use camsync::trigger::discovery;
use camsync::trigger::link::{LinkEvent, TriggerLink};
use camsync::trigger::protocol::DeviceMessage;
use camsync::trigger::sim::{HostClock, LoggedLines, SimLed, SimPin, StdioSerial};
use camsync::CaptureCoordinator;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for a session whose frame counts do not agree.
const EXIT_MISMATCH: i32 = 2;

#[derive(Parser)]
#[command(name = "camsync", about = "Hardware-synchronized multi-camera capture", version)]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports ranked by how likely they are the trigger device
    Ports,
    /// Connect to the trigger device and measure round trips
    Ping {
        /// Serial port, overrides the configuration
        #[arg(long)]
        port: Option<String>,
        #[arg(long, default_value_t = 3)]
        count: u32,
    },
    /// Print the effective configuration after file and environment merging
    Config,
    /// Ask a capture worker which cameras it can see
    Detect,
    /// Record one synchronized session
    Record {
        /// Seconds to record; runs until Ctrl-C when omitted
        #[arg(long)]
        duration: Option<f64>,
        #[arg(long)]
        fps: Option<u32>,
        /// Parent directory for the session folder
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run the trigger controller on stdin/stdout
    Simulate {
        /// Report FRAME:<n> every this many frames
        #[arg(long, default_value_t = 0)]
        frame_report: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    init_tracing(&config.application.log_level, cli.json);

    match cli.command {
        Command::Ports => list_ports(),
        Command::Ping { port, count } => ping(config, port, count).await,
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Detect => detect(config).await,
        Command::Record {
            duration,
            fps,
            output,
        } => {
            let synced = record(config, duration, fps, output).await?;
            if !synced {
                std::process::exit(EXIT_MISMATCH);
            }
            Ok(())
        }
        Command::Simulate { frame_report } => {
            tokio::task::spawn_blocking(move || simulate(frame_report))
                .await
                .context("Simulator thread panicked")?;
            Ok(())
        }
    }
}

fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // stdout is the serial channel in `simulate`, so logs always go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn list_ports() -> Result<()> {
    let candidates = discovery::list_candidates().context("Failed to enumerate serial ports")?;
    if candidates.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    println!("{:>5}  {:<28} DESCRIPTION", "SCORE", "PORT");
    for candidate in candidates {
        println!(
            "{:>5}  {:<28} {}",
            candidate.score, candidate.port_name, candidate.description
        );
    }
    Ok(())
}

async fn ping(config: SyncConfig, port: Option<String>, count: u32) -> Result<()> {
    let mut link_config = config.link_config();
    if port.is_some() {
        link_config.port = port;
    }
    let link = TriggerLink::connect(link_config)
        .await
        .context("Failed to connect to trigger device")?;
    println!("Connected to {}", link.port_name());

    for _ in 0..count {
        match link.ping().await {
            Ok(rtt) => println!("PONG in {:.2} ms", rtt.as_secs_f64() * 1000.0),
            Err(e) => println!("Ping failed: {e}"),
        }
    }

    let status = link.request_status().await?;
    println!(
        "State {} | frames {} | fps {} | cameras {}",
        status.state, status.frame_count, status.fps, status.active_cameras
    );
    link.disconnect().await;
    Ok(())
}

async fn detect(config: SyncConfig) -> Result<()> {
    let coordinator = CaptureCoordinator::with_process_workers(config.worker_config());
    let cameras = coordinator.detect_cameras().await?;
    if cameras.is_empty() {
        println!("No cameras found");
    }
    for camera in cameras {
        println!("{}", camera.friendly_name);
        println!("    IP: {}", camera.ip_address);
        println!("    Serial: {}", camera.serial_number);
        println!("    Model: {}", camera.model_name);
    }
    Ok(())
}

async fn record(
    config: SyncConfig,
    duration: Option<f64>,
    fps: Option<u32>,
    output: Option<PathBuf>,
) -> Result<bool> {
    config.validate_for_recording()?;

    let link = TriggerLink::connect(config.link_config())
        .await
        .context("Failed to connect to trigger device")?;
    let mut link_events = link.subscribe();

    let mut coordinator = CaptureCoordinator::with_process_workers(config.worker_config());
    let init = coordinator.initialize(&config.cameras).await;
    for (camera_id, error) in init.failed() {
        warn!(camera_id, error = %error, "Camera left out of session");
    }
    if coordinator.is_empty() {
        link.disconnect().await;
        bail!("No camera worker could be initialized");
    }
    for (camera_id, error) in coordinator.connect_all().await.failed() {
        warn!(camera_id, error = %error, "Camera connection failed");
    }

    let options = SessionOptions {
        fps: fps.unwrap_or(config.trigger.fps),
        output_root: output.unwrap_or_else(|| config.application.output_dir.clone()),
        settings: config.capture.clone(),
        settle: Duration::from_millis(config.trigger.settle_ms),
    };

    let started = RecordingSession::start(&link, &coordinator, options).await;
    let session = match started {
        Ok(session) => session,
        Err(e) => {
            coordinator.shutdown().await;
            link.disconnect().await;
            return Err(e).context("Failed to start recording");
        }
    };
    println!("Recording into {}", session.session_dir().display());

    let limit = duration.map(Duration::from_secs_f64);
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut progress = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping session");
                break;
            }
            event = link_events.recv() => match event {
                Ok(LinkEvent::Message(DeviceMessage::Killed)) => {
                    warn!("Kill switch engaged, stopping session");
                    break;
                }
                Ok(LinkEvent::Disconnected) => {
                    warn!("Trigger device disconnected, stopping session");
                    break;
                }
                _ => {}
            },
            _ = progress.tick() => {
                let verdict = session.progress();
                info!(counts = ?verdict.per_camera_counts, synced = verdict.synced, "Recording");
            }
        }
    }

    let report = session.stop().await;
    let _ = coordinator.disconnect_all().await;
    coordinator.shutdown().await;
    link.disconnect().await;
    let report = report?;

    println!("Session {}", report.metadata.session_id);
    for (camera_id, frames) in &report.metadata.camera_frame_counts {
        println!("  {camera_id}: {frames} frames");
    }
    if let Some(n) = report.metadata.trigger_frame_count {
        println!("  trigger: {n} pulses");
    }
    println!("  sync: {}", report.verdict.status_label());
    println!("Metadata written to {}", report.metadata_path.display());

    Ok(report.is_synced())
}

fn simulate(frame_report: u32) {
    let config = ControllerConfig {
        frame_report_interval: frame_report,
        ..ControllerConfig::default()
    };
    let mut controller = TriggerController::new(
        config,
        HostClock::new(),
        LoggedLines,
        SimPin::new(),
        SimPin::new(),
        SimLed::new(),
    );
    let mut io = StdioSerial::spawn();

    info!("Simulated trigger device running on stdin/stdout");
    controller.boot(&mut io);
    while !io.is_closed() {
        controller.poll(&mut io);
        std::thread::sleep(Duration::from_micros(200));
    }
    info!("stdin closed, simulator exiting");
}
