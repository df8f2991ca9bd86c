//! Configuration loading using Figment.
//!
//! Configuration is merged from:
//! 1. `camsync.toml` (or the file given with `--config`)
//! 2. environment variables prefixed with `CAMSYNC_`
//!
//! Nested keys are separated by a double underscore so field names may keep
//! their own underscores:
//!
//! ```text
//! CAMSYNC_TRIGGER__PORT=/dev/ttyACM0
//! CAMSYNC_TRIGGER__FPS=60
//! CAMSYNC_APPLICATION__LOG_LEVEL=debug
//! ```
//!
//! Every field has a default, so a missing file yields a usable configuration.

use crate::trigger::link::LinkConfig;
use crate::trigger::protocol::{DEFAULT_FPS, MAX_CAMERAS, MAX_FPS, MIN_FPS};
use crate::worker::{CaptureSettings, WorkerConfig};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "camsync.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be read or parsed
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are out of range or inconsistent
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// `[application]` table
    #[serde(default)]
    pub application: ApplicationConfig,
    /// `[trigger]` table
    #[serde(default)]
    pub trigger: TriggerConfig,
    /// `[worker]` table
    #[serde(default)]
    pub worker: WorkerSection,
    /// `[[cameras]]` entries, in recording order
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    /// Camera settings sent to every worker before recording.
    #[serde(default)]
    pub capture: CaptureSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name used in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Root directory for session folders
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            output_dir: default_output_dir(),
        }
    }
}

/// Trigger device connection and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Serial port path, or "auto" to detect the board
    #[serde(default = "default_port")]
    pub port: String,
    /// Serial line rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Wait for `READY`/`PONG` after opening the port
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Wait for each request/response command
    #[serde(default = "default_trigger_command_timeout")]
    pub command_timeout_ms: u64,
    /// Default recording rate (1-165)
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Pause between stopping the trigger and stopping the workers, so the
    /// last frames reach disk
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            handshake_timeout_ms: default_handshake_timeout(),
            command_timeout_ms: default_trigger_command_timeout(),
            fps: default_fps(),
            settle_ms: default_settle(),
        }
    }
}

/// Capture worker launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Worker executable
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before `--camera-id <id>`
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Wait for the worker's first `STATUS:` line
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,
    /// Wait for each worker command
    #[serde(default = "default_worker_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            startup_timeout_ms: default_startup_timeout(),
            command_timeout_ms: default_worker_command_timeout(),
        }
    }
}

/// One camera entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Unique camera id, also the name of its output folder
    pub id: String,
    /// Network address passed to the worker's `init`
    #[serde(default)]
    pub ip: Option<String>,
    /// Disabled cameras are skipped entirely
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl CameraConfig {
    /// Enabled camera entry
    pub fn new(id: impl Into<String>, ip: Option<&str>) -> Self {
        Self {
            id: id.into(),
            ip: ip.map(str::to_string),
            enabled: true,
        }
    }
}

fn default_name() -> String {
    "camsync".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("recordings")
}

fn default_port() -> String {
    "auto".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_handshake_timeout() -> u64 {
    3000
}

fn default_trigger_command_timeout() -> u64 {
    1000
}

fn default_fps() -> u32 {
    DEFAULT_FPS
}

fn default_settle() -> u64 {
    500
}

fn default_program() -> String {
    WorkerConfig::default().program
}

fn default_args() -> Vec<String> {
    WorkerConfig::default().args
}

fn default_startup_timeout() -> u64 {
    10_000
}

fn default_worker_command_timeout() -> u64 {
    5000
}

fn default_enabled() -> bool {
    true
}

impl SyncConfig {
    /// Load `camsync.toml` from the working directory plus environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CAMSYNC_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Trigger fps is within the device range
    /// - Worker program is set
    /// - Camera IDs are present and unique, at most four enabled
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !(MIN_FPS..=MAX_FPS).contains(&self.trigger.fps) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid fps {}. Must be {}-{}",
                self.trigger.fps, MIN_FPS, MAX_FPS
            )));
        }

        if self.trigger.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "baud_rate must be greater than 0".to_string(),
            ));
        }

        if self.worker.program.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "worker.program must not be empty".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Camera id must not be empty".to_string(),
                ));
            }
            if !ids.insert(&camera.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate camera ID: '{}'",
                    camera.id
                )));
            }
        }

        let enabled = self.enabled_cameras().count();
        if enabled > usize::from(MAX_CAMERAS) {
            return Err(ConfigError::ValidationError(format!(
                "{enabled} cameras enabled, the trigger device drives at most {MAX_CAMERAS}"
            )));
        }

        Ok(())
    }

    /// Additional checks before a recording can start.
    pub fn validate_for_recording(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.enabled_cameras().next().is_none() {
            return Err(ConfigError::ValidationError(
                "No enabled cameras configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Cameras that take part in recording
    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.iter().filter(|c| c.enabled)
    }

    /// Trigger link parameters; `auto` or an empty port means auto-detect
    pub fn link_config(&self) -> LinkConfig {
        let port = match self.trigger.port.trim() {
            "" | "auto" => None,
            path => Some(path.to_string()),
        };
        LinkConfig {
            port,
            baud_rate: self.trigger.baud_rate,
            handshake_timeout: Duration::from_millis(self.trigger.handshake_timeout_ms),
            command_timeout: Duration::from_millis(self.trigger.command_timeout_ms),
        }
    }

    /// Worker launch parameters
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            program: self.worker.program.clone(),
            args: self.worker.args.clone(),
            startup_timeout: Duration::from_millis(self.worker.startup_timeout_ms),
            command_timeout: Duration::from_millis(self.worker.command_timeout_ms),
        }
    }
}
