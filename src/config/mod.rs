//! Configuration management
//!
//! This module handles the agent's static TOML file, the process setup
//! parameters supplied by the host, the JSON settings document, and the
//! JSON engine profiles that `Parse` and `GenerateConfig` work on.

mod profile;
mod settings;
mod toml_parser;
pub mod validation;

pub use profile::{OutboundConfig, OutboundKind, Profile};
pub use settings::{ClashMode, CoreSettings, LogLevel};
pub use toml_parser::TomlConfig;

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the host runs the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupMode {
    /// Embedded in the host process, no control server
    Embedded,
    /// Control server with secret authentication
    Server,
    /// Control server for a background service, secret authentication
    BackgroundServer,
    /// Control server without authentication
    ServerInsecure,
    /// Background control server without authentication
    BackgroundServerInsecure,
}

impl SetupMode {
    /// Whether this mode runs the control server
    pub fn is_server(&self) -> bool {
        !matches!(self, SetupMode::Embedded)
    }

    /// Whether the control server requires the shared secret
    pub fn requires_secret(&self) -> bool {
        matches!(self, SetupMode::Server | SetupMode::BackgroundServer)
    }
}

impl TryFrom<i32> for SetupMode {
    type Error = CoreError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(SetupMode::Embedded),
            1 => Ok(SetupMode::Server),
            2 => Ok(SetupMode::BackgroundServer),
            3 => Ok(SetupMode::ServerInsecure),
            4 => Ok(SetupMode::BackgroundServerInsecure),
            other => Err(CoreError::Setup(format!("unrecognized setup mode: {}", other))),
        }
    }
}

impl std::fmt::Display for SetupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupMode::Embedded => write!(f, "embedded"),
            SetupMode::Server => write!(f, "server"),
            SetupMode::BackgroundServer => write!(f, "background_server"),
            SetupMode::ServerInsecure => write!(f, "server_insecure"),
            SetupMode::BackgroundServerInsecure => write!(f, "background_server_insecure"),
        }
    }
}

/// One-time process initialization parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupParameters {
    /// Base directory of the host installation; must exist
    pub base_path: PathBuf,
    /// Working directory for keys and runtime files; created if missing
    pub working_dir: PathBuf,
    /// Temporary directory; created if missing
    pub temp_dir: PathBuf,
    /// Host port receiving status notifications (`<= 0` disables them)
    #[serde(default)]
    pub status_port: i64,
    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,
    /// Operating mode
    pub mode: SetupMode,
    /// Control server listen address (server modes)
    #[serde(default)]
    pub listen: String,
    /// Shared secret (secure server modes)
    #[serde(default)]
    pub secret: String,
}

impl SetupParameters {
    /// Validate the parameters, creating the working and temp directories
    pub fn validate(&self) -> Result<()> {
        validation::validate_existing_dir(&self.base_path)
            .map_err(|e| CoreError::Setup(format!("base path: {}", e)))?;
        validation::ensure_dir(&self.working_dir)
            .map_err(|e| CoreError::Setup(format!("working dir: {}", e)))?;
        validation::ensure_dir(&self.temp_dir)
            .map_err(|e| CoreError::Setup(format!("temp dir: {}", e)))?;

        if self.mode.is_server() {
            validation::validate_listen_address(&self.listen)
                .map_err(|e| CoreError::Setup(e.to_string()))?;
        }
        if self.mode.requires_secret() {
            validation::validate_secret(&self.secret)
                .map_err(|e| CoreError::Setup(e.to_string()))?;
        }
        Ok(())
    }

    /// Path of the persisted server key
    pub fn server_key_path(&self) -> PathBuf {
        self.working_dir.join("control-server.key")
    }
}

/// Start/Restart request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Path of the engine profile
    pub config_path: PathBuf,
    /// Start the legacy command server alongside the engine
    pub enable_old_command_server: bool,
    /// Disable the engine's internal memory limiter
    pub disable_memory_limit: bool,
}

impl StartRequest {
    /// Request as issued by the host boundary: the legacy command server is
    /// always enabled there.
    pub fn new<P: AsRef<Path>>(config_path: P, disable_memory_limit: bool) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            enable_old_command_server: true,
            disable_memory_limit,
        }
    }
}

/// Controller tuning
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Upper bound on engine construction
    pub start_timeout: Duration,
    /// Heartbeat interval of periodic command feeds
    pub feed_interval: Duration,
    /// Connect timeout when attaching a command client
    pub connect_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            feed_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Agent configuration loaded by the binary
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Setup parameters
    pub setup: SetupParameters,
    /// Controller tuning
    pub controller: ControllerOptions,
    /// Initial settings
    pub settings: CoreSettings,
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let toml_config = TomlConfig::from_file(path)?;
        toml_config.try_into()
    }
}
