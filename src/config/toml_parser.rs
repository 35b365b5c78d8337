//! TOML configuration file parser
//!
//! This module handles parsing of the agent's TOML configuration file used
//! when the binary runs standalone. The file carries the setup parameters,
//! controller tuning, and the initial settings document.

use crate::config::{AgentConfig, ControllerOptions, CoreSettings, SetupMode, SetupParameters};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TOML configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Setup parameters
    pub setup: TomlSetupConfig,

    /// Controller tuning
    #[serde(default)]
    pub controller: TomlControllerConfig,

    /// Initial settings (same keys as the JSON settings document)
    #[serde(default)]
    pub settings: CoreSettings,
}

/// TOML setup section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlSetupConfig {
    /// Base directory
    pub base_path: PathBuf,

    /// Working directory
    pub working_dir: PathBuf,

    /// Temporary directory
    pub temp_dir: PathBuf,

    /// Operating mode
    #[serde(default = "default_mode")]
    pub mode: SetupMode,

    /// Control server listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Shared secret
    #[serde(default)]
    pub secret: String,

    /// Status notification port (0 disables)
    #[serde(default)]
    pub status_port: i64,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,
}

/// TOML controller section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlControllerConfig {
    /// Engine construction timeout in seconds
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Command feed heartbeat in milliseconds
    #[serde(default = "default_feed_interval")]
    pub feed_interval_ms: u64,

    /// Command client connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for TomlControllerConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: default_start_timeout(),
            feed_interval_ms: default_feed_interval(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl TomlConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse(toml: &str) -> Result<Self> {
        toml::from_str(toml)
            .map_err(|e| CoreError::Config(format!("Failed to parse TOML config: {}", e)))
    }
}

// Convert TOML config to internal AgentConfig
impl TryFrom<TomlConfig> for AgentConfig {
    type Error = CoreError;

    fn try_from(toml: TomlConfig) -> Result<Self> {
        toml.settings
            .validate()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        if toml.controller.start_timeout_secs == 0 {
            return Err(CoreError::Config(
                "start_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(AgentConfig {
            setup: SetupParameters {
                base_path: toml.setup.base_path,
                working_dir: toml.setup.working_dir,
                temp_dir: toml.setup.temp_dir,
                status_port: toml.setup.status_port,
                debug: toml.setup.debug,
                mode: toml.setup.mode,
                listen: toml.setup.listen,
                secret: toml.setup.secret,
            },
            controller: ControllerOptions {
                start_timeout: Duration::from_secs(toml.controller.start_timeout_secs),
                feed_interval: Duration::from_millis(toml.controller.feed_interval_ms.max(50)),
                connect_timeout: Duration::from_millis(toml.controller.connect_timeout_ms.max(50)),
            },
            settings: toml.settings,
        })
    }
}

// Default value functions
fn default_mode() -> SetupMode {
    SetupMode::ServerInsecure
}

fn default_listen() -> String {
    "127.0.0.1:17078".to_string()
}

fn default_start_timeout() -> u64 {
    30
}

fn default_feed_interval() -> u64 {
    1_000
}

fn default_connect_timeout() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClashMode;

    #[test]
    fn test_parse_basic_toml() {
        let toml = r#"
            [setup]
            base_path = "/opt/core-agent"
            working_dir = "/var/lib/core-agent"
            temp_dir = "/tmp/core-agent"
            mode = "server"
            listen = "127.0.0.1:17078"
            secret = "correct-horse"
            debug = true

            [controller]
            start_timeout_secs = 10

            [settings]
            clashMode = "direct"
            mixedPort = 2080
        "#;

        let config = TomlConfig::parse(toml).expect("Failed to parse TOML");
        assert_eq!(config.setup.mode, SetupMode::Server);
        assert_eq!(config.setup.secret, "correct-horse");
        assert!(config.setup.debug);
        assert_eq!(config.controller.start_timeout_secs, 10);
        assert_eq!(config.settings.clash_mode, ClashMode::Direct);
        assert_eq!(config.settings.mixed_port, 2080);
    }

    #[test]
    fn test_parse_with_defaults() {
        let toml = r#"
            [setup]
            base_path = "/opt/core-agent"
            working_dir = "/var/lib/core-agent"
            temp_dir = "/tmp/core-agent"
        "#;

        let config = TomlConfig::parse(toml).expect("Failed to parse TOML");
        assert_eq!(config.setup.mode, SetupMode::ServerInsecure);
        assert_eq!(config.setup.listen, "127.0.0.1:17078");
        assert_eq!(config.setup.status_port, 0);
        assert_eq!(config.controller.start_timeout_secs, 30);
        assert_eq!(config.settings, CoreSettings::default());
    }

    #[test]
    fn test_missing_setup_section_fails() {
        assert!(TomlConfig::parse("[controller]\nstart_timeout_secs = 5\n").is_err());
    }

    #[test]
    fn test_convert_to_agent_config() {
        let toml = r#"
            [setup]
            base_path = "/opt/core-agent"
            working_dir = "/var/lib/core-agent"
            temp_dir = "/tmp/core-agent"
            mode = "embedded"

            [controller]
            start_timeout_secs = 12
            feed_interval_ms = 250
        "#;

        let config: AgentConfig = TomlConfig::parse(toml).unwrap().try_into().unwrap();
        assert_eq!(config.setup.mode, SetupMode::Embedded);
        assert_eq!(config.controller.start_timeout, Duration::from_secs(12));
        assert_eq!(config.controller.feed_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_zero_start_timeout_rejected() {
        let toml = r#"
            [setup]
            base_path = "/opt/core-agent"
            working_dir = "/var/lib/core-agent"
            temp_dir = "/tmp/core-agent"

            [controller]
            start_timeout_secs = 0
        "#;

        let result: Result<AgentConfig> = TomlConfig::parse(toml).unwrap().try_into();
        assert!(result.is_err());
    }
}
