//! JSON settings document
//!
//! The host pushes these through `ChangeSettings`. They shape the generated
//! engine configuration and tune probing and the legacy command server.

use crate::config::validation;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace
    Trace,
    /// Debug
    Debug,
    /// Info
    Info,
    /// Warn
    Warn,
    /// Error
    Error,
}

/// Routing mode reported to clash-mode command clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClashMode {
    /// Route by rules
    Rule,
    /// Everything through the selected proxy
    Global,
    /// Everything direct
    Direct,
}

/// Settings document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreSettings {
    /// Engine log level
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Routing mode
    #[serde(default = "default_clash_mode")]
    pub clash_mode: ClashMode,

    /// Legacy command server port (0 = ephemeral)
    #[serde(default)]
    pub command_server_port: u16,

    /// URL used by reachability probes
    #[serde(default = "default_url_test_url")]
    pub url_test_url: String,

    /// Per-probe timeout in milliseconds
    #[serde(default = "default_url_test_timeout_ms")]
    pub url_test_timeout_ms: u64,

    /// Local mixed (socks+http) inbound port
    #[serde(default = "default_mixed_port")]
    pub mixed_port: u16,

    /// Region hint for generated routing rules
    #[serde(default = "default_region")]
    pub region: String,

    /// Route known ad domains to block
    #[serde(default)]
    pub block_ads: bool,
}

impl CoreSettings {
    /// Parse and validate a settings document
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: CoreSettings = serde_json::from_str(json)
            .map_err(|e| CoreError::Settings(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            CoreError::Serialization(format!("Failed to serialize settings: {}", e))
        })
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<()> {
        validation::validate_probe_url(&self.url_test_url)
            .map_err(|e| CoreError::Settings(e.to_string()))?;

        if !(100..=60_000).contains(&self.url_test_timeout_ms) {
            return Err(CoreError::Settings(format!(
                "urlTestTimeoutMs {} is out of valid range (100-60000)",
                self.url_test_timeout_ms
            )));
        }

        if self.mixed_port == 0 {
            return Err(CoreError::Settings("mixedPort cannot be 0".to_string()));
        }

        if self.region.trim().is_empty() {
            return Err(CoreError::Settings("region cannot be empty".to_string()));
        }

        Ok(())
    }

    /// Per-probe timeout
    pub fn url_test_timeout(&self) -> Duration {
        Duration::from_millis(self.url_test_timeout_ms)
    }
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            clash_mode: default_clash_mode(),
            command_server_port: 0,
            url_test_url: default_url_test_url(),
            url_test_timeout_ms: default_url_test_timeout_ms(),
            mixed_port: default_mixed_port(),
            region: default_region(),
            block_ads: false,
        }
    }
}

// Default value functions for serde
fn default_log_level() -> LogLevel {
    LogLevel::Warn
}

fn default_clash_mode() -> ClashMode {
    ClashMode::Rule
}

fn default_url_test_url() -> String {
    "http://cp.cloudflare.com/".to_string()
}

fn default_url_test_timeout_ms() -> u64 {
    5_000
}

fn default_mixed_port() -> u16 {
    12334
}

fn default_region() -> String {
    "other".to_string()
}
