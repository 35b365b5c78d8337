//! Proxy engine abstraction
//!
//! The controller never touches proxy protocols. It drives an engine through
//! the [`Engine`] trait and builds one through an [`EngineFactory`]. The
//! crate ships [`ProfileEngine`], which runs a JSON profile's outbound
//! topology and probes members with plain TCP connects.

mod profile;

pub use profile::{ProfileEngine, ProfileEngineFactory};

use crate::config::{CoreSettings, OutboundKind};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything an engine needs to be built
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Profile path
    pub config_path: PathBuf,
    /// Disable the engine's internal memory limiter
    pub disable_memory_limit: bool,
    /// Settings in effect at start
    pub settings: CoreSettings,
}

/// Reachability probe parameters
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// URL whose host is dialed for direct outbounds
    pub url: String,
    /// Per-probe timeout
    pub timeout: Duration,
}

impl ProbeOptions {
    /// Probe options derived from settings
    pub fn from_settings(settings: &CoreSettings) -> Self {
        Self {
            url: settings.url_test_url.clone(),
            timeout: settings.url_test_timeout(),
        }
    }
}

/// An outbound group as seen from outside the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundGroup {
    /// Group tag
    pub tag: String,
    /// Group type
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    /// Member tags
    pub members: Vec<String>,
    /// Currently active member
    pub selected: Option<String>,
}

impl OutboundGroup {
    /// Whether `tag` is a member
    pub fn contains(&self, tag: &str) -> bool {
        self.members.iter().any(|m| m == tag)
    }
}

/// Result of probing one outbound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlTestResult {
    /// Outbound tag
    pub tag: String,
    /// Round-trip latency when reachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Failure reason when unreachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UrlTestResult {
    /// Successful probe
    pub fn reachable(tag: impl Into<String>, delay: Duration) -> Self {
        Self {
            tag: tag.into(),
            delay_ms: Some(delay.as_millis() as u64),
            error: None,
        }
    }

    /// Failed probe
    pub fn unreachable(tag: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            delay_ms: None,
            error: Some(error.into()),
        }
    }

    /// Whether the probe succeeded
    pub fn is_reachable(&self) -> bool {
        self.delay_ms.is_some()
    }
}

/// A running proxy engine
#[async_trait]
pub trait Engine: Send + Sync {
    /// Outbound groups and their current selection
    fn groups(&self) -> Vec<OutboundGroup>;

    /// Make `outbound` the active member of `group`
    fn select_outbound(&self, group: &str, outbound: &str) -> Result<()>;

    /// Probe every member of `group`
    async fn url_test(&self, group: &str, probe: &ProbeOptions) -> Result<Vec<UrlTestResult>>;

    /// Toggle the internal memory limiter
    fn set_memory_limit(&self, enabled: bool);

    /// Release every resource held by the engine
    async fn close(&self) -> Result<()>;
}

/// Builds engines
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Construct and start an engine
    async fn create(&self, options: EngineOptions) -> Result<Arc<dyn Engine>>;
}
