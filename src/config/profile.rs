//! JSON engine profile
//!
//! A profile lists the engine's outbounds. Proxy outbounds carry a server
//! endpoint; group outbounds (`selector`, `urltest`) list member tags. This
//! module validates profiles, normalizes them for `Parse`, and renders the
//! full runnable configuration for `GenerateConfig`.

use crate::config::{validation, ClashMode, CoreSettings};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Tag of the selector group inserted by normalization
pub const SELECT_TAG: &str = "select";

/// Tag of the url-test group inserted by normalization
pub const AUTO_TAG: &str = "auto";

/// Tag of the built-in direct outbound
pub const DIRECT_TAG: &str = "direct";

/// Tag of the built-in block outbound
pub const BLOCK_TAG: &str = "block";

/// Outbound types understood by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundKind {
    /// Direct connection
    Direct,
    /// Reject traffic
    Block,
    /// SOCKS proxy
    Socks,
    /// HTTP proxy
    Http,
    /// Shadowsocks
    Shadowsocks,
    /// VMess
    Vmess,
    /// Trojan
    Trojan,
    /// VLESS
    Vless,
    /// Hysteria2
    Hysteria2,
    /// TUIC
    Tuic,
    /// WireGuard
    Wireguard,
    /// Manually selected group
    Selector,
    /// Group selected by latency
    Urltest,
}

impl OutboundKind {
    /// Whether this outbound groups other outbounds
    pub fn is_group(&self) -> bool {
        matches!(self, OutboundKind::Selector | OutboundKind::Urltest)
    }

    /// Whether this outbound dials a remote server
    pub fn is_proxy(&self) -> bool {
        !self.is_group() && !matches!(self, OutboundKind::Direct | OutboundKind::Block)
    }
}

impl std::fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{}", name)
    }
}

/// One outbound entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Outbound type
    #[serde(rename = "type")]
    pub kind: OutboundKind,

    /// Unique tag
    pub tag: String,

    /// Server host (proxy types)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Server port (proxy types)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,

    /// Member tags (group types)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbounds: Vec<String>,

    /// Initially selected member (selector groups)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Protocol-specific fields carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutboundConfig {
    /// Create a bare outbound of the given kind
    pub fn new(kind: OutboundKind, tag: impl Into<String>) -> Self {
        Self {
            kind,
            tag: tag.into(),
            server: None,
            server_port: None,
            outbounds: Vec::new(),
            default: None,
            extra: Map::new(),
        }
    }

    /// Create a proxy outbound dialing `server:port`
    pub fn proxy(kind: OutboundKind, tag: impl Into<String>, server: &str, port: u16) -> Self {
        let mut outbound = Self::new(kind, tag);
        outbound.server = Some(server.to_string());
        outbound.server_port = Some(port);
        outbound
    }

    /// Create a group outbound
    pub fn group(kind: OutboundKind, tag: impl Into<String>, members: Vec<String>) -> Self {
        let mut outbound = Self::new(kind, tag);
        outbound.outbounds = members;
        outbound
    }

    /// `host:port` of a proxy outbound
    pub fn endpoint(&self) -> Option<String> {
        match (&self.server, self.server_port) {
            (Some(server), Some(port)) if server.contains(':') => {
                Some(format!("[{}]:{}", server, port))
            }
            (Some(server), Some(port)) => Some(format!("{}:{}", server, port)),
            _ => None,
        }
    }
}

/// Engine profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Outbounds in declaration order
    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,

    /// Other top-level sections carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Profile {
    /// Parse a profile from JSON text
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Err(CoreError::Parse("profile is empty".to_string()));
        }

        serde_json::from_str(content)
            .map_err(|e| CoreError::Parse(format!("Failed to parse profile: {}", e)))
    }

    /// Read and parse a profile file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("Failed to read profile {:?}: {}", path, e))
        })?;
        Self::parse(&content)
    }

    /// Find an outbound by tag
    pub fn find(&self, tag: &str) -> Option<&OutboundConfig> {
        self.outbounds.iter().find(|o| o.tag == tag)
    }

    /// Group outbounds in declaration order
    pub fn groups(&self) -> impl Iterator<Item = &OutboundConfig> {
        self.outbounds.iter().filter(|o| o.kind.is_group())
    }

    /// Validate tags, endpoints and group membership
    pub fn validate(&self) -> Result<()> {
        if self.outbounds.is_empty() {
            return Err(CoreError::Parse("profile has no outbounds".to_string()));
        }

        let mut seen = HashSet::new();
        for outbound in &self.outbounds {
            validation::validate_tag(&outbound.tag)
                .map_err(|e| CoreError::Parse(e.to_string()))?;
            if !seen.insert(outbound.tag.as_str()) {
                return Err(CoreError::Parse(format!(
                    "duplicate outbound tag '{}'",
                    outbound.tag
                )));
            }
        }

        for outbound in &self.outbounds {
            if outbound.kind.is_proxy() {
                let endpoint = outbound.endpoint().ok_or_else(|| {
                    CoreError::Parse(format!(
                        "outbound '{}' ({}) requires server and server_port",
                        outbound.tag, outbound.kind
                    ))
                })?;
                validation::validate_endpoint(&endpoint).map_err(|e| {
                    CoreError::Parse(format!("outbound '{}': {}", outbound.tag, e))
                })?;
            }

            if outbound.kind.is_group() {
                self.validate_group(outbound)?;
            }
        }

        Ok(())
    }

    fn validate_group(&self, group: &OutboundConfig) -> Result<()> {
        if group.outbounds.is_empty() {
            return Err(CoreError::Parse(format!(
                "group '{}' has no members",
                group.tag
            )));
        }

        for member in &group.outbounds {
            if member == &group.tag {
                return Err(CoreError::Parse(format!(
                    "group '{}' cannot contain itself",
                    group.tag
                )));
            }
            if self.find(member).is_none() {
                return Err(CoreError::Parse(format!(
                    "group '{}' references unknown outbound '{}'",
                    group.tag, member
                )));
            }
        }

        if let Some(default) = &group.default {
            if !group.outbounds.contains(default) {
                return Err(CoreError::Parse(format!(
                    "default '{}' of group '{}' is not a member",
                    default, group.tag
                )));
            }
        }

        Ok(())
    }

    /// Normalize a validated profile: add the built-in direct and block
    /// outbounds, build `select`/`auto` groups when the profile has proxies
    /// but no groups, and pin every selector to a default member.
    pub fn normalize(&mut self) {
        let proxies: Vec<String> = self
            .outbounds
            .iter()
            .filter(|o| o.kind.is_proxy())
            .map(|o| o.tag.clone())
            .collect();

        let tags_free = self.find(SELECT_TAG).is_none() && self.find(AUTO_TAG).is_none();
        if self.groups().next().is_none() && !proxies.is_empty() && tags_free {
            debug!("Profile has {} proxies and no groups, adding defaults", proxies.len());
            let mut members = vec![AUTO_TAG.to_string()];
            members.extend(proxies.iter().cloned());
            self.outbounds.insert(
                0,
                OutboundConfig::group(OutboundKind::Urltest, AUTO_TAG, proxies),
            );
            self.outbounds.insert(
                0,
                OutboundConfig::group(OutboundKind::Selector, SELECT_TAG, members),
            );
        }

        if self.find(DIRECT_TAG).is_none() {
            self.outbounds.push(OutboundConfig::new(OutboundKind::Direct, DIRECT_TAG));
        }
        if self.find(BLOCK_TAG).is_none() {
            self.outbounds.push(OutboundConfig::new(OutboundKind::Block, BLOCK_TAG));
        }

        for outbound in &mut self.outbounds {
            if outbound.kind == OutboundKind::Selector && outbound.default.is_none() {
                outbound.default = outbound.outbounds.first().cloned();
            }
        }
    }

    /// Serialize as pretty JSON
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::Serialization(format!("Failed to serialize profile: {}", e)))
    }

    /// Render the full runnable configuration from this profile
    pub fn generate(&self, settings: &CoreSettings) -> Result<Value> {
        let mut profile = self.clone();
        profile.validate().map_err(|e| CoreError::Generate(e.to_string()))?;
        profile.normalize();

        let final_tag = profile
            .groups()
            .next()
            .map(|g| g.tag.clone())
            .unwrap_or_else(|| profile.outbounds[0].tag.clone());

        let mut rules = vec![
            json!({ "clash_mode": "direct", "outbound": DIRECT_TAG }),
            json!({ "clash_mode": "global", "outbound": final_tag }),
        ];
        if settings.block_ads {
            rules.push(json!({ "rule_set": ["geosite-category-ads-all"], "outbound": BLOCK_TAG }));
        }
        if settings.region != "other" {
            rules.push(json!({
                "rule_set": [format!("geoip-{}", settings.region)],
                "outbound": DIRECT_TAG,
            }));
        }

        let outbounds = serde_json::to_value(&profile.outbounds)
            .map_err(|e| CoreError::Generate(e.to_string()))?;

        Ok(json!({
            "log": { "level": settings.log_level, "timestamp": true },
            "inbounds": [{
                "type": "mixed",
                "tag": "mixed-in",
                "listen": "127.0.0.1",
                "listen_port": settings.mixed_port,
            }],
            "outbounds": outbounds,
            "route": { "rules": rules, "final": final_tag },
            "experimental": {
                "clash_api": { "default_mode": clash_mode_name(settings.clash_mode) },
            },
        }))
    }
}

fn clash_mode_name(mode: ClashMode) -> &'static str {
    match mode {
        ClashMode::Rule => "rule",
        ClashMode::Global => "global",
        ClashMode::Direct => "direct",
    }
}
