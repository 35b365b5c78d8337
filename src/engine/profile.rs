//! Profile-backed engine
//!
//! Runs the outbound topology of a JSON profile. Selections live inside the
//! engine; reachability probes dial each member's server with a TCP connect
//! and report the connect latency.

use crate::config::{OutboundConfig, OutboundKind, Profile};
use crate::engine::{
    Engine, EngineFactory, EngineOptions, OutboundGroup, ProbeOptions, UrlTestResult,
};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info};

/// Nested groups are followed at most this deep when resolving a probe target
const MAX_GROUP_DEPTH: usize = 4;

/// Engine running a normalized profile
pub struct ProfileEngine {
    profile: Profile,
    selections: Mutex<HashMap<String, String>>,
    memory_limit: AtomicBool,
    closed: AtomicBool,
}

impl ProfileEngine {
    /// Build an engine from a profile
    pub fn new(mut profile: Profile) -> Result<Self> {
        profile.validate()?;
        profile.normalize();

        let selections = profile
            .groups()
            .filter_map(|g| {
                g.default
                    .clone()
                    .or_else(|| g.outbounds.first().cloned())
                    .map(|selected| (g.tag.clone(), selected))
            })
            .collect();

        Ok(Self {
            profile,
            selections: Mutex::new(selections),
            memory_limit: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether the memory limiter is enabled
    pub fn memory_limit_enabled(&self) -> bool {
        self.memory_limit.load(Ordering::SeqCst)
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::Unexpected("engine is closed".to_string()));
        }
        Ok(())
    }

    fn selected(&self, group: &str) -> Option<String> {
        self.selections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(group)
            .cloned()
    }

    fn find_group(&self, tag: &str) -> Result<&OutboundConfig> {
        self.profile
            .find(tag)
            .filter(|o| o.kind.is_group())
            .ok_or_else(|| CoreError::GroupNotFound(tag.to_string()))
    }

    /// Resolve the `host:port` a probe of `tag` should dial
    fn probe_target(&self, tag: &str, probe: &ProbeOptions, depth: usize) -> Result<String> {
        let outbound = self
            .profile
            .find(tag)
            .ok_or_else(|| CoreError::OutboundNotFound(tag.to_string()))?;

        match outbound.kind {
            OutboundKind::Block => Err(CoreError::Unexpected("outbound blocks traffic".to_string())),
            OutboundKind::Direct => url_authority(&probe.url),
            kind if kind.is_group() => {
                if depth >= MAX_GROUP_DEPTH {
                    return Err(CoreError::Unexpected(format!(
                        "group nesting deeper than {}",
                        MAX_GROUP_DEPTH
                    )));
                }
                let selected = self.selected(tag).ok_or_else(|| {
                    CoreError::Unexpected(format!("group '{}' has no selection", tag))
                })?;
                self.probe_target(&selected, probe, depth + 1)
            }
            _ => outbound.endpoint().ok_or_else(|| {
                CoreError::Unexpected(format!("outbound '{}' has no endpoint", tag))
            }),
        }
    }

    async fn probe(&self, tag: &str, probe: &ProbeOptions) -> UrlTestResult {
        let target = match self.probe_target(tag, probe, 0) {
            Ok(target) => target,
            Err(e) => return UrlTestResult::unreachable(tag, e.to_string()),
        };

        let started = Instant::now();
        match time::timeout(probe.timeout, TcpStream::connect(&target)).await {
            Ok(Ok(_stream)) => {
                let delay = started.elapsed();
                debug!("Probe {} via {} took {:?}", tag, target, delay);
                UrlTestResult::reachable(tag, delay)
            }
            Ok(Err(e)) => UrlTestResult::unreachable(tag, e.to_string()),
            Err(_) => UrlTestResult::unreachable(tag, "timeout"),
        }
    }
}

#[async_trait]
impl Engine for ProfileEngine {
    fn groups(&self) -> Vec<OutboundGroup> {
        self.profile
            .groups()
            .map(|g| OutboundGroup {
                tag: g.tag.clone(),
                kind: g.kind,
                members: g.outbounds.clone(),
                selected: self.selected(&g.tag),
            })
            .collect()
    }

    fn select_outbound(&self, group: &str, outbound: &str) -> Result<()> {
        self.ensure_open()?;
        let config = self.find_group(group)?;
        if !config.outbounds.iter().any(|m| m == outbound) {
            return Err(CoreError::OutboundNotFound(outbound.to_string()));
        }

        self.selections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(group.to_string(), outbound.to_string());
        info!("Group '{}' now uses '{}'", group, outbound);
        Ok(())
    }

    async fn url_test(&self, group: &str, probe: &ProbeOptions) -> Result<Vec<UrlTestResult>> {
        self.ensure_open()?;
        let members = self.find_group(group)?.outbounds.clone();
        debug!("Probing {} members of group '{}'", members.len(), group);

        let results = join_all(members.iter().map(|m| self.probe(m, probe))).await;
        Ok(results)
    }

    fn set_memory_limit(&self, enabled: bool) {
        self.memory_limit.store(enabled, Ordering::SeqCst);
        debug!("Engine memory limit enabled: {}", enabled);
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Unexpected("engine already closed".to_string()));
        }
        info!("Engine closed");
        Ok(())
    }
}

/// Builds [`ProfileEngine`]s from profile files
#[derive(Debug, Default, Clone)]
pub struct ProfileEngineFactory;

#[async_trait]
impl EngineFactory for ProfileEngineFactory {
    async fn create(&self, options: EngineOptions) -> Result<Arc<dyn Engine>> {
        let content = tokio::fs::read_to_string(&options.config_path)
            .await
            .map_err(|e| {
                CoreError::Config(format!(
                    "Failed to read profile {:?}: {}",
                    options.config_path, e
                ))
            })?;

        let engine = ProfileEngine::new(Profile::parse(&content)?)?;
        engine.set_memory_limit(!options.disable_memory_limit);
        info!(
            "Engine built from {:?} with {} outbounds",
            options.config_path,
            engine.profile.outbounds.len()
        );
        Ok(Arc::new(engine))
    }
}

/// `host:port` of an http(s) URL
fn url_authority(url: &str) -> Result<String> {
    let (rest, default_port) = if let Some(rest) = url.strip_prefix("https://") {
        (rest, 443)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (rest, 80)
    } else {
        return Err(CoreError::Config(format!("unsupported probe URL: {}", url)));
    };

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if authority.is_empty() {
        return Err(CoreError::Config(format!("probe URL has no host: {}", url)));
    }

    let has_port = match authority.rfind(':') {
        Some(idx) => authority[idx + 1..].chars().all(|c| c.is_ascii_digit()) && !authority.ends_with(']'),
        None => false,
    };
    if has_port {
        Ok(authority.to_string())
    } else {
        Ok(format!("{}:{}", authority, default_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn profile_with(server_port: u16) -> Profile {
        Profile::parse(&format!(
            r#"{{"outbounds": [
                {{"type": "selector", "tag": "proxy", "outbounds": ["local", "dead", "block"]}},
                {{"type": "socks", "tag": "local", "server": "127.0.0.1", "server_port": {}}},
                {{"type": "http", "tag": "dead", "server": "127.0.0.1", "server_port": 9}},
                {{"type": "block", "tag": "block"}}
            ]}}"#,
            server_port
        ))
        .unwrap()
    }

    fn probe() -> ProbeOptions {
        ProbeOptions {
            url: "http://127.0.0.1/".to_string(),
            timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_url_authority() {
        assert_eq!(url_authority("http://cp.cloudflare.com/").unwrap(), "cp.cloudflare.com:80");
        assert_eq!(url_authority("https://example.com/x?y").unwrap(), "example.com:443");
        assert_eq!(url_authority("http://example.com:8080").unwrap(), "example.com:8080");
        assert_eq!(url_authority("http://[::1]/").unwrap(), "[::1]:80");
        assert!(url_authority("ftp://example.com").is_err());
    }

    #[test]
    fn test_initial_selection_is_first_member() {
        let engine = ProfileEngine::new(profile_with(1080)).unwrap();
        let groups = engine.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].selected.as_deref(), Some("local"));
    }

    #[test]
    fn test_select_outbound() {
        let engine = ProfileEngine::new(profile_with(1080)).unwrap();
        engine.select_outbound("proxy", "dead").unwrap();
        assert_eq!(engine.groups()[0].selected.as_deref(), Some("dead"));

        assert!(matches!(
            engine.select_outbound("nope", "dead"),
            Err(CoreError::GroupNotFound(_))
        ));
        assert!(matches!(
            engine.select_outbound("proxy", "ghost"),
            Err(CoreError::OutboundNotFound(_))
        ));
        assert!(matches!(
            engine.select_outbound("local", "dead"),
            Err(CoreError::GroupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_url_test_reports_each_member() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let engine = ProfileEngine::new(profile_with(port)).unwrap();

        let results = engine.url_test("proxy", &probe()).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].tag, "local");
        assert!(results[0].is_reachable());
        assert_eq!(results[2].tag, "block");
        assert!(!results[2].is_reachable());

        // Probing leaves the selection alone
        assert_eq!(engine.groups()[0].selected.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn test_close_twice_fails() {
        let engine = ProfileEngine::new(profile_with(1080)).unwrap();
        engine.close().await.unwrap();
        assert!(engine.is_closed());
        assert!(engine.close().await.is_err());
        assert!(engine.url_test("proxy", &probe()).await.is_err());
    }

    #[tokio::test]
    async fn test_factory_reads_profile() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("profile.json");
        std::fs::write(
            &path,
            r#"{"outbounds": [{"type": "vless", "tag": "a", "server": "a.example.com", "server_port": 443}]}"#,
        )
        .unwrap();

        let engine = ProfileEngineFactory
            .create(EngineOptions {
                config_path: path,
                disable_memory_limit: true,
                settings: Default::default(),
            })
            .await
            .unwrap();

        let tags: Vec<String> = engine.groups().into_iter().map(|g| g.tag).collect();
        assert_eq!(tags, vec!["select", "auto"]);
    }

    #[tokio::test]
    async fn test_factory_missing_file() {
        let result = ProfileEngineFactory
            .create(EngineOptions {
                config_path: "/nonexistent/profile.json".into(),
                disable_memory_limit: false,
                settings: Default::default(),
            })
            .await;
        assert!(matches!(result, Err(CoreError::Config(_))));
    }
}
