//! Outbound selection and reachability probes

use crate::controller::Controller;
use crate::engine::{Engine, OutboundGroup, ProbeOptions, UrlTestResult};
use crate::error::{CoreError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

/// Slack added on top of the per-probe timeout for a whole group test
const URL_TEST_SLACK: Duration = Duration::from_secs(1);

impl Controller {
    /// The running engine and its instance number
    async fn running_engine(&self) -> Result<(Arc<dyn Engine>, u64)> {
        let slot = self.inner.slot.lock().await;
        if !self.inner.registry.state().is_running() {
            return Err(CoreError::InstanceNotStarted);
        }
        let engine = slot.engine.clone().ok_or(CoreError::InstanceNotFound)?;
        Ok((engine, slot.generation))
    }

    /// Outbound groups of the running engine; empty when nothing runs
    pub async fn groups(&self) -> Vec<OutboundGroup> {
        let slot = self.inner.slot.lock().await;
        let Some(engine) = slot.engine.as_ref() else {
            return Vec::new();
        };

        engine
            .groups()
            .into_iter()
            .map(|mut group| {
                if let Some(selected) = slot.selections.get(&group.tag) {
                    group.selected = Some(selected.clone());
                }
                group
            })
            .collect()
    }

    /// Make `outbound` the active member of `group`. Returns the active tag.
    pub async fn select_outbound(&self, group: &str, outbound: &str) -> Result<String> {
        let (engine, generation) = self.running_engine().await?;

        let target = engine
            .groups()
            .into_iter()
            .find(|g| g.tag == group)
            .ok_or_else(|| CoreError::GroupNotFound(group.to_string()))?;
        if !target.contains(outbound) {
            return Err(CoreError::OutboundNotFound(outbound.to_string()));
        }

        let mut slot = self.inner.slot.lock().await;
        if slot.generation != generation || !self.inner.registry.state().is_running() {
            warn!("Engine changed while selecting '{}' in '{}'", outbound, group);
            return Err(CoreError::InstanceNotFound);
        }
        engine.select_outbound(group, outbound)?;
        slot.selections
            .insert(group.to_string(), outbound.to_string());

        info!("Selected '{}' in group '{}'", outbound, group);
        Ok(outbound.to_string())
    }

    /// Probe every member of `group`. The selection is left alone.
    pub async fn url_test(&self, group: &str) -> Result<Vec<UrlTestResult>> {
        let (engine, generation) = self.running_engine().await?;
        if !engine.groups().iter().any(|g| g.tag == group) {
            return Err(CoreError::GroupNotFound(group.to_string()));
        }

        let probe = ProbeOptions::from_settings(&self.settings());
        let bound = probe.timeout + URL_TEST_SLACK;
        debug!("URL test of group '{}' bounded by {:?}", group, bound);

        let results = time::timeout(bound, engine.url_test(group, &probe))
            .await
            .map_err(|_| CoreError::Timeout(format!("URL test of group '{}'", group)))??;

        let slot = self.inner.slot.lock().await;
        if slot.generation != generation || !self.inner.registry.state().is_running() {
            warn!("Engine changed while probing group '{}'", group);
            return Err(CoreError::InstanceNotFound);
        }

        let reachable = results.iter().filter(|r| r.is_reachable()).count();
        info!(
            "URL test of group '{}': {}/{} reachable",
            group,
            reachable,
            results.len()
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SetupMode, StartRequest};
    use crate::controller::testing::MockFactory;
    use crate::state::CoreState;

    fn request() -> StartRequest {
        StartRequest {
            config_path: "profile.json".into(),
            enable_old_command_server: false,
            disable_memory_limit: false,
        }
    }

    async fn started() -> (Controller, Arc<MockFactory>) {
        let factory = MockFactory::scripted(&[]);
        let controller = Controller::new(factory.clone());
        controller.start(request()).await.unwrap();
        (controller, factory)
    }

    #[tokio::test]
    async fn test_requires_started() {
        let controller = Controller::new(MockFactory::scripted(&[]));
        assert!(matches!(
            controller.select_outbound("proxy", "b").await,
            Err(CoreError::InstanceNotStarted)
        ));
        assert!(matches!(
            controller.url_test("proxy").await,
            Err(CoreError::InstanceNotStarted)
        ));
        assert!(controller.groups().await.is_empty());
    }

    #[tokio::test]
    async fn test_select_outbound() {
        let (controller, _factory) = started().await;

        assert_eq!(controller.select_outbound("proxy", "b").await.unwrap(), "b");
        let groups = controller.groups().await;
        assert_eq!(groups[0].selected.as_deref(), Some("b"));

        assert!(matches!(
            controller.select_outbound("nope", "b").await,
            Err(CoreError::GroupNotFound(_))
        ));
        assert!(matches!(
            controller.select_outbound("proxy", "zz").await,
            Err(CoreError::OutboundNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_selection_cleared_on_stop() {
        let (controller, _factory) = started().await;
        controller.select_outbound("proxy", "b").await.unwrap();
        controller.stop().await.unwrap();
        assert!(controller.inner.slot.lock().await.selections.is_empty());

        assert!(matches!(
            controller.select_outbound("proxy", "a").await,
            Err(CoreError::InstanceNotStarted)
        ));
    }

    #[tokio::test]
    async fn test_url_test_results() {
        let (controller, _factory) = started().await;
        controller.select_outbound("proxy", "b").await.unwrap();

        let results = controller.url_test("proxy").await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_reachable());
        assert!(!results[1].is_reachable());
        // Probing does not move the selection
        assert_eq!(controller.groups().await[0].selected.as_deref(), Some("b"));

        assert!(matches!(
            controller.url_test("nope").await,
            Err(CoreError::GroupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_url_test_sees_engine_replaced() {
        let (controller, factory) = started().await;
        *factory.engine(0).probe_delay.lock().unwrap() = Duration::from_millis(300);

        let probing = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.url_test("proxy").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.restart(request()).await.unwrap();

        assert!(matches!(
            probing.await.unwrap(),
            Err(CoreError::InstanceNotFound)
        ));
        assert_eq!(controller.status().core_state, CoreState::Started);
    }

    #[tokio::test]
    async fn test_url_test_sees_engine_stopped() {
        let (controller, factory) = started().await;
        *factory.engine(0).probe_delay.lock().unwrap() = Duration::from_millis(300);

        let probing = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.url_test("proxy").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.close(SetupMode::Embedded).await.unwrap();

        assert!(matches!(
            probing.await.unwrap(),
            Err(CoreError::InstanceNotFound)
        ));
    }
}
