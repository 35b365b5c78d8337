//! Engine lifecycle controller
//!
//! [`Controller`] owns the single engine slot, the state registry, the
//! command clients and the host-facing services started by `setup`. Every
//! state transition happens while holding the slot lock; slow work (engine
//! construction, engine close, reachability probes) runs outside of it and
//! relies on the intermediate `Starting`/`Stopping` states to turn
//! contenders away.

mod boundary;
mod command;
mod lifecycle;
mod outbound;
pub(crate) mod task;
mod warp;

pub use boundary::Operation;
pub use command::CommandKind;
pub use warp::{
    WarpAccount, WarpConfigResponse, WarpProvisioner, WarpRegistration, WarpRequest,
    WarpWireguardConfig,
};

use crate::config::{ControllerOptions, CoreSettings, Profile, SetupParameters};
use crate::engine::{Engine, EngineFactory, ProfileEngineFactory};
use crate::error::{CoreError, Result};
use crate::security::KeyStore;
use crate::state::{CoreStatus, StateRegistry};
use command::CommandManager;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, RwLock, Weak};
use task::TaskHandle;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

/// The engine slot: at most one live engine plus the selections made on it
#[derive(Default)]
pub(crate) struct EngineSlot {
    engine: Option<Arc<dyn Engine>>,
    /// Bumped whenever the held engine changes; identifies the instance
    generation: u64,
    /// Bumped when a start is accepted and when close cancels it
    start_epoch: u64,
    /// A stop is closing the held engine outside the lock
    closing: bool,
    selections: HashMap<String, String>,
}

impl EngineSlot {
    fn bind(&mut self, engine: Arc<dyn Engine>) {
        self.selections = engine
            .groups()
            .into_iter()
            .filter_map(|g| g.selected.map(|s| (g.tag, s)))
            .collect();
        self.engine = Some(engine);
        self.generation += 1;
    }

    /// Accept a start; the returned epoch must still match when it binds
    fn begin_start(&mut self) -> u64 {
        self.start_epoch += 1;
        self.start_epoch
    }

    fn clear(&mut self) -> Option<Arc<dyn Engine>> {
        self.selections.clear();
        self.generation += 1;
        self.engine.take()
    }
}

/// Services started by `setup`
#[derive(Default)]
struct Services {
    notifier: Option<TaskHandle>,
    control: Option<(SocketAddr, TaskHandle)>,
}

pub(crate) struct Inner {
    registry: StateRegistry,
    slot: Mutex<EngineSlot>,
    factory: Arc<dyn EngineFactory>,
    options: ControllerOptions,
    settings: RwLock<CoreSettings>,
    setup: RwLock<Option<SetupParameters>>,
    keys: KeyStore,
    commands: CommandManager,
    services: Mutex<Services>,
    warp: Option<Arc<dyn WarpProvisioner>>,
}

/// Handle to the controller. Clones share the same engine slot.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

/// Non-owning handle used by long-running feeds
#[derive(Clone)]
pub(crate) struct WeakController {
    inner: Weak<Inner>,
}

impl WeakController {
    pub(crate) fn upgrade(&self) -> Option<Controller> {
        self.inner.upgrade().map(|inner| Controller { inner })
    }
}

/// Builder for [`Controller`]
pub struct ControllerBuilder {
    factory: Arc<dyn EngineFactory>,
    options: ControllerOptions,
    settings: CoreSettings,
    warp: Option<Arc<dyn WarpProvisioner>>,
}

impl ControllerBuilder {
    /// Engine factory used by `start`
    pub fn engine_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Controller tuning
    pub fn options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    /// Initial settings
    pub fn settings(mut self, settings: CoreSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Collaborator used by Warp config generation
    pub fn warp_provisioner(mut self, provisioner: Arc<dyn WarpProvisioner>) -> Self {
        self.warp = Some(provisioner);
        self
    }

    /// Build the controller
    pub fn build(self) -> Controller {
        Controller {
            inner: Arc::new(Inner {
                registry: StateRegistry::new(),
                slot: Mutex::new(EngineSlot::default()),
                factory: self.factory,
                options: self.options,
                settings: RwLock::new(self.settings),
                setup: RwLock::new(None),
                keys: KeyStore::new(),
                commands: CommandManager::new(),
                services: Mutex::new(Services::default()),
                warp: self.warp,
            }),
        }
    }
}

impl Controller {
    /// Start building a controller backed by [`ProfileEngineFactory`]
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder {
            factory: Arc::new(ProfileEngineFactory),
            options: ControllerOptions::default(),
            settings: CoreSettings::default(),
            warp: None,
        }
    }

    /// Controller with a custom engine factory and default tuning
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self::builder().engine_factory(factory).build()
    }

    pub(crate) fn downgrade(&self) -> WeakController {
        WeakController {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Current status snapshot
    pub fn status(&self) -> CoreStatus {
        self.inner.registry.snapshot()
    }

    /// Subscribe to status updates
    pub fn subscribe(&self) -> watch::Receiver<CoreStatus> {
        self.inner.registry.subscribe()
    }

    /// Settings currently in effect
    pub fn settings(&self) -> CoreSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Parameters of the last successful `setup`
    pub fn setup_parameters(&self) -> Option<SetupParameters> {
        self.inner
            .setup
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Controller tuning
    pub fn options(&self) -> &ControllerOptions {
        &self.inner.options
    }

    /// Server key pair and registered client keys
    pub fn keys(&self) -> &KeyStore {
        &self.inner.keys
    }

    /// Address the control server is bound to, if running
    pub async fn control_server_addr(&self) -> Option<SocketAddr> {
        self.inner
            .services
            .lock()
            .await
            .control
            .as_ref()
            .map(|(addr, _)| *addr)
    }

    /// Validate and normalize a profile, writing the result to `config_path`.
    /// The profile is read from `temp_path` when given, else from
    /// `config_path`. Returns the rewritten text.
    pub async fn parse(&self, config_path: &Path, temp_path: Option<&Path>) -> Result<String> {
        let source = match temp_path {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => config_path,
        };
        debug!("Parsing profile {:?} into {:?}", source, config_path);

        let content = tokio::fs::read_to_string(source)
            .await
            .map_err(|e| CoreError::Parse(format!("Failed to read {:?}: {}", source, e)))?;
        let mut profile = Profile::parse(&content)?;
        profile.validate()?;
        profile.normalize();

        let rewritten = profile
            .to_json_pretty()
            .map_err(|e| CoreError::Parse(e.to_string()))?;
        tokio::fs::write(config_path, &rewritten)
            .await
            .map_err(|e| CoreError::Parse(format!("Failed to write {:?}: {}", config_path, e)))?;

        info!(
            "Parsed profile {:?} ({} outbounds)",
            config_path,
            profile.outbounds.len()
        );
        Ok(rewritten)
    }

    /// Replace the settings document
    pub fn change_settings(&self, json: &str) -> Result<CoreSettings> {
        let settings = CoreSettings::from_json(json)?;
        settings.validate()?;
        *self.inner.settings.write().unwrap_or_else(|e| e.into_inner()) = settings.clone();
        info!(
            "Settings updated (log level {:?}, clash mode {:?})",
            settings.log_level, settings.clash_mode
        );
        Ok(settings)
    }

    /// Render the full runnable configuration for the profile at `path`
    pub async fn generate_config(&self, path: &Path) -> Result<String> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CoreError::Generate(format!("Failed to read {:?}: {}", path, e)))?;
        let profile = Profile::parse(&content).map_err(|e| CoreError::Generate(e.to_string()))?;
        let config = profile.generate(&self.settings())?;
        serde_json::to_string_pretty(&config).map_err(|e| CoreError::Generate(e.to_string()))
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::builder().build()
    }
}
