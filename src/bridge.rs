//! Host bridge
//!
//! The flat surface a host application calls into. Arguments arrive as
//! plain strings, integers and byte slices; every fallible operation answers
//! with an empty string on success or a human-readable message on failure.
//! Each call runs inside the controller's fault boundary, so a panic never
//! crosses into the host.

use crate::config::{SetupMode, SetupParameters, StartRequest};
use crate::controller::{Controller, Operation, WarpRequest};
use crate::engine::UrlTestResult;
use crate::error::{CoreError, Result};
use crate::state::CoreStatus;
use std::path::{Path, PathBuf};
use tracing::error;

/// Arguments of [`Bridge::setup`]
#[derive(Debug, Clone, Default)]
pub struct SetupRequest {
    /// Base directory of the host installation
    pub base_path: String,
    /// Working directory
    pub working_dir: String,
    /// Temporary directory
    pub temp_dir: String,
    /// Host status channel port (`<= 0` disables status pushes)
    pub status_port: i64,
    /// Enable debug logging
    pub debug: bool,
    /// Setup mode code
    pub mode: i32,
    /// Control server listen address
    pub listen: String,
    /// Control server secret
    pub secret: String,
}

/// Host-facing wrapper around a [`Controller`]
#[derive(Clone)]
pub struct Bridge {
    controller: Controller,
}

fn outcome(operation: Operation, result: Result<()>) -> String {
    match result {
        Ok(()) => String::new(),
        Err(e) => {
            error!("{} failed: {}", operation, e);
            e.to_string()
        }
    }
}

fn payload<T>(operation: Operation, result: Result<T>) -> std::result::Result<T, String> {
    result.map_err(|e| {
        error!("{} failed: {}", operation, e);
        e.to_string()
    })
}

impl Bridge {
    /// Wrap a controller
    pub fn new(controller: Controller) -> Self {
        Self { controller }
    }

    /// The wrapped controller
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Current status snapshot
    pub fn status(&self) -> CoreStatus {
        self.controller.status()
    }

    /// One-time process initialization
    pub async fn setup(&self, request: SetupRequest) -> String {
        let controller = &self.controller;
        let result = controller
            .guard(Operation::Setup, async {
                let mode = SetupMode::try_from(request.mode)?;
                controller
                    .setup(SetupParameters {
                        base_path: PathBuf::from(request.base_path),
                        working_dir: PathBuf::from(request.working_dir),
                        temp_dir: PathBuf::from(request.temp_dir),
                        status_port: request.status_port,
                        debug: request.debug,
                        mode,
                        listen: request.listen,
                        secret: request.secret,
                    })
                    .await
            })
            .await;
        outcome(Operation::Setup, result)
    }

    /// Validate and normalize a profile into `config_path`. `temp_path` may
    /// be empty.
    pub async fn parse(&self, config_path: &str, temp_path: &str) -> String {
        let temp = (!temp_path.is_empty()).then(|| Path::new(temp_path));
        let result = self
            .controller
            .guard(
                Operation::Parse,
                self.controller.parse(Path::new(config_path), temp),
            )
            .await
            .map(|_| ());
        outcome(Operation::Parse, result)
    }

    /// Replace the settings document
    pub async fn change_settings(&self, settings_json: &str) -> String {
        let result = self
            .controller
            .guard(Operation::ChangeSettings, async {
                self.controller.change_settings(settings_json).map(|_| ())
            })
            .await;
        outcome(Operation::ChangeSettings, result)
    }

    /// Render the full configuration for the profile at `path`
    pub async fn generate_config(&self, path: &str) -> std::result::Result<String, String> {
        let result = self
            .controller
            .guard(
                Operation::GenerateConfig,
                self.controller.generate_config(Path::new(path)),
            )
            .await;
        payload(Operation::GenerateConfig, result)
    }

    /// Start the engine
    pub async fn start(&self, config_path: &str, disable_memory_limit: bool) -> String {
        let request = StartRequest::new(config_path, disable_memory_limit);
        let result = self
            .controller
            .guard(Operation::Start, self.controller.start(request))
            .await
            .map(|_| ());
        outcome(Operation::Start, result)
    }

    /// Stop the engine
    pub async fn stop(&self) -> String {
        let result = self
            .controller
            .guard(Operation::Stop, self.controller.stop())
            .await
            .map(|_| ());
        outcome(Operation::Stop, result)
    }

    /// Restart the engine
    pub async fn restart(&self, config_path: &str, disable_memory_limit: bool) -> String {
        let request = StartRequest::new(config_path, disable_memory_limit);
        let result = self
            .controller
            .guard(Operation::Restart, self.controller.restart(request))
            .await
            .map(|_| ());
        outcome(Operation::Restart, result)
    }

    /// Attach a command client
    pub async fn start_command_client(&self, command: i32, port: i64) -> String {
        let result = self
            .controller
            .guard(
                Operation::StartCommand,
                self.controller.start_command(command, port),
            )
            .await;
        outcome(Operation::StartCommand, result)
    }

    /// Detach a command client
    pub async fn stop_command_client(&self, command: i32) -> String {
        let result = self
            .controller
            .guard(Operation::StopCommand, self.controller.stop_command(command))
            .await;
        outcome(Operation::StopCommand, result)
    }

    /// Change the active member of a group
    pub async fn select_outbound(&self, group_tag: &str, outbound_tag: &str) -> String {
        let result = self
            .controller
            .guard(
                Operation::SelectOutbound,
                self.controller.select_outbound(group_tag, outbound_tag),
            )
            .await
            .map(|_| ());
        outcome(Operation::SelectOutbound, result)
    }

    /// Probe every member of a group
    pub async fn url_test(&self, group_tag: &str) -> std::result::Result<Vec<UrlTestResult>, String> {
        let result = self
            .controller
            .guard(Operation::UrlTest, self.controller.url_test(group_tag))
            .await;
        payload(Operation::UrlTest, result)
    }

    /// Register a Warp device. Returns the reply as JSON, or `error: <msg>`.
    pub async fn generate_warp_config(
        &self,
        license_key: &str,
        account_id: &str,
        access_token: &str,
    ) -> String {
        let request = WarpRequest {
            license_key: license_key.to_string(),
            account_id: account_id.to_string(),
            access_token: access_token.to_string(),
        };
        let result = self
            .controller
            .guard(Operation::GenerateWarpConfig, async {
                let response = self.controller.generate_warp_config(request).await?;
                serde_json::to_string(&response).map_err(CoreError::from)
            })
            .await;

        match payload(Operation::GenerateWarpConfig, result) {
            Ok(json) => json,
            Err(message) => format!("error: {}", message),
        }
    }

    /// The 32-byte server public key
    pub fn get_server_public_key(&self) -> Vec<u8> {
        self.controller.keys().server_public_key().as_bytes().to_vec()
    }

    /// Register a 32-byte client public key
    pub async fn add_client_public_key(&self, key: &[u8]) -> String {
        let result = self
            .controller
            .guard(Operation::AddClientPublicKey, async {
                self.controller.keys().add_client_key(key).map(|_| ())
            })
            .await;
        outcome(Operation::AddClientPublicKey, result)
    }

    /// Tear everything down
    pub async fn close(&self, mode: i32) {
        let controller = &self.controller;
        let result = controller
            .guard(Operation::Close, async {
                let mode = SetupMode::try_from(mode).unwrap_or(SetupMode::Embedded);
                controller.close(mode).await
            })
            .await;
        if let Err(e) = result {
            error!("close failed: {}", e);
        }
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(Controller::default())
    }
}
