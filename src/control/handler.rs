//! Command handler for control API
//!
//! This module authenticates control requests and dispatches them to the
//! controller. Every action runs inside the controller's fault boundary.

use crate::config::{SetupParameters, StartRequest};
use crate::control::api::{CommandParams, SelectParams, StartParams, UrlTestParams};
use crate::control::{ApiError, ApiRequest, ApiResponse, ControlAction};
use crate::controller::{Controller, Operation};
use crate::security::{PublicKey, SecurityEvent};
use serde_json::json;
use tracing::{debug, error, info};

/// Who may talk to the control server
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    /// Required shared secret
    secret: Option<String>,
    /// Require a registered client key once any key is registered
    check_client_keys: bool,
}

impl AuthPolicy {
    /// Accept every request
    pub fn open() -> Self {
        Self::default()
    }

    /// Require `secret` and, once keys are registered, a registered client key
    pub fn secured(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            check_client_keys: true,
        }
    }

    /// Policy matching the setup mode
    pub fn from_setup(params: &SetupParameters) -> Self {
        if params.mode.requires_secret() {
            Self::secured(params.secret.clone())
        } else {
            Self::open()
        }
    }
}

/// Compare without short-circuiting on the first differing byte
fn secrets_match(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Command handler executes API commands against the controller
pub struct CommandHandler {
    controller: Controller,
    auth: AuthPolicy,
}

impl CommandHandler {
    /// Create a new command handler
    pub fn new(controller: Controller, auth: AuthPolicy) -> Self {
        Self { controller, auth }
    }

    fn authenticate(&self, request: &ApiRequest) -> Result<(), String> {
        if let Some(expected) = &self.auth.secret {
            match request.secret.as_deref() {
                Some(given) if secrets_match(given, expected) => {}
                Some(_) => return Err("invalid secret".to_string()),
                None => return Err("missing secret".to_string()),
            }
        }

        let keys = self.controller.keys();
        if self.auth.check_client_keys && keys.has_client_keys() {
            let encoded = request
                .client_key
                .as_deref()
                .ok_or_else(|| "missing client key".to_string())?;
            let key = PublicKey::from_base64(encoded).map_err(|e| e.to_string())?;
            if !keys.is_authorized(&key) {
                return Err(format!("client key {} is not registered", key));
            }
        }
        Ok(())
    }

    /// Handle an API request
    pub async fn handle_request(&self, request: ApiRequest) -> ApiResponse {
        debug!("Handling request {}: {:?}", request.id, request.action);

        let auth = self.authenticate(&request);
        if self.auth.secret.is_some() {
            SecurityEvent::AuthenticationAttempt {
                success: auth.is_ok(),
                reason: auth.as_ref().err().cloned(),
            }
            .log();
        }
        if auth.is_err() {
            return ApiResponse::error(request.id, ApiError::AuthenticationFailed);
        }

        let result = match request.action {
            ControlAction::Status => self.handle_status().await,
            ControlAction::Start => self.handle_start(&request, false).await,
            ControlAction::Restart => self.handle_start(&request, true).await,
            ControlAction::Stop => self.handle_stop().await,
            ControlAction::SelectOutbound => self.handle_select(&request).await,
            ControlAction::UrlTest => self.handle_url_test(&request).await,
            ControlAction::Groups => self.handle_groups().await,
            ControlAction::StartCommand => self.handle_start_command(&request).await,
            ControlAction::StopCommand => self.handle_stop_command(&request).await,
        };

        match result {
            Ok(data) => {
                info!(
                    "Request {} completed successfully: {:?}",
                    request.id, request.action
                );
                ApiResponse::success(request.id, data)
            }
            Err(e) => {
                error!("Request {} failed: {}", request.id, e);
                ApiResponse::error(request.id, e)
            }
        }
    }

    async fn handle_status(&self) -> Result<Option<serde_json::Value>, ApiError> {
        let status = self.controller.status();
        let groups = self.controller.groups().await;
        let commands: Vec<_> = self
            .controller
            .active_commands()
            .await
            .into_iter()
            .map(|(kind, port)| json!({ "kind": kind, "port": port }))
            .collect();

        Ok(Some(json!({
            "core_state": status.core_state,
            "message_type": status.message_type,
            "message": status.message,
            "groups": groups,
            "commands": commands,
        })))
    }

    async fn handle_start(
        &self,
        request: &ApiRequest,
        restart: bool,
    ) -> Result<Option<serde_json::Value>, ApiError> {
        let params: StartParams = request.params()?;
        let start = StartRequest::new(&params.config_path, params.disable_memory_limit);
        info!("Starting engine from {:?} (restart: {})", start.config_path, restart);

        let status = if restart {
            self.controller
                .guard(Operation::Restart, self.controller.restart(start))
                .await?
        } else {
            self.controller
                .guard(Operation::Start, self.controller.start(start))
                .await?
        };
        Ok(Some(serde_json::to_value(status).map_err(|e| {
            ApiError::SerializationError(e.to_string())
        })?))
    }

    async fn handle_stop(&self) -> Result<Option<serde_json::Value>, ApiError> {
        let status = self
            .controller
            .guard(Operation::Stop, self.controller.stop())
            .await?;
        Ok(Some(serde_json::to_value(status).map_err(|e| {
            ApiError::SerializationError(e.to_string())
        })?))
    }

    async fn handle_select(&self, request: &ApiRequest) -> Result<Option<serde_json::Value>, ApiError> {
        let params: SelectParams = request.params()?;
        let selected = self
            .controller
            .guard(
                Operation::SelectOutbound,
                self.controller.select_outbound(&params.group, &params.outbound),
            )
            .await?;
        Ok(Some(json!({ "group": params.group, "selected": selected })))
    }

    async fn handle_url_test(
        &self,
        request: &ApiRequest,
    ) -> Result<Option<serde_json::Value>, ApiError> {
        let params: UrlTestParams = request.params()?;
        let results = self
            .controller
            .guard(Operation::UrlTest, self.controller.url_test(&params.group))
            .await?;
        Ok(Some(json!({ "group": params.group, "results": results })))
    }

    async fn handle_groups(&self) -> Result<Option<serde_json::Value>, ApiError> {
        let groups = self.controller.groups().await;
        Ok(Some(json!({ "groups": groups })))
    }

    async fn handle_start_command(
        &self,
        request: &ApiRequest,
    ) -> Result<Option<serde_json::Value>, ApiError> {
        let params: CommandParams = request.params()?;
        self.controller
            .guard(
                Operation::StartCommand,
                self.controller.start_command(params.kind, params.port),
            )
            .await?;
        Ok(Some(json!({ "kind": params.kind, "port": params.port })))
    }

    async fn handle_stop_command(
        &self,
        request: &ApiRequest,
    ) -> Result<Option<serde_json::Value>, ApiError> {
        let params: CommandParams = request.params()?;
        self.controller
            .guard(
                Operation::StopCommand,
                self.controller.stop_command(params.kind),
            )
            .await?;
        Ok(None)
    }
}
