//! Control API request and response types
//!
//! Requests and responses are single JSON objects, one per line.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Control actions accepted by the control server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// Report state, message and groups
    Status,
    /// Start the engine
    Start,
    /// Stop the engine
    Stop,
    /// Restart the engine
    Restart,
    /// Change the active member of a group
    SelectOutbound,
    /// Probe the members of a group
    UrlTest,
    /// List outbound groups
    Groups,
    /// Attach a command client
    StartCommand,
    /// Detach a command client
    StopCommand,
}

/// API request from client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Request ID for tracking
    #[serde(default = "default_request_id")]
    pub id: String,

    /// Action to perform
    pub action: ControlAction,

    /// Shared secret (secure modes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Base64 client public key (secure modes with registered keys)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,

    /// Action parameters
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl ApiRequest {
    /// Create a new API request without parameters
    pub fn new(id: impl Into<String>, action: ControlAction) -> Self {
        Self {
            id: id.into(),
            action,
            secret: None,
            client_key: None,
            params: serde_json::Value::Null,
        }
    }

    /// Attach parameters
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Attach the shared secret
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Attach a base64 client key
    pub fn with_client_key(mut self, key: impl Into<String>) -> Self {
        self.client_key = Some(key.into());
        self
    }

    /// Decode the parameters of this request
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| ApiError::ParseError(format!("Invalid params for {:?}: {}", self.action, e)))
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self, ApiError> {
        serde_json::from_str(json).map_err(|e| ApiError::ParseError(e.to_string()))
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String, ApiError> {
        serde_json::to_string(self).map_err(|e| ApiError::SerializationError(e.to_string()))
    }
}

/// Parameters of `start` and `restart`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartParams {
    /// Profile path
    pub config_path: PathBuf,
    /// Disable the engine's memory limiter
    #[serde(default)]
    pub disable_memory_limit: bool,
}

/// Parameters of `select_outbound`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectParams {
    /// Group tag
    pub group: String,
    /// Member to activate
    pub outbound: String,
}

/// Parameters of `url_test`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlTestParams {
    /// Group tag
    pub group: String,
}

/// Parameters of `start_command` and `stop_command`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandParams {
    /// Command kind code
    pub kind: i32,
    /// Host port (`start_command` only)
    #[serde(default)]
    pub port: i64,
}

/// API response to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Request ID this response corresponds to
    pub id: String,

    /// Whether the request was successful
    pub success: bool,

    /// Optional result data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Optional error information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl ApiResponse {
    /// Create a successful response
    pub fn success(id: String, data: Option<serde_json::Value>) -> Self {
        Self {
            id,
            success: true,
            data,
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: String, error: ApiError) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> Result<String, ApiError> {
        serde_json::to_string(self).map_err(|e| ApiError::SerializationError(e.to_string()))
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self, ApiError> {
        serde_json::from_str(json).map_err(|e| ApiError::ParseError(e.to_string()))
    }
}

/// API error types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", content = "message")]
pub enum ApiError {
    /// Failed to parse request
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Failed to serialize response
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Action not allowed in the current engine state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Group not found in the running engine
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// Outbound not a member of the group
    #[error("Outbound not found: {0}")]
    OutboundNotFound(String),

    /// Profile or settings error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Command client error
    #[error("Command client error: {0}")]
    CommandClientError(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Authentication failed
    #[error("Authentication failed")]
    AuthenticationFailed,
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InstanceAlreadyStarted
            | CoreError::InstanceNotStarted
            | CoreError::InstanceNotFound
            | CoreError::InstanceNotStopped => ApiError::InvalidState(err.to_string()),
            CoreError::GroupNotFound(tag) => ApiError::GroupNotFound(tag),
            CoreError::OutboundNotFound(tag) => ApiError::OutboundNotFound(tag),
            CoreError::Parse(msg)
            | CoreError::Settings(msg)
            | CoreError::Generate(msg)
            | CoreError::Config(msg)
            | CoreError::Setup(msg) => ApiError::ConfigError(msg),
            CoreError::CommandClient(msg) => ApiError::CommandClientError(msg),
            CoreError::Serialization(msg) => ApiError::SerializationError(msg),
            CoreError::Timeout(msg) => ApiError::Timeout(msg),
            _ => ApiError::InternalError(err.to_string()),
        }
    }
}

fn default_request_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("req-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}
