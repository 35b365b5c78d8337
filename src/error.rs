//! Error types for core-agent
//!
//! This module defines the error types used throughout the application.
//! We use `thiserror` for ergonomic error definitions and `anyhow` for
//! error propagation in the binary.

use crate::state::MessageType;
use thiserror::Error;

/// Main error type for core-agent operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// Start requested while the engine is starting or running
    #[error("instance already started")]
    InstanceAlreadyStarted,

    /// Operation requires a running engine
    #[error("instance not started")]
    InstanceNotStarted,

    /// Registry says started but no engine is held
    #[error("instance not found")]
    InstanceNotFound,

    /// A previous stop did not complete; the engine is still held
    #[error("instance not stopped")]
    InstanceNotStopped,

    /// Unexpected failure, including panics caught at the fault boundary
    #[error("unexpected error: {0}")]
    Unexpected(String),

    /// Setup failures (paths, mode, listen address, secret)
    #[error("setup error: {0}")]
    Setup(String),

    /// Profile parsing failures
    #[error("parse error: {0}")]
    Parse(String),

    /// Settings document failures
    #[error("settings error: {0}")]
    Settings(String),

    /// Configuration generation failures
    #[error("generate error: {0}")]
    Generate(String),

    /// Command client failures (unknown kind, unreachable port)
    #[error("command client error: {0}")]
    CommandClient(String),

    /// Outbound group does not exist in the running engine
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// Outbound is not a member of the requested group
    #[error("outbound not found: {0}")]
    OutboundNotFound(String),

    /// Configuration-file errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Timeout errors
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Key handling and authentication errors
    #[error("security error: {0}")]
    Security(String),
}

impl CoreError {
    /// Status message kind published alongside this error
    pub fn message_type(&self) -> MessageType {
        match self {
            CoreError::InstanceAlreadyStarted => MessageType::AlreadyStarted,
            CoreError::InstanceNotStarted => MessageType::InstanceNotStarted,
            CoreError::InstanceNotFound => MessageType::InstanceNotFound,
            CoreError::InstanceNotStopped => MessageType::InstanceNotStopped,
            CoreError::Parse(_) => MessageType::ErrorParsingConfig,
            CoreError::Generate(_) => MessageType::ErrorBuildingConfig,
            CoreError::Config(_) => MessageType::ErrorReadingConfig,
            _ => MessageType::UnexpectedError,
        }
    }

    /// Whether this error is an expected precondition rejection
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CoreError::InstanceAlreadyStarted
                | CoreError::InstanceNotStarted
                | CoreError::InstanceNotFound
                | CoreError::InstanceNotStopped
        )
    }
}

/// Result type alias using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(err: toml::de::Error) -> Self {
        CoreError::Config(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CoreError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        CoreError::Timeout(err.to_string())
    }
}
