//! Core state registry
//!
//! Holds the engine's lifecycle state together with the last status message.
//! Readers take cheap snapshots or subscribe to pushed updates; writes happen
//! only through the controller, inside its engine-slot critical section.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoreState {
    /// No engine exists
    Stopped,
    /// Engine is being constructed
    Starting,
    /// Engine is running
    Started,
    /// Engine is being closed
    Stopping,
}

impl CoreState {
    /// Check if the engine is running
    pub fn is_running(&self) -> bool {
        matches!(self, CoreState::Started)
    }

    /// Check if a start may begin from this state
    pub fn can_start(&self) -> bool {
        matches!(self, CoreState::Stopped)
    }

    /// Check if a stop may begin from this state
    pub fn can_stop(&self) -> bool {
        matches!(self, CoreState::Started)
    }

    /// Legal edges of the lifecycle graph. Re-publishing the current state
    /// (to update only the message) is always allowed.
    pub fn can_transition_to(&self, next: CoreState) -> bool {
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (CoreState::Stopped, CoreState::Starting)
                | (CoreState::Starting, CoreState::Started)
                | (CoreState::Starting, CoreState::Stopped)
                | (CoreState::Started, CoreState::Stopping)
                | (CoreState::Stopping, CoreState::Stopped)
        )
    }
}

impl std::fmt::Display for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreState::Stopped => write!(f, "stopped"),
            CoreState::Starting => write!(f, "starting"),
            CoreState::Started => write!(f, "started"),
            CoreState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Kind of status message attached to a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// No message
    Empty,
    /// Start was requested with an empty configuration
    EmptyConfiguration,
    /// Legacy command server could not start
    StartCommandServer,
    /// Engine construction failed
    CreateService,
    /// Engine failed after construction
    StartService,
    /// Unexpected failure
    UnexpectedError,
    /// Start rejected because an engine is starting or running
    #[serde(rename = "INSTANCE_ALREADY_STARTED")]
    AlreadyStarted,
    /// Operation rejected because no engine is running
    InstanceNotStarted,
    /// Registry and engine handle disagree
    InstanceNotFound,
    /// Engine has not finished stopping
    InstanceNotStopped,
    /// Full configuration could not be generated
    ErrorBuildingConfig,
    /// Profile could not be parsed
    ErrorParsingConfig,
    /// Profile could not be read
    ErrorReadingConfig,
}

/// Snapshot of the registry: state plus the message that came with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreStatus {
    /// Lifecycle state
    pub core_state: CoreState,
    /// Message kind
    pub message_type: MessageType,
    /// Free-text payload (empty when none)
    pub message: String,
}

impl CoreStatus {
    fn initial() -> Self {
        Self {
            core_state: CoreState::Stopped,
            message_type: MessageType::Empty,
            message: String::new(),
        }
    }
}

/// Registry of the engine lifecycle state
#[derive(Debug)]
pub struct StateRegistry {
    tx: watch::Sender<CoreStatus>,
}

impl StateRegistry {
    /// Create a registry in the `Stopped` state
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CoreStatus::initial());
        Self { tx }
    }

    /// Current state
    pub fn state(&self) -> CoreState {
        self.tx.borrow().core_state
    }

    /// Full snapshot of the current status
    pub fn snapshot(&self) -> CoreStatus {
        self.tx.borrow().clone()
    }

    /// Subscribe to status updates
    pub fn subscribe(&self) -> watch::Receiver<CoreStatus> {
        self.tx.subscribe()
    }

    /// Publish a transition. Illegal edges are refused and leave the
    /// registry untouched.
    pub(crate) fn publish(
        &self,
        next: CoreState,
        message_type: MessageType,
        message: impl Into<String>,
    ) -> Result<CoreStatus> {
        let current = self.state();
        if !current.can_transition_to(next) {
            warn!("Refusing illegal state transition {} -> {}", current, next);
            return Err(CoreError::Unexpected(format!(
                "illegal state transition {} -> {}",
                current, next
            )));
        }

        let status = CoreStatus {
            core_state: next,
            message_type,
            message: message.into(),
        };
        debug!(
            "Core state {} -> {} ({:?})",
            current, status.core_state, status.message_type
        );
        self.tx.send_replace(status.clone());
        Ok(status)
    }

    /// Force the registry back to `Stopped`, whatever the current state.
    /// Only the teardown path uses this.
    pub(crate) fn reset(&self, message_type: MessageType, message: impl Into<String>) -> CoreStatus {
        let status = CoreStatus {
            core_state: CoreState::Stopped,
            message_type,
            message: message.into(),
        };
        self.tx.send_replace(status.clone());
        status
    }
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new()
    }
}
