//! Fault boundary
//!
//! Every operation invoked from outside the crate runs through
//! [`Controller::guard`]. A panic inside the operation is caught, logged,
//! turned into [`CoreError::Unexpected`], and the state registry is brought
//! back to a state the next caller can work with.

use crate::controller::Controller;
use crate::error::{CoreError, Result};
use crate::state::{CoreState, MessageType};
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{error, warn};

/// Externally invoked operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Operation {
    Setup,
    Parse,
    ChangeSettings,
    GenerateConfig,
    Start,
    Stop,
    Restart,
    StartCommand,
    StopCommand,
    SelectOutbound,
    UrlTest,
    GenerateWarpConfig,
    GetServerPublicKey,
    AddClientPublicKey,
    Close,
}

impl Operation {
    /// Whether the operation is the one that moves the registry into
    /// `Starting`
    fn owns_starting(&self) -> bool {
        matches!(self, Operation::Start | Operation::Restart)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Setup => "setup",
            Operation::Parse => "parse",
            Operation::ChangeSettings => "change_settings",
            Operation::GenerateConfig => "generate_config",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Restart => "restart",
            Operation::StartCommand => "start_command",
            Operation::StopCommand => "stop_command",
            Operation::SelectOutbound => "select_outbound",
            Operation::UrlTest => "url_test",
            Operation::GenerateWarpConfig => "generate_warp_config",
            Operation::GetServerPublicKey => "get_server_public_key",
            Operation::AddClientPublicKey => "add_client_public_key",
            Operation::Close => "close",
        };
        f.write_str(name)
    }
}

impl Controller {
    /// Run `fut`, converting a panic into [`CoreError::Unexpected`]
    pub async fn guard<T, F>(&self, operation: Operation, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Operation {} panicked: {}", operation, message);
                self.recover_from_fault(operation, &message).await;
                Err(CoreError::Unexpected(format!(
                    "{} panicked: {}",
                    operation, message
                )))
            }
        }
    }

    /// Bring the registry back to a usable state after a panic.
    ///
    /// The slot lock is never held across a panic that escapes an operation:
    /// the guard is dropped while unwinding.
    async fn recover_from_fault(&self, operation: Operation, message: &str) {
        let _slot = self.inner.slot.lock().await;
        let registry = &self.inner.registry;
        let current = registry.state();

        let next = match current {
            CoreState::Starting if operation.owns_starting() => CoreState::Stopped,
            other => other,
        };
        if let Err(e) = registry.publish(next, MessageType::UnexpectedError, message) {
            warn!("Failed to record fault in state registry: {}", e);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StartRequest;
    use crate::controller::testing::{Build, MockFactory};

    #[tokio::test]
    async fn test_guard_passes_results_through() {
        let controller = Controller::new(MockFactory::scripted(&[]));
        let ok = controller.guard(Operation::Parse, async { Ok(5) }).await;
        assert_eq!(ok.unwrap(), 5);

        let err: Result<()> = controller
            .guard(Operation::Stop, async { Err(CoreError::InstanceNotStarted) })
            .await;
        assert!(matches!(err, Err(CoreError::InstanceNotStarted)));
    }

    #[tokio::test]
    async fn test_panic_becomes_unexpected_error() {
        let controller = Controller::new(MockFactory::scripted(&[]));
        let result: Result<()> = controller
            .guard(Operation::SelectOutbound, async { panic!("boom") })
            .await;

        match result {
            Err(CoreError::Unexpected(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected unexpected error, got {:?}", other),
        }
        let status = controller.status();
        assert_eq!(status.core_state, CoreState::Stopped);
        assert_eq!(status.message_type, MessageType::UnexpectedError);
    }

    #[tokio::test]
    async fn test_panic_during_start_leaves_stopped() {
        let factory = MockFactory::scripted(&[Build::Panic]);
        let controller = Controller::new(factory.clone());

        let result = controller
            .guard(
                Operation::Start,
                controller.start(StartRequest::new("profile.json", false)),
            )
            .await;

        assert!(matches!(result, Err(CoreError::Unexpected(_))));
        assert_eq!(controller.status().core_state, CoreState::Stopped);
        assert_eq!(controller.status().message_type, MessageType::UnexpectedError);

        // The controller stays usable
        controller
            .start(StartRequest::new("profile.json", false))
            .await
            .unwrap();
        assert_eq!(controller.status().core_state, CoreState::Started);
        assert_eq!(factory.built(), 1);
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u32), "unknown panic");
    }
}
