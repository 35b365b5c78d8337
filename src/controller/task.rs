//! Background task handles
//!
//! Command clients, the command server, the status notifier and the control
//! server all run as tokio tasks that watch a shutdown flag.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::warn;

/// How long a task gets to observe shutdown before it is aborted
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Handle to a spawned task that stops on request
#[derive(Debug)]
pub(crate) struct TaskHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn `make(shutdown_rx)` as a task
    pub(crate) fn spawn<F, Fut>(name: impl Into<String>, make: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(make(rx));
        Self {
            name: name.into(),
            shutdown,
            join,
        }
    }

    /// Whether the task has already exited
    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal shutdown and wait for the task, aborting it after a grace period
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(true);
        let abort = self.join.abort_handle();
        if time::timeout(STOP_GRACE, self.join).await.is_err() {
            warn!("Timeout waiting for task '{}' to stop, aborting", self.name);
            abort.abort();
        }
    }
}

/// Resolve once shutdown is requested or the handle is dropped
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
