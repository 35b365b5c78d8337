//! Setup, Start, Stop, Restart and Close

use crate::config::{validation, SetupMode, SetupParameters, StartRequest};
use crate::control::{AuthPolicy, CommandHandler, ControlServer};
use crate::controller::task::TaskHandle;
use crate::controller::{CommandKind, Controller};
use crate::engine::EngineOptions;
use crate::error::{CoreError, Result};
use crate::logging;
use crate::state::{CoreState, CoreStatus, MessageType};
use std::sync::Arc;
use tokio::time;
use tracing::{debug, error, info, warn};

impl Controller {
    /// Initialize the process: validate parameters, load the server key,
    /// and (re)start the status notifier and control server. Never touches
    /// the engine state.
    pub async fn setup(&self, params: SetupParameters) -> Result<()> {
        params.validate()?;
        logging::init(params.debug);
        info!("Setting up core in {} mode", params.mode);

        self.inner
            .keys
            .load_server_key(params.server_key_path())
            .map_err(|e| CoreError::Setup(e.to_string()))?;

        let mut services = self.inner.services.lock().await;
        if let Some(notifier) = services.notifier.take() {
            notifier.stop().await;
        }
        if let Some((addr, server)) = services.control.take() {
            info!("Stopping control server on {}", addr);
            server.stop().await;
        }

        if params.status_port > 0 {
            let port = validation::validate_port(params.status_port)
                .map_err(|e| CoreError::Setup(e.to_string()))?;
            let notifier = self
                .inner
                .commands
                .connect(CommandKind::Status, port, self.downgrade(), &self.inner.options)
                .await
                .map_err(|e| CoreError::Setup(format!("status channel: {}", e)))?;
            services.notifier = Some(notifier);
            info!("Status notifications go to port {}", port);
        }

        if params.mode.is_server() {
            let listen = validation::validate_listen_address(&params.listen)
                .map_err(|e| CoreError::Setup(e.to_string()))?;
            let handler = Arc::new(CommandHandler::new(
                self.clone(),
                AuthPolicy::from_setup(&params),
            ));
            let server = ControlServer::bind(listen, handler)
                .await
                .map_err(|e| CoreError::Setup(e.to_string()))?;
            let addr = server.local_addr();
            let task = TaskHandle::spawn("control-server", move |shutdown| server.run(shutdown));
            services.control = Some((addr, task));
        }
        drop(services);

        *self.inner.setup.write().unwrap_or_else(|e| e.into_inner()) = Some(params);
        Ok(())
    }

    /// Build and start an engine
    pub async fn start(&self, request: StartRequest) -> Result<CoreStatus> {
        let epoch = {
            let mut slot = self.inner.slot.lock().await;
            match self.inner.registry.state() {
                CoreState::Starting | CoreState::Started => {
                    warn!("Start rejected: instance already started");
                    return Err(CoreError::InstanceAlreadyStarted);
                }
                CoreState::Stopping => {
                    warn!("Start rejected: previous instance has not stopped");
                    return Err(CoreError::InstanceNotStopped);
                }
                CoreState::Stopped => {}
            }
            self.inner
                .registry
                .publish(CoreState::Starting, MessageType::Empty, "")?;
            slot.begin_start()
        };

        info!("Starting engine from {:?}", request.config_path);
        let options = EngineOptions {
            config_path: request.config_path.clone(),
            disable_memory_limit: request.disable_memory_limit,
            settings: self.settings(),
        };
        let timeout = self.inner.options.start_timeout;
        let engine = match time::timeout(timeout, self.inner.factory.create(options)).await {
            Ok(Ok(engine)) => engine,
            Ok(Err(e)) => {
                return Err(self.abort_start(epoch, MessageType::UnexpectedError, e).await)
            }
            Err(_) => {
                let e = CoreError::Timeout(format!("engine construction exceeded {:?}", timeout));
                return Err(self.abort_start(epoch, MessageType::UnexpectedError, e).await);
            }
        };
        engine.set_memory_limit(!request.disable_memory_limit);

        if request.enable_old_command_server {
            let port = self.settings().command_server_port;
            if let Err(e) = self
                .inner
                .commands
                .start_server(port, self.downgrade(), &self.inner.options)
                .await
            {
                if let Err(close_err) = engine.close().await {
                    warn!("Failed to close engine after aborted start: {}", close_err);
                }
                return Err(self.abort_start(epoch, MessageType::StartCommandServer, e).await);
            }
        }

        let mut slot = self.inner.slot.lock().await;
        if slot.start_epoch != epoch || self.inner.registry.state() != CoreState::Starting {
            // Torn down by close while the engine was being built
            drop(slot);
            if let Err(e) = engine.close().await {
                warn!("Failed to close engine after aborted start: {}", e);
            }
            return Err(CoreError::Unexpected("start aborted by close".to_string()));
        }

        slot.bind(engine);
        let status = self
            .inner
            .registry
            .publish(CoreState::Started, MessageType::Empty, "")?;
        info!("Engine started (instance {})", slot.generation);
        Ok(status)
    }

    async fn abort_start(
        &self,
        epoch: u64,
        message_type: MessageType,
        error: CoreError,
    ) -> CoreError {
        error!("Engine start failed: {}", error);
        let slot = self.inner.slot.lock().await;
        if slot.start_epoch == epoch && self.inner.registry.state() == CoreState::Starting {
            if let Err(e) =
                self.inner
                    .registry
                    .publish(CoreState::Stopped, message_type, error.to_string())
            {
                warn!("Failed to publish aborted start: {}", e);
            }
        }
        error
    }

    /// Close the running engine
    pub async fn stop(&self) -> Result<CoreStatus> {
        let (engine, generation) = {
            let mut slot = self.inner.slot.lock().await;
            if !self.inner.registry.state().can_stop() {
                warn!("Stop rejected: instance not started");
                return Err(CoreError::InstanceNotStarted);
            }
            let engine = slot.engine.clone().ok_or(CoreError::InstanceNotFound)?;
            self.inner
                .registry
                .publish(CoreState::Stopping, MessageType::Empty, "")?;
            slot.closing = true;
            (engine, slot.generation)
        };

        info!("Stopping engine");
        let closed = engine.close().await;

        let mut slot = self.inner.slot.lock().await;
        if slot.generation != generation {
            warn!("Engine was torn down while stopping");
            return Ok(self.inner.registry.snapshot());
        }
        slot.closing = false;

        match closed {
            Ok(()) => {
                slot.clear();
                let status = self
                    .inner
                    .registry
                    .publish(CoreState::Stopped, MessageType::Empty, "")?;
                info!("Engine stopped");
                Ok(status)
            }
            Err(e) => {
                let message = format!("failed to close engine: {}", e);
                error!("{}", message);
                self.inner.registry.publish(
                    CoreState::Stopping,
                    MessageType::UnexpectedError,
                    message.clone(),
                )?;
                Err(CoreError::Unexpected(message))
            }
        }
    }

    /// Stop the running engine (if any), then start a new one
    pub async fn restart(&self, request: StartRequest) -> Result<CoreStatus> {
        if self.inner.registry.state().is_running() {
            self.stop().await?;
        }
        self.start(request).await
    }

    /// Tear everything down regardless of state
    pub async fn close(&self, mode: SetupMode) -> Result<()> {
        info!("Closing core ({} mode)", mode);
        self.inner.commands.shutdown().await;

        let engine = {
            let mut slot = self.inner.slot.lock().await;
            slot.start_epoch += 1;
            let stop_in_flight = std::mem::take(&mut slot.closing);
            let engine = slot.clear();
            self.inner.registry.reset(MessageType::Empty, "");
            if stop_in_flight {
                debug!("Engine is already being closed by stop");
                None
            } else {
                engine
            }
        };
        if let Some(engine) = engine {
            if let Err(e) = engine.close().await {
                warn!("Engine close failed during teardown: {}", e);
            }
        }

        let mut services = self.inner.services.lock().await;
        if let Some(notifier) = services.notifier.take() {
            notifier.stop().await;
        }
        if mode.is_server() {
            if let Some((addr, server)) = services.control.take() {
                info!("Stopping control server on {}", addr);
                server.stop().await;
            }
        }
        Ok(())
    }
}
