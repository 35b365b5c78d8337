//! Command clients and the legacy command server
//!
//! A command client is a feed of newline-delimited JSON events pushed to a
//! host port on loopback. The kind decides what is streamed:
//!
//! - `status`: registry snapshots on every change plus a heartbeat
//! - `log`: each non-empty status message
//! - `group`: outbound groups of the running engine when they change
//! - `clash_mode`: the routing mode when it changes
//!
//! The legacy command server accepts connections instead of dialing out;
//! each connection names its kind in a first line `{"kind": <int>}` and then
//! receives the same feed.

use crate::config::{validation, ClashMode, ControllerOptions};
use crate::controller::task::{shutdown_requested, TaskHandle};
use crate::controller::{Controller, WeakController};
use crate::engine::OutboundGroup;
use crate::error::{CoreError, Result};
use crate::state::{CoreStatus, MessageType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

/// How long a command server connection may take to name its kind
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Kind of command client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Status messages
    Log,
    /// Registry snapshots
    Status,
    /// Outbound groups
    Group,
    /// Routing mode
    ClashMode,
}

impl CommandKind {
    /// Wire code of this kind
    pub fn code(&self) -> i32 {
        match self {
            CommandKind::Log => 0,
            CommandKind::Status => 1,
            CommandKind::Group => 5,
            CommandKind::ClashMode => 9,
        }
    }
}

impl TryFrom<i32> for CommandKind {
    type Error = CoreError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(CommandKind::Log),
            1 => Ok(CommandKind::Status),
            5 => Ok(CommandKind::Group),
            9 => Ok(CommandKind::ClashMode),
            other => Err(CoreError::CommandClient(format!(
                "unknown command kind: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::Log => write!(f, "log"),
            CommandKind::Status => write!(f, "status"),
            CommandKind::Group => write!(f, "group"),
            CommandKind::ClashMode => write!(f, "clash_mode"),
        }
    }
}

/// One event line of a feed
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedEvent {
    Status(CoreStatus),
    Log {
        level: &'static str,
        message: String,
    },
    Groups {
        groups: Vec<OutboundGroup>,
    },
    ClashMode {
        mode: ClashMode,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Changed,
    Tick,
}

/// What a feed has already sent, so unchanged data is not repeated
struct FeedState {
    kind: CommandKind,
    last_groups: Option<Vec<OutboundGroup>>,
    last_mode: Option<ClashMode>,
}

impl FeedState {
    fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            last_groups: None,
            last_mode: None,
        }
    }

    async fn next_event(
        &mut self,
        trigger: Trigger,
        controller: &Controller,
        status: CoreStatus,
    ) -> Option<FeedEvent> {
        match self.kind {
            CommandKind::Status => Some(FeedEvent::Status(status)),
            CommandKind::Log => {
                if trigger != Trigger::Changed || status.message.is_empty() {
                    return None;
                }
                let level = if status.message_type == MessageType::Empty {
                    "info"
                } else {
                    "error"
                };
                Some(FeedEvent::Log {
                    level,
                    message: status.message,
                })
            }
            CommandKind::Group => {
                let groups = controller.groups().await;
                if self.last_groups.as_ref() == Some(&groups) {
                    return None;
                }
                self.last_groups = Some(groups.clone());
                Some(FeedEvent::Groups { groups })
            }
            CommandKind::ClashMode => {
                let mode = controller.settings().clash_mode;
                if self.last_mode == Some(mode) {
                    return None;
                }
                self.last_mode = Some(mode);
                Some(FeedEvent::ClashMode { mode })
            }
        }
    }
}

async fn write_event<W: AsyncWrite + Unpin>(writer: &mut W, event: &FeedEvent) -> Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Stream the feed of `kind` into `writer` until shutdown, write failure, or
/// the controller going away
async fn run_feed<W: AsyncWrite + Unpin>(
    kind: CommandKind,
    mut writer: W,
    source: WeakController,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut updates = match source.upgrade() {
        Some(controller) => controller.subscribe(),
        None => return Ok(()),
    };
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state = FeedState::new(kind);

    loop {
        let trigger = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return Ok(()),
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                Trigger::Changed
            }
            _ = ticker.tick() => Trigger::Tick,
        };

        let Some(controller) = source.upgrade() else {
            return Ok(());
        };
        let status = updates.borrow_and_update().clone();
        if let Some(event) = state.next_event(trigger, &controller, status).await {
            write_event(&mut writer, &event).await?;
        }
    }
}

/// Dial a host port on loopback and stream the feed of `kind` to it
async fn dial_feed(
    kind: CommandKind,
    port: u16,
    source: WeakController,
    options: &ControllerOptions,
) -> Result<TaskHandle> {
    let stream = time::timeout(
        options.connect_timeout,
        TcpStream::connect((Ipv4Addr::LOCALHOST, port)),
    )
    .await
    .map_err(|_| CoreError::CommandClient(format!("timed out connecting to port {}", port)))?
    .map_err(|e| CoreError::CommandClient(format!("port {} unreachable: {}", port, e)))?;

    let interval = options.feed_interval;
    Ok(TaskHandle::spawn(
        format!("{}-client", kind),
        move |shutdown| async move {
            if let Err(e) = run_feed(kind, stream, source, interval, shutdown).await {
                debug!("{} feed to port {} ended: {}", kind, port, e);
            }
        },
    ))
}

#[derive(Debug, Deserialize)]
struct CommandHello {
    kind: i32,
}

async fn handle_command_connection(
    stream: TcpStream,
    source: WeakController,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let read = time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line)).await?;
    if read? == 0 {
        return Ok(());
    }

    let kind = serde_json::from_str::<CommandHello>(line.trim())
        .map_err(|e| CoreError::CommandClient(format!("invalid handshake: {}", e)))
        .and_then(|hello| CommandKind::try_from(hello.kind));
    let kind = match kind {
        Ok(kind) => kind,
        Err(e) => {
            write_event(
                &mut writer,
                &FeedEvent::Error {
                    message: e.to_string(),
                },
            )
            .await?;
            return Err(e);
        }
    };

    debug!("Command server connection subscribed to {}", kind);
    run_feed(kind, writer, source, interval, shutdown).await
}

async fn serve_commands(
    listener: TcpListener,
    source: WeakController,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Command server connection from {}", peer);
                    let source = source.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) =
                            handle_command_connection(stream, source, interval, shutdown).await
                        {
                            debug!("Command connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept command connection: {}", e);
                }
            }
        }
    }

    connections.shutdown().await;
    debug!("Command server stopped");
}

struct CommandClient {
    port: u16,
    task: TaskHandle,
}

/// Registered command clients plus the legacy command server
pub(crate) struct CommandManager {
    clients: Mutex<HashMap<CommandKind, CommandClient>>,
    server: Mutex<Option<(SocketAddr, TaskHandle)>>,
}

impl CommandManager {
    pub(crate) fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            server: Mutex::new(None),
        }
    }

    /// Dial `port` and spawn a feed that is not registered as a client
    pub(crate) async fn connect(
        &self,
        kind: CommandKind,
        port: u16,
        source: WeakController,
        options: &ControllerOptions,
    ) -> Result<TaskHandle> {
        dial_feed(kind, port, source, options).await
    }

    async fn start_client(
        &self,
        kind: CommandKind,
        port: u16,
        source: WeakController,
        options: &ControllerOptions,
    ) -> Result<()> {
        let task = dial_feed(kind, port, source, options).await?;
        let replaced = self
            .clients
            .lock()
            .await
            .insert(kind, CommandClient { port, task });

        if let Some(old) = replaced {
            info!(
                "Replacing {} command client on port {} with port {}",
                kind, old.port, port
            );
            old.task.stop().await;
        } else {
            info!("Started {} command client on port {}", kind, port);
        }
        Ok(())
    }

    async fn stop_client(&self, kind: CommandKind) -> bool {
        let removed = self.clients.lock().await.remove(&kind);
        match removed {
            Some(client) => {
                client.task.stop().await;
                info!("Stopped {} command client on port {}", kind, client.port);
                true
            }
            None => false,
        }
    }

    async fn active(&self) -> Vec<(CommandKind, u16)> {
        let mut active: Vec<_> = self
            .clients
            .lock()
            .await
            .iter()
            .map(|(kind, client)| (*kind, client.port))
            .collect();
        active.sort_by_key(|(kind, _)| kind.code());
        active
    }

    /// Start the legacy command server. Returns the bound address; a server
    /// that is already running is kept.
    pub(crate) async fn start_server(
        &self,
        port: u16,
        source: WeakController,
        options: &ControllerOptions,
    ) -> Result<SocketAddr> {
        let mut server = self.server.lock().await;
        if let Some((addr, task)) = server.as_ref() {
            if !task.is_finished() {
                debug!("Command server already running on {}", addr);
                return Ok(*addr);
            }
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| {
                CoreError::CommandClient(format!(
                    "failed to bind command server on port {}: {}",
                    port, e
                ))
            })?;
        let addr = listener.local_addr()?;
        let interval = options.feed_interval;
        let task = TaskHandle::spawn("command-server", move |shutdown| {
            serve_commands(listener, source, interval, shutdown)
        });

        *server = Some((addr, task));
        info!("Command server listening on {}", addr);
        Ok(addr)
    }

    async fn server_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|(addr, _)| *addr)
    }

    /// Stop every client and the command server
    pub(crate) async fn shutdown(&self) {
        let clients: Vec<_> = self.clients.lock().await.drain().collect();
        for (kind, client) in clients {
            debug!("Stopping {} command client", kind);
            client.task.stop().await;
        }

        let server = self.server.lock().await.take();
        if let Some((addr, task)) = server {
            info!("Stopping command server on {}", addr);
            task.stop().await;
        }
    }
}

impl Controller {
    /// Attach a command client of `kind` streaming to host `port`
    pub async fn start_command(&self, kind: i32, port: i64) -> Result<()> {
        let kind = CommandKind::try_from(kind)?;
        let port = validation::validate_port(port)
            .map_err(|e| CoreError::CommandClient(e.to_string()))?;
        self.inner
            .commands
            .start_client(kind, port, self.downgrade(), &self.inner.options)
            .await
    }

    /// Detach the command client of `kind`. Stopping an inactive kind is a
    /// no-op.
    pub async fn stop_command(&self, kind: i32) -> Result<()> {
        let kind = CommandKind::try_from(kind)?;
        if !self.inner.commands.stop_client(kind).await {
            debug!("No active {} command client", kind);
        }
        Ok(())
    }

    /// Active command clients and their ports
    pub async fn active_commands(&self) -> Vec<(CommandKind, u16)> {
        self.inner.commands.active().await
    }

    /// Start the legacy command server on the port from settings
    pub async fn start_command_server(&self) -> Result<SocketAddr> {
        let port = self.settings().command_server_port;
        self.inner
            .commands
            .start_server(port, self.downgrade(), &self.inner.options)
            .await
    }

    /// Address of the legacy command server, if running
    pub async fn command_server_addr(&self) -> Option<SocketAddr> {
        self.inner.commands.server_addr().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerOptions, StartRequest};
    use crate::controller::testing::MockFactory;
    use tokio::io::{AsyncBufReadExt, BufReader, Lines};
    use tokio::net::tcp::OwnedReadHalf;

    fn controller() -> Controller {
        Controller::builder()
            .engine_factory(MockFactory::scripted(&[]))
            .options(ControllerOptions {
                feed_interval: Duration::from_millis(50),
                ..ControllerOptions::default()
            })
            .build()
    }

    async fn host() -> (TcpListener, i64) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port() as i64;
        (listener, port)
    }

    async fn accept_lines(listener: &TcpListener) -> Lines<BufReader<TcpStream>> {
        let (stream, _) = listener.accept().await.unwrap();
        BufReader::new(stream).lines()
    }

    async fn next_event<R>(lines: &mut Lines<R>) -> Option<serde_json::Value>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        let line = time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    async fn wait_for_event<R, F>(lines: &mut Lines<R>, pred: F) -> serde_json::Value
    where
        R: tokio::io::AsyncBufRead + Unpin,
        F: Fn(&serde_json::Value) -> bool,
    {
        loop {
            let event = next_event(lines).await.expect("feed closed");
            if pred(&event) {
                return event;
            }
        }
    }

    #[test]
    fn test_command_kind_codes() {
        for code in [0, 1, 5, 9] {
            assert_eq!(CommandKind::try_from(code).unwrap().code(), code);
        }
        assert!(matches!(
            CommandKind::try_from(3),
            Err(CoreError::CommandClient(_))
        ));
    }

    #[tokio::test]
    async fn test_status_client_streams_snapshots() {
        let controller = controller();
        let (listener, port) = host().await;

        controller.start_command(1, port).await.unwrap();
        let mut lines = accept_lines(&listener).await;

        let first = next_event(&mut lines).await.unwrap();
        assert_eq!(first["type"], "status");
        assert_eq!(first["core_state"], "STOPPED");

        controller
            .start(StartRequest {
                config_path: "profile.json".into(),
                enable_old_command_server: false,
                disable_memory_limit: false,
            })
            .await
            .unwrap();
        wait_for_event(&mut lines, |e| e["core_state"] == "STARTED").await;

        controller.stop_command(1).await.unwrap();
        assert!(controller.active_commands().await.is_empty());
        // The feed closes its connection once stopped
        while next_event(&mut lines).await.is_some() {}
    }

    #[tokio::test]
    async fn test_start_then_stop_leaves_no_registration() {
        let controller = controller();
        let (listener, port) = host().await;

        controller.start_command(0, port).await.unwrap();
        let _conn = listener.accept().await.unwrap();
        assert_eq!(
            controller.active_commands().await,
            vec![(CommandKind::Log, port as u16)]
        );

        controller.stop_command(0).await.unwrap();
        assert!(controller.active_commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_restart_kind_replaces_client() {
        let controller = controller();
        let (first, first_port) = host().await;
        let (second, second_port) = host().await;

        controller.start_command(9, first_port).await.unwrap();
        let mut old = accept_lines(&first).await;
        controller.start_command(9, second_port).await.unwrap();
        let mut new = accept_lines(&second).await;

        assert_eq!(
            controller.active_commands().await,
            vec![(CommandKind::ClashMode, second_port as u16)]
        );
        let event = next_event(&mut new).await.unwrap();
        assert_eq!(event["type"], "clash_mode");
        assert_eq!(event["mode"], "rule");

        // The replaced feed is closed
        while next_event(&mut old).await.is_some() {}
        controller.close(crate::config::SetupMode::Embedded).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_command_requests() {
        let controller = controller();
        assert!(matches!(
            controller.start_command(3, 8080).await,
            Err(CoreError::CommandClient(_))
        ));
        assert!(matches!(
            controller.start_command(1, 0).await,
            Err(CoreError::CommandClient(_))
        ));
        assert!(matches!(
            controller.start_command(1, 70000).await,
            Err(CoreError::CommandClient(_))
        ));
        assert!(matches!(
            controller.stop_command(42).await,
            Err(CoreError::CommandClient(_))
        ));
        // Inactive kind
        controller.stop_command(5).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_port() {
        let controller = controller();
        let port = host().await.1;
        assert!(matches!(
            controller.start_command(1, port).await,
            Err(CoreError::CommandClient(_))
        ));
        assert!(controller.active_commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_clash_mode_feed_follows_settings() {
        let controller = controller();
        let (listener, port) = host().await;
        controller.start_command(9, port).await.unwrap();
        let mut lines = accept_lines(&listener).await;

        assert_eq!(next_event(&mut lines).await.unwrap()["mode"], "rule");
        controller
            .change_settings(r#"{"clashMode": "global"}"#)
            .unwrap();
        let event = wait_for_event(&mut lines, |e| e["type"] == "clash_mode").await;
        assert_eq!(event["mode"], "global");
        controller.close(crate::config::SetupMode::Embedded).await.unwrap();
    }

    #[tokio::test]
    async fn test_group_feed_reports_running_engine() {
        let controller = controller();
        let (listener, port) = host().await;
        controller.start_command(5, port).await.unwrap();
        let mut lines = accept_lines(&listener).await;

        let empty = next_event(&mut lines).await.unwrap();
        assert_eq!(empty["groups"], serde_json::json!([]));

        controller
            .start(StartRequest {
                config_path: "profile.json".into(),
                enable_old_command_server: false,
                disable_memory_limit: false,
            })
            .await
            .unwrap();
        let event = wait_for_event(&mut lines, |e| {
            e["groups"].as_array().map_or(false, |g| !g.is_empty())
        })
        .await;
        assert_eq!(event["groups"][0]["tag"], "proxy");
        assert_eq!(event["groups"][0]["selected"], "a");
        controller.close(crate::config::SetupMode::Embedded).await.unwrap();
    }

    async fn server_connection(addr: SocketAddr, kind: i32) -> (Lines<BufReader<OwnedReadHalf>>, tokio::net::tcp::OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(format!("{{\"kind\": {}}}\n", kind).as_bytes())
            .await
            .unwrap();
        (BufReader::new(reader).lines(), writer)
    }

    #[tokio::test]
    async fn test_legacy_command_server() {
        let controller = controller();
        let addr = controller.start_command_server().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(controller.start_command_server().await.unwrap(), addr);
        assert_eq!(controller.command_server_addr().await, Some(addr));

        let (mut lines, _writer) = server_connection(addr, 1).await;
        let event = next_event(&mut lines).await.unwrap();
        assert_eq!(event["type"], "status");

        let (mut bad, _bad_writer) = server_connection(addr, 3).await;
        let event = next_event(&mut bad).await.unwrap();
        assert_eq!(event["type"], "error");

        controller.close(crate::config::SetupMode::Embedded).await.unwrap();
        assert!(controller.command_server_addr().await.is_none());
        while next_event(&mut lines).await.is_some() {}
    }
}
