//! Control server over TCP
//!
//! This module implements the server that listens for incoming control
//! connections and dispatches commands to the handler. Each line a client
//! sends is one request; each response is written back as one line.

use crate::control::{ApiError, ApiRequest, ApiResponse, CommandHandler};
use crate::controller::task::shutdown_requested;
use crate::error::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Control server bound to its listen address
pub struct ControlServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<CommandHandler>,
}

impl ControlServer {
    /// Bind the control server
    pub async fn bind(listen: SocketAddr, handler: Arc<CommandHandler>) -> Result<Self> {
        info!("Starting control server at {}", listen);
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        info!("Control server listening at {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            handler,
        })
    }

    /// Address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = self.handler.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, handler).await {
                                error!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }

        connections.shutdown().await;
        info!("Control server at {} stopped", self.local_addr);
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<CommandHandler>,
) -> std::result::Result<(), ApiError> {
    debug!("New client connection from {}", peer);

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();

        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Client {} disconnected", peer);
                break;
            }
            Ok(_) => {
                let request_str = line.trim();
                if request_str.is_empty() {
                    continue;
                }

                // Parse request
                let response = match ApiRequest::from_json(request_str) {
                    Ok(request) => handler.handle_request(request).await,
                    Err(e) => {
                        error!("Failed to parse request: {}", e);
                        ApiResponse::error(
                            "unknown".to_string(),
                            ApiError::ParseError(format!("Invalid JSON: {}", e)),
                        )
                    }
                };

                // Send response
                let mut response_str = response.to_json()?;
                response_str.push('\n');

                writer
                    .write_all(response_str.as_bytes())
                    .await
                    .map_err(|e| {
                        ApiError::InternalError(format!("Failed to write response: {}", e))
                    })?;

                writer.flush().await.map_err(|e| {
                    ApiError::InternalError(format!("Failed to flush response: {}", e))
                })?;
            }
            Err(e) => {
                error!("Failed to read from {}: {}", peer, e);
                break;
            }
        }
    }

    Ok(())
}
