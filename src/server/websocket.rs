//! WebSocket server implementation
//!
//! Listens for terminal clients, opens one agent session per connection during
//! the upgrade handshake and hands the upgraded socket to a `StreamBridge`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use super::handler::StreamBridge;
use crate::agent::{AgentSession, SpawnConfig};
use crate::config::BridgeConfig;
use crate::pty::{PtyAgent, TerminalSize};

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to, `ip:port`
    pub listen: String,
    /// Path of the WebSocket endpoint
    pub path: String,
    /// Command spawned for every connection
    pub spawn: SpawnConfig,
    /// Viewport applied right after a session opens
    pub initial_size: TerminalSize,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(listen: impl Into<String>, spawn: SpawnConfig) -> Self {
        Self {
            listen: listen.into(),
            path: "/pty".to_string(),
            spawn,
            initial_size: TerminalSize::new(200, 60),
        }
    }

    /// Set the endpoint path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the initial viewport size
    pub fn with_initial_size(mut self, size: TerminalSize) -> Self {
        self.initial_size = size;
        self
    }
}

impl From<&BridgeConfig> for ServerConfig {
    fn from(config: &BridgeConfig) -> Self {
        let mut spawn = SpawnConfig::new(config.command.clone());
        if let Some(dir) = &config.working_dir {
            spawn = spawn.with_working_dir(dir.clone());
        }

        ServerConfig::new(config.listen.clone(), spawn)
            .with_path(config.path.clone())
            .with_initial_size(config.initial_size())
    }
}

/// WebSocket server bridging clients to terminal sessions
pub struct WebSocketServer {
    config: Arc<ServerConfig>,
    agent: Arc<dyn PtyAgent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, agent: Arc<dyn PtyAgent>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            agent,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind to the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// On shutdown every live session is closed and the call returns once
    /// their bridges have finished.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!("WebSocket server listening on ws://{}{}", addr, self.config.path);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let config = Arc::clone(&self.config);
                            let agent = Arc::clone(&self.agent);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, config, agent, shutdown_rx).await {
                                    warn!("Connection from {} ended with error: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connections
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        if !connections.is_empty() {
            info!("Waiting for {} active sessions to close...", connections.len());
        }
        while connections.join_next().await.is_some() {}

        Ok(())
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    agent: Arc<dyn PtyAgent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    debug!("New connection from {}", peer_addr);

    let mut opened = None;
    let upgrade = accept_hdr_async(stream, |request: &Request, response: Response| {
        open_on_upgrade(request, response, &config, agent.as_ref(), &mut opened)
    })
    .await;

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(e) => {
            info!("Rejected upgrade from {}: {}", peer_addr, e);
            return Ok(());
        }
    };
    let Some(session) = opened else {
        anyhow::bail!("upgrade completed without a session");
    };

    let session = Arc::new(session);
    session.set_size(config.initial_size.cols, config.initial_size.rows);
    let size = session.size();
    info!(
        "Session {} started for {} at {}x{}",
        session.id(),
        peer_addr,
        size.cols,
        size.rows
    );

    let bridge = StreamBridge::new(Arc::clone(&session), peer_addr.to_string());
    let run = bridge.run(ws);
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => return Ok(()),
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received, closing session {}", session.id());
            session.close();
        }
    }

    // Closing the session ends both pumps on their own.
    run.await;
    Ok(())
}

/// Upgrade callback: route by path and open the session before accepting
#[allow(clippy::result_large_err)]
fn open_on_upgrade(
    request: &Request,
    response: Response,
    config: &ServerConfig,
    agent: &dyn PtyAgent,
    opened: &mut Option<AgentSession>,
) -> Result<Response, ErrorResponse> {
    let path = request.uri().path();
    if path != config.path {
        debug!("No endpoint at {}", path);
        return Err(reject(StatusCode::NOT_FOUND, "not found"));
    }

    match AgentSession::open(agent, &config.spawn) {
        Ok(session) => {
            *opened = Some(session);
            Ok(response)
        }
        Err(e) => {
            error!("Failed to start command `{}`: {}", config.spawn.command_line, e);
            Err(reject(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

fn reject(status: StatusCode, message: impl Into<String>) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.into()));
    *response.status_mut() = status;
    response
}
