//! webpty bridge server
//!
//! Serves an interactive terminal over WebSocket. Every connection gets its own
//! pseudo-terminal session running the configured command; output is streamed
//! to the client as text frames and client messages are fed back as input.

mod agent;
mod config;
mod pty;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::BridgeConfig;
use pty::NativePtyAgent;
use server::{ServerConfig, WebSocketServer};

/// webpty bridge server
///
/// Drives a terminal session from a browser or any WebSocket client
#[derive(Parser, Debug)]
#[command(name = "webpty-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:9000
    #[arg(long)]
    addr: Option<String>,

    /// Command line to execute on the terminal side
    #[arg(long)]
    cmd: Option<String>,

    /// Working directory for the command
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// WebSocket endpoint path
    #[arg(long)]
    path: Option<String>,

    /// Initial terminal columns
    #[arg(long)]
    cols: Option<u16>,

    /// Initial terminal rows
    #[arg(long)]
    rows: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Load the config file, if any, and apply flags on top
    fn into_config(self) -> anyhow::Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)?,
            None => BridgeConfig::default(),
        };

        if let Some(addr) = self.addr {
            config.listen = addr;
        }
        if let Some(cmd) = self.cmd {
            config.command = cmd;
        }
        if let Some(cwd) = self.cwd {
            config.working_dir = Some(cwd);
        }
        if let Some(path) = self.path {
            config.path = path;
        }
        if let Some(cols) = self.cols {
            config.cols = cols;
        }
        if let Some(rows) = self.rows {
            config.rows = rows;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("webpty bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config()?;
    info!("Serving `{}` on {}{}", config.command, config.listen, config.path);

    // The agent binding is created once and shared by every session
    let server = Arc::new(WebSocketServer::new(
        ServerConfig::from(&config),
        Arc::new(NativePtyAgent::new()),
    ));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
