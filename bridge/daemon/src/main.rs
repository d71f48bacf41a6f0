//! Bridge Daemon - Unix socket front end for the agent bridge
//!
//! Loads the bridge configuration, opens every configured platform and
//! serves newline-delimited JSON requests on a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (~/.config/agent-bridge/bridge.toml)
//! bridge-daemon
//!
//! # Custom socket and config
//! bridge-daemon --socket /tmp/bridge.sock --config ./bridge.toml
//!
//! # In-process echo platforms, no network
//! bridge-daemon --loopback
//!
//! # Verbose logging
//! RUST_LOG=debug bridge-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use bridge_core::config::{load_config_from_path, default_config_path};
use bridge_core::{
    Bridge, BridgeConfig, ConfigOverrides, LoopbackTransport, PlatformConfig, PlatformId,
    PlatformTransport,
};
use server::{DaemonServer, ServerConfig};

/// Platforms created for `--loopback` when the config names none
const LOOPBACK_PLATFORMS: [&str; 2] = ["loopback-a", "loopback-b"];

/// Bridge Daemon - routes agent requests across AI platforms
#[derive(Parser, Debug)]
#[command(name = "bridge-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for client connections
    #[arg(short = 's', long, env = "BRIDGE_SOCKET", value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "BRIDGE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Serve in-process echo platforms instead of HTTP endpoints
    #[arg(long)]
    loopback: bool,

    /// Session window size override
    #[arg(long, value_name = "N")]
    session_window: Option<usize>,

    /// Hybrid execution timeout override (milliseconds)
    #[arg(long, value_name = "MS")]
    hybrid_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "BRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            session_window: self.session_window,
            hybrid_timeout_ms: self.hybrid_timeout_ms,
            ..ConfigOverrides::default()
        }
    }
}

/// Get the default socket path
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise /tmp/agent-bridge-$UID/
fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("agent-bridge")
            .join("bridge.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/agent-bridge-{uid}/bridge.sock"))
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("bridge_daemon={level},bridge_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Loopback transports for every platform, adding defaults when none are configured
fn loopback_transports(
    config: &mut BridgeConfig,
) -> BTreeMap<PlatformId, Arc<dyn PlatformTransport>> {
    if config.platforms.is_empty() {
        config.platforms = LOOPBACK_PLATFORMS
            .iter()
            .zip(0u32..)
            .map(|(name, priority)| PlatformConfig::new(*name, "").with_priority(priority))
            .collect();
    }
    config
        .platforms
        .iter()
        .map(|p| {
            let transport: Arc<dyn PlatformTransport> = Arc::new(LoopbackTransport::new(p.id.clone()));
            (p.id.clone(), transport)
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Bridge daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);

    let transports = if args.loopback {
        info!("Loopback mode, platforms answer in-process");
        loopback_transports(&mut config)
    } else {
        BTreeMap::new()
    };

    let bridge = Arc::new(Bridge::start(config, transports).context("Failed to start bridge")?);

    let socket_path = args.socket.clone().unwrap_or_else(default_socket_path);
    info!(socket_path = ?socket_path, "Socket path");

    let server = DaemonServer::new(socket_path, Arc::clone(&bridge), ServerConfig::default());
    let listener = server.bind()?;

    // Setup signal handlers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        let _ = shutdown_tx.send(true);
    });

    if !bridge.wait_until_connected(Duration::from_secs(5)).await {
        warn!("Not every platform is connected yet, continuing");
    }
    info!("Ready to accept connections");

    let result = server.run(listener, shutdown_rx).await;

    info!("Shutting down...");
    server::log_metrics(&bridge);
    bridge.shutdown().await;

    match result {
        Ok(()) => {
            info!(
                connections = server.connection_count(),
                "Bridge daemon stopped cleanly"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
