//! # conclaved - Conclave daemon
//!
//! Answers multicast discovery, hosts trust sessions driven by the local
//! CLI, and serves the peer-facing API used during cluster formation.
//!
//! ## Architecture
//! ```text
//! CLI ──ws──► control socket ──► session ◄── peers (mutual TLS REST)
//!                                   │
//!                             multicast responder
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use conclaved::config::{AppConfig, Overrides};
use conclaved::state::AppState;
use conclaved::{control, routes, tls};

/// Conclave daemon - discovery, trust sessions and cluster formation
#[derive(Parser, Debug)]
#[command(name = "conclaved")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/conclaved.toml", env = "CONCLAVE_CONFIG")]
    config: String,

    /// Peer-facing listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Local control socket address (overrides config)
    #[arg(long, env = "CONTROL_ADDR")]
    control: Option<String>,

    /// State directory (overrides config)
    #[arg(long, env = "STATE_DIR")]
    state_dir: Option<String>,

    /// System name (overrides config)
    #[arg(long, env = "CONCLAVE_NAME")]
    name: Option<String>,

    /// Address advertised to peers (overrides config)
    #[arg(long, env = "CONCLAVE_ADDRESS")]
    address: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            listen: self.listen.clone(),
            control: self.control.clone(),
            state_dir: self.state_dir.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🏛️ Starting conclaved v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args.overrides())?;
    info!("📋 Configuration loaded from {}", args.config);

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Initialize application state
    let state = AppState::new(config.clone())?;

    // Local control socket for the CLI
    let control_listener = tokio::net::TcpListener::bind(&config.control_addr)
        .await
        .with_context(|| format!("Failed to bind control socket {}", config.control_addr))?;
    info!("🔌 Control socket listening on ws://{}", config.control_addr);

    let control_handler = state.handler.clone();
    let control_shutdown = shutdown_tx.subscribe();
    let session_timeout = config.session_timeout();
    tokio::spawn(async move {
        if let Err(e) = control::serve(control_listener, control_handler, session_timeout, control_shutdown).await {
            tracing::error!(error = %e, "Control socket failed");
        }
    });

    // Build router
    let handler = state.handler.clone();
    let identity = handler.tls.clone();
    let app = routes::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("🚀 conclaved listening on https://{}", config.listen_addr);

    // Handle graceful shutdown
    let server_handle = axum_server::Handle::new();
    let shutdown_handle = server_handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("🛑 Shutdown signal received");
        let _ = shutdown_tx.send(());
        let _ = handler.stop_session(Some("Daemon shutting down".into())).await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
    });

    tls::serve(listener, app, &identity, server_handle)
        .await
        .context("Server error")?;

    info!("👋 conclaved shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
