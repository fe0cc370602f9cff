//! PaySync reconciliation server
//!
//! Issues unique checkout amounts, verifies and reconciles payment
//! notifications submitted by devices, and serves approvals to devices by
//! version delta and realtime push.

mod allocator;
mod auth;
mod cleanup;
mod config;
mod error;
mod handlers;
mod matcher;
mod orders;
mod rate_limit;
mod server;
mod state;
mod storage;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "paysync-server", about = "PaySync reconciliation server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "paysync-server.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        config::ServerConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        config::ServerConfig::default()
    };

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.storage_path = database;
    }
    cfg.validate()?;

    tracing::info!(
        approval_mode = ?cfg.approval_mode,
        "Starting PaySync server on {}",
        cfg.listen_addr
    );

    let storage = storage::ServerStorage::open(&cfg.storage_path)?;
    let listen_addr = cfg.listen_addr.clone();
    let state = state::AppState::new(cfg, storage);
    let cleanup = cleanup::spawn_cleanup_task(state.clone());
    let app = server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cleanup.abort();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
