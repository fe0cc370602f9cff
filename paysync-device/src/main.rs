//! PaySync device agent
//!
//! Submits captured bank transactions to every configured server, keeps the
//! local approval mirror in sync and reconciles orphaned credits.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paysync_core::realtime::{RealtimeSupervisor, ServerRegistry};
use paysync_core::source::JsonLinesSource;
use paysync_core::sync::{ActionOutcome, ActionQueue, SyncEngine};
use paysync_core::{LocalStore, OrphanStatus, OrphanStore, TransactionIngestor};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "paysync-device")]
#[command(about = "Payment capture and reconciliation agent", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "paysync-device.toml")]
    config: PathBuf,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent: realtime channels, periodic sync and transaction ingest
    Run {
        /// Read transactions (one JSON object per line) from this file instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Run one sync cycle against every server
    Sync,

    /// List orphaned transactions
    Orphans {
        /// Only show orphans in this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Mark a pending orphan as ignored
    IgnoreOrphan {
        /// Orphan ID
        id: i64,
    },

    /// Mark a pending orphan as resolved by hand
    ResolveOrphan {
        /// Orphan ID
        id: i64,
    },

    /// Approve a pending approval on a server
    Approve {
        /// Server ID
        server: String,
        /// Approval ID
        id: i64,
    },

    /// Reject a pending approval on a server
    Reject {
        /// Server ID
        server: String,
        /// Approval ID
        id: i64,
        /// Reason recorded with the rejection
        #[arg(long)]
        reason: String,
    },

    /// Show actions waiting to be delivered
    Queue,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = config::DeviceConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(database) = cli.database {
        cfg.storage_path = database;
    }
    cfg.validate()?;

    let store = LocalStore::open(&cfg.storage_path)?;

    match cli.command {
        Commands::Run { input } => run(cfg, store, input).await?,
        Commands::Sync => {
            let registry = registry(&cfg, store)?;
            for (server_id, result) in registry.sync_all().await {
                match result {
                    Ok(report) => println!(
                        "{}: pushed {} (failed {}), pulled {} (discarded {}), reconciled {}, version {}",
                        server_id,
                        report.pushed,
                        report.push_failed,
                        report.pulled,
                        report.discarded,
                        report.reconciled,
                        report.last_synced_version
                    ),
                    Err(e) => println!("{}: sync failed: {}", server_id, e),
                }
            }
        }
        Commands::Orphans { status } => {
            let status = status
                .map(|s| OrphanStatus::parse(&s).with_context(|| format!("unknown status {:?}", s)))
                .transpose()?;
            let orphans = OrphanStore::new(store).list(status)?;
            if orphans.is_empty() {
                println!("No orphans");
            }
            for orphan in orphans {
                let tx = &orphan.transaction;
                println!(
                    "#{} {} {} {} {} observed {}{}",
                    orphan.id,
                    orphan.status.as_str(),
                    tx.bank_code,
                    tx.direction.as_str(),
                    tx.amount,
                    tx.observed_at_ms,
                    orphan
                        .matched_order_id
                        .as_deref()
                        .map(|order| format!(" -> order {}", order))
                        .unwrap_or_default()
                );
            }
        }
        Commands::IgnoreOrphan { id } => {
            if OrphanStore::new(store).mark_ignored(id)? {
                println!("Orphan {} ignored", id);
            } else {
                println!("Orphan {} is not pending", id);
            }
        }
        Commands::ResolveOrphan { id } => {
            if OrphanStore::new(store).mark_resolved(id)? {
                println!("Orphan {} resolved", id);
            } else {
                println!("Orphan {} is not pending", id);
            }
        }
        Commands::Approve { server, id } => {
            let engine = engine(&cfg, store, &server)?;
            report_action(id, engine.approve(id).await?);
        }
        Commands::Reject { server, id, reason } => {
            let engine = engine(&cfg, store, &server)?;
            report_action(id, engine.reject(id, &reason).await?);
        }
        Commands::Queue => {
            let pending = ActionQueue::new(store).all()?;
            if pending.is_empty() {
                println!("Queue is empty");
            }
            for action in pending {
                println!(
                    "{} approval {} {} attempts {}{}",
                    action.server_id,
                    action.approval_id,
                    action.action.kind(),
                    action.attempts,
                    action
                        .last_error
                        .map(|e| format!(" last error: {}", e))
                        .unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}

fn registry(cfg: &config::DeviceConfig, store: LocalStore) -> Result<ServerRegistry> {
    if cfg.servers.is_empty() {
        anyhow::bail!("no servers configured");
    }
    Ok(ServerRegistry::from_endpoints(
        cfg.servers.clone(),
        &cfg.device_id,
        store,
    )?)
}

fn engine(cfg: &config::DeviceConfig, store: LocalStore, server: &str) -> Result<Arc<SyncEngine>> {
    registry(cfg, store)?
        .engine(server)
        .with_context(|| format!("unknown server {:?}", server))
}

fn report_action(id: i64, outcome: ActionOutcome) {
    match outcome {
        ActionOutcome::Applied(status) => println!("Approval {} is now {}", id, status.as_str()),
        ActionOutcome::Queued => println!("Server unreachable; approval {} queued", id),
    }
}

async fn run(cfg: config::DeviceConfig, store: LocalStore, input: Option<PathBuf>) -> Result<()> {
    info!(device_id = %cfg.device_id, servers = cfg.servers.len(), "Starting PaySync device agent");

    let registry = Arc::new(registry(&cfg, store)?);
    let ingestor = TransactionIngestor::new(
        registry.engines().cloned().collect(),
        registry.orphans().clone(),
    );
    let supervisor = RealtimeSupervisor::start(
        registry.clone(),
        &cfg.device_id,
        cfg.supervisor_settings(),
    )?;

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let cancel = supervisor.cancellation_token();
    let ingest = tokio::spawn(async move {
        if let Err(e) = ingestor.run(JsonLinesSource::new(reader), cancel).await {
            error!(error = %e, "Transaction ingest stopped");
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    for connection in supervisor.connection_states() {
        info!(
            server = %connection.server_id,
            state = ?connection.state,
            last_error = connection.last_error.as_deref().unwrap_or(""),
            "Connection state at shutdown"
        );
    }
    supervisor.shutdown().await;
    if let Err(e) = ingest.await {
        error!(error = %e, "Ingest task failed");
    }

    info!("Device agent stopped");
    Ok(())
}
