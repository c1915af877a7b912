//! uns-gateway - Unified-Namespace MQTT gateway
//!
//! Ingests messages from multiple brokers, persists them into a
//! size-bounded analytical store, republishes rule-derived messages, raises
//! conditional alerts, and serves live and historical views to browser
//! clients over HTTP and WebSocket.
//!
//! # Usage
//!
//! ```bash
//! # Run against a local broker
//! MQTT_BROKER_PLANT=mqtt://localhost:1883 ADMIN_TOKEN=dev cargo run --release
//!
//! # With a config file
//! cargo run --release -- --config uns-gateway.toml
//! ```
//!
//! # Environment Variables
//!
//! - `PORT`, `BASE_PATH`, `DB_PATH`, `DB_SIZE_LIMIT_MB`
//! - `MQTT_BROKER_<ID>`: per-broker connection string
//! - `LLM_API_KEY` / `LLM_BASE_URL` / `LLM_MODEL`: chat agent endpoint
//! - `LLM_TOOL_ENABLE_*`: tool catalogue capability flags
//! - `RUST_LOG`: logging filter (default: info)
//! - `RESET_DB`: set to "true" to wipe persistent data on startup

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use uns_gateway::agent::{AgentRunner, ChatBackend, LlmClient, ToolCatalog};
use uns_gateway::alerts::AlertEngine;
use uns_gateway::api::create_app;
use uns_gateway::config::AppConfig;
use uns_gateway::hub::{Hub, ServerMessage};
use uns_gateway::ingest;
use uns_gateway::mapper::MapperEngine;
use uns_gateway::mqtt::BrokerPool;
use uns_gateway::sandbox::Sandbox;
use uns_gateway::state::AppContext;
use uns_gateway::store::{pruner, Store};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "uns-gateway")]
#[command(about = "Unified-Namespace MQTT gateway")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config file (also honours UNS_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the server bind address (e.g. "0.0.0.0:8080")
    #[arg(short, long)]
    addr: Option<String>,

    /// Wipe all persistent data on startup.
    /// WARNING: destructive and cannot be undone.
    /// Can also be set via RESET_DB=true.
    #[arg(long)]
    reset_db: bool,
}

/// Check CLI flag or RESET_DB env var.
fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    match std::env::var("RESET_DB") {
        Ok(val) => matches!(val.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => false,
    }
}

fn reset_database(db_path: &std::path::Path) -> Result<()> {
    warn!("RESET_DB detected - wiping persistent data");
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db_path.as_os_str().to_owned();
        path.push(suffix);
        let path = PathBuf::from(path);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            warn!(path = %path.display(), "Removed");
        }
    }
    Ok(())
}

/// Task identification for supervisor logging.
#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    Ingest,
    Hub,
    MapperEngine,
    AlertEngine,
    Pruner,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::Ingest => write!(f, "Ingest"),
            TaskName::Hub => write!(f, "Hub"),
            TaskName::MapperEngine => write!(f, "MapperEngine"),
            TaskName::AlertEngine => write!(f, "AlertEngine"),
            TaskName::Pruner => write!(f, "Pruner"),
        }
    }
}

// ============================================================================
// Gateway assembly
// ============================================================================

async fn run_gateway(config: AppConfig, cancel: CancellationToken) -> Result<()> {
    let config = Arc::new(config);

    // Storage
    let store = Arc::new(
        Store::open(&config.db_path, config.db_size_limit_bytes)
            .context("failed to open analytical store")?,
    );

    // Bootstrap identity
    if let Some(token) = &config.admin_token {
        store
            .ensure_user("admin", token, true)
            .context("failed to seed admin user")?;
        info!("Admin user seeded from ADMIN_TOKEN");
    } else if store.list_users().context("failed to list users")?.is_empty() {
        warn!("No users and no ADMIN_TOKEN set; the HTTP surface will reject everything");
    }

    // Broker pool
    let pool = Arc::new(BrokerPool::new(&config.brokers).context("invalid broker config")?);

    // Hub
    let hub = Arc::new(Hub::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        config.hub_rate_cap_per_sec,
    ));

    // Ingest fan-in / fan-out
    let (ingest_tx, ingest_rx, fanout) = ingest::channels();

    // Sandbox factory bound to the store file
    let sandbox = Sandbox::new(&config.db_path, config.sandbox_limits);

    // LLM backend (optional)
    let backend: Option<Arc<dyn ChatBackend>> = match &config.llm {
        Some(settings) => {
            info!(model = %settings.model, "LLM endpoint configured");
            Some(Arc::new(
                LlmClient::new(settings.clone()).context("failed to build LLM client")?,
            ))
        }
        None => {
            info!("No LLM endpoint configured; chat and enrichment disabled");
            None
        }
    };

    // Engines
    let mapper = Arc::new(
        MapperEngine::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            sandbox.clone(),
            Arc::clone(&hub),
            ingest_tx.clone(),
            config.mapper_max_hop,
            config.max_saved_mapper_versions,
        )
        .context("mapper config invalid")?,
    );

    let alerts = AlertEngine::new(
        Arc::clone(&store),
        sandbox.clone(),
        Arc::clone(&hub),
        backend.clone(),
        config.alert_debounce,
    )
    .context("failed to initialize alert engine")?;

    // Agent
    let catalog = Arc::new(ToolCatalog::build(
        Arc::clone(&store),
        Arc::clone(&pool),
        Arc::clone(&mapper),
        sandbox.clone(),
        config.tool_capabilities,
    ));
    let agent = Arc::new(AgentRunner::new(
        backend,
        catalog,
        Arc::clone(&store),
        Arc::clone(&hub),
        config.chat_max_steps,
    ));

    let ctx = AppContext {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        pool: Arc::clone(&pool),
        hub: Arc::clone(&hub),
        mapper: Arc::clone(&mapper),
        alerts: Arc::clone(&alerts),
        sandbox,
        agent,
        started_at: chrono::Utc::now(),
    };

    // HTTP listener
    let app = create_app(ctx);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "HTTP server listening");

    // ========================================================================
    // Supervisor
    // ========================================================================

    info!("Supervisor: spawning tasks");
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Task: HTTP server
    let http_cancel = cancel.clone();
    task_set.spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                http_cancel.cancelled().await;
                info!("[HttpServer] Shutdown signal received");
            })
            .await
            .context("HTTP server error")?;
        Ok(TaskName::HttpServer)
    });

    // Task: ingest pipeline
    let ingest_cancel = cancel.clone();
    let ingest_store = Arc::clone(&store);
    let ingest_fanout = fanout.clone();
    task_set.spawn(async move {
        ingest::run_ingest(ingest_store, ingest_rx, ingest_fanout, ingest_cancel).await;
        Ok(TaskName::Ingest)
    });

    // Task: hub event forwarding
    let hub_cancel = cancel.clone();
    let hub_task = Arc::clone(&hub);
    let hub_rx = fanout.subscribe();
    task_set.spawn(async move {
        hub_task.run(hub_rx, hub_cancel).await;
        Ok(TaskName::Hub)
    });

    // Task: mapper engine
    let mapper_cancel = cancel.clone();
    let mapper_task = Arc::clone(&mapper);
    let mapper_rx = fanout.subscribe();
    task_set.spawn(async move {
        mapper_task.run(mapper_rx, mapper_cancel).await;
        Ok(TaskName::MapperEngine)
    });

    // Task: alert engine
    let alerts_cancel = cancel.clone();
    let alerts_task = Arc::clone(&alerts);
    let alerts_rx = fanout.subscribe();
    task_set.spawn(async move {
        alerts_task.run(alerts_rx, alerts_cancel).await;
        Ok(TaskName::AlertEngine)
    });

    // Task: retention pruner
    let pruner_cancel = cancel.clone();
    let pruner_store = Arc::clone(&store);
    let pruner_hub = Arc::clone(&hub);
    let status_store = Arc::clone(&store);
    task_set.spawn(async move {
        pruner::run_pruner(
            pruner_store,
            Duration::from_secs(1),
            pruner_cancel,
            move || {
                if let Ok(stats) = status_store.stats() {
                    if let Ok(value) = serde_json::to_value(stats) {
                        pruner_hub.broadcast(&ServerMessage::DbStatus { stats: value });
                    }
                }
            },
        )
        .await;
        Ok(TaskName::Pruner)
    });

    // Broker connections last, once every consumer is wired up.
    pool.start_all(ingest_tx);

    // Supervisor loop: any task failure cancels the rest.
    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break Ok(());
            }
            joined = task_set.join_next() => {
                match joined {
                    Some(Ok(Ok(task_name))) => {
                        info!("Supervisor: task {task_name} completed normally");
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "Supervisor: task failed");
                        break Err(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Supervisor: task panicked");
                        break Err(anyhow::anyhow!("task panicked: {e}"));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        break Ok(());
                    }
                }
            }
        }
    };

    cancel.cancel();
    pool.stop_all().await;
    while task_set.join_next().await.is_some() {}

    result
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    // Config errors are fatal at startup (non-zero exit).
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.listen_addr = addr;
    }

    // Must happen before the store opens.
    if should_reset_db(args.reset_db) {
        reset_database(&config.db_path)?;
    }

    info!("uns-gateway starting");
    info!(
        brokers = config.brokers.len(),
        db = %config.db_path.display(),
        addr = %config.listen_addr,
        "Configuration loaded"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown");
        shutdown.cancel();
    });

    run_gateway(config, cancel).await?;

    info!("uns-gateway shutdown complete");
    Ok(())
}
