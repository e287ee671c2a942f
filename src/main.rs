//! GRIDPULSE - Smart-Grid Telemetry Backbone
//!
//! Single binary hosting the backbone pipeline. All components run by
//! default; `--components` narrows the set (they still share the embedded
//! bus, cache, and store within the process).
//!
//! # Usage
//!
//! ```bash
//! # Run the full backbone
//! cargo run --release
//!
//! # Gateway + processor only, custom bind address
//! cargo run --release -- --components gateway,processor --addr 0.0.0.0:9090
//!
//! # Drive it with the synthetic meter fleet
//! cargo run --release --bin simulate -- --meters 200
//! ```
//!
//! # Environment Variables
//!
//! - `GRIDPULSE_ADDR`: bind address (default `0.0.0.0:8080`)
//! - `GRIDPULSE_DATA_DIR`: sled data directory (default `./data`)
//! - `GRIDPULSE_BASE_PRICE`, `GRIDPULSE_MIN_CHANGE_THRESHOLD`: tariff knobs
//! - `GRIDPULSE_SIGNING_KEY`: WebSocket token signing key
//! - `GRIDPULSE_OPERATOR_KEY`: bearer key for mutating operator endpoints
//! - `GRIDPULSE_CAPACITY_TABLE`: TOML file of regional capacities (kW)
//! - `RUST_LOG`: logging level (default `info`)
//! - `RESET_DB`: set to `true` to wipe persistent data on startup

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gridpulse::alert::AlertEngine;
use gridpulse::bus::Bus;
use gridpulse::cache::Cache;
use gridpulse::config::defaults::{
    BUS_RETENTION_SECS, BUS_RETENTION_SWEEP_SECS, CACHE_SWEEP_SECS, SHUTDOWN_DEADLINE_SECS,
};
use gridpulse::config::AppConfig;
use gridpulse::gateway::GatewayState;
use gridpulse::metrics::Metrics;
use gridpulse::notifier::{Hub, NotifierState};
use gridpulse::processor::StreamProcessor;
use gridpulse::store::Store;
use gridpulse::tariff::TariffEngine;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "gridpulse")]
#[command(about = "GRIDPULSE Smart-Grid Telemetry Backbone")]
#[command(version)]
struct CliArgs {
    /// Override the server address (default: "0.0.0.0:8080")
    #[arg(short, long)]
    addr: Option<String>,

    /// Comma-separated component set to run
    /// (gateway,processor,tariff,alerts,notifier). Default: all.
    #[arg(long, value_delimiter = ',')]
    components: Vec<Component>,

    /// Reset all persistent data on startup.
    /// WARNING: This is destructive and cannot be undone!
    /// Can also be set via RESET_DB=true environment variable.
    #[arg(long)]
    reset_db: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
enum Component {
    Gateway,
    Processor,
    Tariff,
    Alerts,
    Notifier,
}

/// Task identification for supervisor logging.
#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    StreamProcessor,
    TariffEngine,
    AlertEngine,
    NotifierFanout,
    CacheSweeper,
    BusRetention,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::StreamProcessor => write!(f, "StreamProcessor"),
            TaskName::TariffEngine => write!(f, "TariffEngine"),
            TaskName::AlertEngine => write!(f, "AlertEngine"),
            TaskName::NotifierFanout => write!(f, "NotifierFanout"),
            TaskName::CacheSweeper => write!(f, "CacheSweeper"),
            TaskName::BusRetention => write!(f, "BusRetention"),
        }
    }
}

// ============================================================================
// Database Reset
// ============================================================================

/// Check if database reset is requested via CLI flag or environment variable.
fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    if let Ok(val) = std::env::var("RESET_DB") {
        let val = val.to_lowercase();
        return val == "true" || val == "1" || val == "yes";
    }
    false
}

/// Remove the data directory before any storage initialization.
fn reset_data_directory(data_dir: &str) -> Result<()> {
    let path = std::path::Path::new(data_dir);
    if !path.exists() {
        info!("Data directory does not exist, nothing to reset");
        return Ok(());
    }
    warn!("RESET_DB detected, removing {}", path.display());
    std::fs::remove_dir_all(path).context("Failed to remove data directory")?;
    warn!("Data directory removed; a fresh database will be created on startup");
    Ok(())
}

// ============================================================================
// Backbone Runner
// ============================================================================

async fn run_backbone(
    config: AppConfig,
    components: HashSet<Component>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("🚀 Starting GRIDPULSE telemetry backbone");
    info!("   Components: {:?}", components);
    info!("");

    // Shared infrastructure
    let bus = Arc::new(Bus::new(config.partitions, config.partition_high_water));
    let cache = Arc::new(Cache::new());
    let metrics = Arc::new(Metrics::new());

    info!("💾 Opening store at {}", config.data_dir);
    let store = Store::open(std::path::Path::new(&config.data_dir).join("gridpulse.db"))
        .context("Failed to open store")?;
    info!("✓ Store opened");

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    let mut app = axum::Router::new();

    // Gateway
    if components.contains(&Component::Gateway) {
        let state = GatewayState::new(Arc::clone(&bus), Arc::clone(&cache), Arc::clone(&metrics));
        app = app.merge(gridpulse::gateway::router(state));
        info!("✓ Gateway routes mounted");
    }

    // Stream processor
    if components.contains(&Component::Processor) {
        let processor = StreamProcessor::new(
            Arc::clone(&bus),
            store.clone(),
            Arc::clone(&cache),
            Arc::clone(&metrics),
            &config,
        );
        let cancel = cancel_token.clone();
        task_set.spawn(async move {
            processor.run(cancel).await;
            Ok(TaskName::StreamProcessor)
        });
        info!("✓ Stream processor task spawned");
    }

    // Tariff engine
    if components.contains(&Component::Tariff) {
        let engine = TariffEngine::new(
            Arc::clone(&bus),
            store.clone(),
            Arc::clone(&cache),
            Arc::clone(&metrics),
            &config,
        );
        let preloaded = engine.preload().await.context("Tariff preload failed")?;
        info!("✓ Tariff engine preloaded {preloaded} regional tariffs");
        app = app.merge(gridpulse::tariff::router(engine.clone()));
        let cancel = cancel_token.clone();
        task_set.spawn(async move {
            engine.run(cancel).await;
            Ok(TaskName::TariffEngine)
        });
    }

    // Alert engine
    if components.contains(&Component::Alerts) {
        let engine = AlertEngine::new(
            Arc::clone(&bus),
            store.clone(),
            Arc::clone(&cache),
            Arc::clone(&metrics),
        );
        app = app.merge(gridpulse::alert::router(engine.clone()));
        let cancel = cancel_token.clone();
        task_set.spawn(async move {
            engine.run(cancel).await;
            Ok(TaskName::AlertEngine)
        });
        info!("✓ Alert engine task spawned");
    }

    // Notifier
    if components.contains(&Component::Notifier) {
        let hub = Arc::new(Hub::new(config.max_ws_connections, Arc::clone(&metrics)));
        let state = NotifierState::new(Arc::clone(&hub), &config.signing_key);
        app = app.merge(gridpulse::notifier::router(state));
        let fanout_bus = Arc::clone(&bus);
        let cancel = cancel_token.clone();
        task_set.spawn(async move {
            gridpulse::notifier::run_fanout(fanout_bus, hub, cancel).await;
            Ok(TaskName::NotifierFanout)
        });
        info!("✓ Notifier mounted (cap {} connections)", config.max_ws_connections);
    }

    // Cache sweeper
    {
        let sweep_cache = Arc::clone(&cache);
        let cancel = cancel_token.clone();
        task_set.spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(CACHE_SWEEP_SECS));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(TaskName::CacheSweeper),
                    _ = tick.tick() => {
                        let evicted = sweep_cache.sweep();
                        if evicted > 0 {
                            tracing::debug!("[CacheSweeper] Evicted {evicted} expired entries");
                        }
                    }
                }
            }
        });
    }

    // Bus retention sweeper
    {
        let sweep_bus = Arc::clone(&bus);
        let cancel = cancel_token.clone();
        task_set.spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(BUS_RETENTION_SWEEP_SECS));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(TaskName::BusRetention),
                    _ = tick.tick() => {
                        let cutoff = Utc::now() - chrono::Duration::seconds(BUS_RETENTION_SECS);
                        let truncated = sweep_bus.sweep_retention(cutoff);
                        if truncated > 0 {
                            tracing::debug!("[BusRetention] Truncated {truncated} records");
                        }
                    }
                }
            }
        });
    }

    // HTTP server
    {
        let addr = config.server_addr.clone();
        let cancel = cancel_token.clone();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        info!("🌐 HTTP server listening on {addr}");
        task_set.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
                .context("HTTP server failed")?;
            Ok(TaskName::HttpServer)
        });
    }

    // Supervisor loop
    info!("🔒 Supervisor: all tasks spawned, monitoring...");
    let mut failure: Option<anyhow::Error> = None;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("🛑 Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("🔒 Supervisor: task {task_name} completed normally");
                    }
                    Some(Ok(Err(e))) => {
                        error!("🔒 Supervisor: task failed: {e:#}");
                        cancel_token.cancel();
                        failure = Some(e);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("🔒 Supervisor: task panicked: {e}");
                        cancel_token.cancel();
                        failure = Some(anyhow::anyhow!("task panicked: {e}"));
                        break;
                    }
                    None => {
                        info!("🔒 Supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Bounded drain: consumers stop, the processor performs its final
    // flush, then the store syncs to disk.
    let deadline = Duration::from_secs(SHUTDOWN_DEADLINE_SECS);
    if tokio::time::timeout(deadline, async {
        while task_set.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Shutdown deadline ({deadline:?}) exceeded, aborting remaining tasks");
        task_set.abort_all();
    }

    if let Err(e) = store.flush() {
        warn!("Final store flush failed: {e}");
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Resolve on SIGINT (Ctrl+C) or, on Unix, SIGTERM, whichever fires
/// first. Process supervisors (systemd, Kubernetes) send SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler ({e}), SIGINT only");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let mut config = AppConfig::from_env();
    if let Some(addr) = args.addr {
        config.server_addr = addr;
    }

    if should_reset_db(args.reset_db) {
        if let Err(e) = reset_data_directory(&config.data_dir) {
            error!("Reset failed: {e:#}");
            return std::process::ExitCode::from(1);
        }
    }

    let components: HashSet<Component> = if args.components.is_empty() {
        [
            Component::Gateway,
            Component::Processor,
            Component::Tariff,
            Component::Alerts,
            Component::Notifier,
        ]
        .into_iter()
        .collect()
    } else {
        args.components.into_iter().collect()
    };

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  GRIDPULSE - Smart-Grid Telemetry Backbone");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("");

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("🛑 Shutdown signal received, initiating shutdown...");
        shutdown_token.cancel();
    });

    match run_backbone(config, components, cancel_token).await {
        Ok(()) => {
            info!("");
            info!("✓ GRIDPULSE shutdown complete");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            error!("GRIDPULSE terminated: {e:#}");
            std::process::ExitCode::from(1)
        }
    }
}
