//! # ctrl-demo
//!
//! Runs the demo controller against an in-memory object store.
//!
//! ## Startup
//!
//! 1. **Config** - defaults, or a TOML file passed with `--config`
//! 2. **Store** - seeded with one Deployment
//! 3. **Manager** - demo controller registered, signal handlers installed
//! 4. **Run** - until SIGINT/SIGTERM, then drain within `shutdown_timeout_ms`

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ctrl::ctrl_events::{InMemoryObjectStore, TracingListWatch};
use ctrl::ctrl_reconciler::{ControllerManager, ManagerConfig, install_signal_handlers};
use ctrl::demo;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Keep one ReplicaSet per Deployment in an in-memory store.
#[derive(Debug, Parser)]
#[command(name = "ctrl-demo", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Concurrent reconciles for the demo controller.
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = match &cli.config {
        Some(path) => ManagerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.controller.max_concurrent_reconciles = workers;
    }
    config.validate().context("Invalid configuration")?;

    let store = InMemoryObjectStore::new_arc();
    store
        .create(demo::deployment("default", "web", 2))
        .await
        .context("Failed to seed store")?;

    let manager = ControllerManager::new(
        Arc::new(TracingListWatch::new(Arc::clone(&store))),
        config.clone(),
    )
    .context("Failed to create controller manager")?;
    demo::register(&manager, Arc::clone(&store), config.controller.clone())
        .context("Failed to register demo controller")?;

    let token = CancellationToken::new();
    let signals = install_signal_handlers(token.clone());
    tokio::spawn(scale_periodically(Arc::clone(&store), token.clone()));

    info!("ctrl-demo running. Press Ctrl+C to stop.");
    manager
        .start(token)
        .await
        .context("Controller manager failed")?;

    if let Ok(Some(signal)) = signals.await {
        info!(signal = %signal, "Shut down after signal");
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

/// Bump the seeded Deployment's replicas every few seconds so the
/// controller has something to converge.
async fn scale_periodically(store: Arc<InMemoryObjectStore>, token: CancellationToken) {
    let key = demo::deployment("default", "web", 0).key();
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;
    let mut replicas = 2u64;
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = interval.tick() => {}
        }
        replicas = replicas % 5 + 1;
        let Some(current) = store.get(demo::DEPLOYMENT, &key).await else {
            return;
        };
        let scaled = current.with_data(serde_json::json!({ "replicas": replicas }));
        if let Err(e) = store.update(scaled).await {
            warn!(error = %e, "Failed to scale demo Deployment");
        }
    }
}
