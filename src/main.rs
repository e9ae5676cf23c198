//! # patroni-lb
//!
//! Fronts a Patroni-managed PostgreSQL cluster with HAProxy.
//!
//! ## Startup Sequence
//!
//! 1. **Configuration** - TOML file, then flags and environment, then validation
//! 2. **ZooKeeper** - connect, retrying with backoff
//! 3. **Reconcile Loop** - wait for a leader, then keep HAProxy in step with the scope
//!
//! ## Shutdown
//!
//! SIGINT or SIGTERM stops the loop: watches are retired and HAProxy is terminated.
//! Unrecoverable errors end the process with a non-zero status.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use plb_core::{build_snapshot, render, LbConfig};
use plb_reconciler::{LoopConfig, LoopStopper, ReconcileLoop};
use plb_store::{TreeWatcher, ZkStore};
use plb_supervisor::{HaproxySupervisor, SupervisorConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);
    let config = load_config(cli)?;

    match command {
        Commands::Run => run(config).await,
        Commands::Render => render_once(config).await,
    }
}

/// Initialize tracing with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: Cli) -> Result<LbConfig> {
    let mut config = match &cli.config {
        Some(path) => LbConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => LbConfig::default(),
    };
    cli.overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn connect(config: &LbConfig) -> Result<Arc<ZkStore>> {
    let endpoint = config.zookeeper_endpoint();
    let store = ZkStore::connect_with_retry(
        &endpoint,
        config.connect_attempts,
        config.retry_backoff,
        config.max_retry_backoff,
    )
    .await
    .with_context(|| format!("Cannot connect to ZooKeeper at {endpoint}"))?;
    Ok(Arc::new(store))
}

async fn run(config: LbConfig) -> Result<()> {
    info!(
        scope = %config.scope_path(),
        artifact = %config.config_path.display(),
        "patroni-lb starting"
    );

    let store = connect(&config).await?;
    let supervisor = HaproxySupervisor::new(SupervisorConfig::from(&config));
    let mut reconcile_loop =
        ReconcileLoop::new(store, Box::new(supervisor), LoopConfig::from(&config));

    tokio::spawn(stop_on_signal(reconcile_loop.stopper()));

    reconcile_loop.run().await.context("Reconcile loop failed")
}

/// One-shot mirror, snapshot and render, printed to stdout.
async fn render_once(config: LbConfig) -> Result<()> {
    let store = connect(&config).await?;
    let watcher = TreeWatcher::new(store);

    let watched = watcher
        .watch(&config.scope_path())
        .await
        .with_context(|| format!("Failed to read {}", config.scope_path()))?;
    let snapshot = build_snapshot(watched.tree());
    watched.retire().await;

    let rendered = render(&snapshot.context("Invalid cluster state")?, &config.render);
    std::io::stdout()
        .write_all(rendered.as_bytes())
        .context("Failed to write configuration to stdout")
}

async fn stop_on_signal(stopper: LoopStopper) {
    match shutdown_signal().await {
        Ok(()) => {
            info!("Shutdown signal received");
            stopper.stop();
        }
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signals"),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
