use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use formaos_ratelimit::background::{
    spawn_mesh_sweeper, spawn_policy_reload, spawn_sweeper, BackgroundTasks,
};
use formaos_ratelimit::config::FormaConfig;
use formaos_ratelimit::http::{AppState, HttpServer};
use formaos_ratelimit::mesh::MeshCounterStore;
use formaos_ratelimit::ratelimit::{
    open_store, LocalCounterStore, PolicyRegistry, PolicySet, RateLimiter,
};

/// Service CLI arguments
#[derive(Parser, Debug)]
#[command(name = "formaos-ratelimit")]
#[command(about = "Fixed-window rate limit decision service", version)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "formaos_ratelimit=debug"; RUST_LOG is used when unset
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(args: &Args) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!("Starting FormaOS rate limit service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = FormaConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let policies = match &config.limiter.policies_path {
        Some(path) => PolicySet::from_file(path)?,
        None => PolicySet::builtin(),
    };
    info!(policies = policies.len(), "Rate limit policies loaded");
    let policies = Arc::new(PolicyRegistry::new(policies));

    // A missing store is not fatal: the limiter runs on local counters
    let (store, cluster) = match open_store(&config.store).await {
        Some(connected) => (Some(connected.store), connected.cluster),
        None => (None, None),
    };
    let local = Arc::new(LocalCounterStore::new());
    let limiter = Arc::new(
        RateLimiter::from_parts(store, local.clone())
            .with_store_timeout(config.limiter.store_timeout())
            .with_warning_cooldown(config.limiter.warning_cooldown()),
    );
    info!(
        distributed = limiter.has_distributed_store(),
        "Rate limiter initialized"
    );

    let mut tasks = BackgroundTasks::new();
    if config.limiter.sweep_interval_secs > 0 {
        let period = std::time::Duration::from_secs(config.limiter.sweep_interval_secs);
        tasks.push(spawn_sweeper(local, period));
        if let Some(cluster) = &cluster {
            tasks.push(spawn_mesh_sweeper(
                MeshCounterStore::new(cluster.clone()),
                period,
            ));
        }
    }
    if let (Some(path), true) = (
        &config.limiter.policies_path,
        config.limiter.policy_reload_interval_secs > 0,
    ) {
        tasks.push(spawn_policy_reload(
            policies.clone(),
            PathBuf::from(path),
            std::time::Duration::from_secs(config.limiter.policy_reload_interval_secs),
        ));
    }

    let server = HttpServer::new(config.server.listen_addr, AppState::new(limiter, policies));
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    tasks.shutdown().await;

    if let Some(cluster) = cluster {
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => {
                if let Err(e) = cluster.shutdown().await {
                    error!(error = %e, "Failed to shut down cluster node");
                }
            }
            Err(_) => warn!("Cluster still in use at shutdown, leaving it to drop"),
        }
    }

    if let Err(e) = &served {
        error!(error = %e, "Rate limit service exited with error");
    }
    served?;

    info!("FormaOS rate limit service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
