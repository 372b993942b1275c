//! pilot-fleet worker daemon
//!
//! Tunnels every attached device's agent port to a local endpoint and runs
//! the device loops that claim and execute jobs from the backend.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pf_core::config::{self, WorkerConfig};
use pf_core::idevice::IdeviceTools;
use pf_core::store::ItunesStore;
use pf_tunnel::{InetcatMux, TunnelManager};
use pf_worker::{HttpBackend, Supervisor};

#[derive(Parser)]
#[command(name = "pf-worker")]
#[command(about = "pilot-fleet worker - runs app jobs on attached devices")]
#[command(version)]
struct Args {
    /// Backend base URL (overrides config)
    #[arg(short, long)]
    backend: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name to register the worker under (defaults to hostname)
    #[arg(long)]
    worker_name: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long, alias = "debug")]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("pilot-fleet worker starting...");

    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                WorkerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            WorkerConfig::default()
        }
    };

    if let Some(backend) = args.backend {
        config.backend_url = backend;
    }
    if let Some(name) = args.worker_name {
        config.worker_name = Some(name);
    }
    tracing::info!("Backend: {}", config.backend_url);

    tokio::fs::create_dir_all(&config.archive_dir)
        .await
        .with_context(|| format!("Failed to create archive directory {:?}", config.archive_dir))?;

    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel_clone.cancel();
    });

    let tunnels = TunnelManager::new(Arc::new(InetcatMux::new()), config.tunnel.clone());
    let tunnel_handle = tunnels.handle();
    let tunnel_task = tokio::spawn(tunnels.run(cancel.clone()));

    let backend = HttpBackend::new(config.backend_url.clone()).context("Failed to create backend client")?;
    let store = ItunesStore::new(config.store_url.clone()).context("Failed to create store client")?;

    let supervisor = Supervisor::new(
        config.clone(),
        Arc::new(IdeviceTools::new()),
        Arc::new(backend),
        Arc::new(store),
        tunnel_handle,
    );
    let result = supervisor.run(cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = tunnel_task.await {
        tracing::warn!("Tunnel manager task failed: {}", e);
    }

    result.context("Worker stopped")?;
    tracing::info!("Worker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
