//! Mosaic daemon
//!
//! Owns the device ledger and model placements for one host and serves the
//! JSON control plane.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use mosaic_core::config::load_config;
use mosaic_daemon::backend::BackendRegistry;
use mosaic_daemon::engine::Engine;
use mosaic_daemon::ledger::StaticDiscovery;
use mosaic_daemon::server::{self, AppState};

#[derive(Parser, Debug)]
#[command(name = "mosaic-daemon")]
#[command(version, about = "Mosaic daemon - resource-aware multi-model execution")]
struct Args {
    /// Listen address (overrides `daemon.addr`)
    #[arg(long, env = "MOSAIC_ADDR")]
    addr: Option<SocketAddr>,

    /// Config file, layered over the global one
    #[arg(long, env = "MOSAIC_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, env = "MOSAIC_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "MOSAIC_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "MOSAIC_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.daemon.addr = addr;
    }
    if let Some(level) = args.log_level {
        config.daemon.log_level = level;
    }
    config.daemon.log_json |= args.log_json;

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    let log_filter = format!(
        "mosaic_daemon={0},mosaic_core={0},tower_http={0}",
        config.daemon.log_level
    );
    let telemetry = mosaic_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        config.daemon.log_json,
        metrics_endpoint,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.daemon.addr,
        devices = config.devices.len(),
        models = config.models.len(),
        strategy = %config.placement.strategy,
        "Starting mosaic-daemon"
    );

    let discovery = StaticDiscovery::from_config(&config.devices);
    let engine = Engine::from_config(&config, &discovery, BackendRegistry::with_defaults()).await?;
    let listener = TcpListener::bind(config.daemon.addr).await?;

    // Notify systemd that the daemon is ready to serve (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    info!(addr = %config.daemon.addr, "Control plane ready");
    server::serve(listener, AppState::new(Arc::new(engine)), shutdown_signal()).await?;

    telemetry.shutdown();
    info!("Daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        () = terminate => {
            info!("Received SIGTERM shutdown signal");
        }
    }
}
