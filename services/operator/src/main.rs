//! ttpair operator
//!
//! Watches managed pair documents in the state directory and reconciles
//! each one against its unit agents until interrupted.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ttpair_events::TracingSink;
use ttpair_operator::agent::AgentClient;
use ttpair_operator::cluster::JsonDirStore;
use ttpair_operator::config::Config;
use ttpair_operator::flows::RemoteFlows;
use ttpair_operator::metrics;
use ttpair_operator::pool::{ConnectionPool, EnvCredentialSource};
use ttpair_operator::reconciler::{Backends, Reconciler, ReconcilerSettings};
use ttpair_operator::worker::ReconcileWorker;
use ttpair_reconcile::TransitionTable;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the log level applies from the start
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ttpair operator");
    info!(
        operator_id = %config.operator_id,
        engine_release = %config.engine_release,
        state_dir = %config.state_dir,
        scan_interval_ms = config.scan_interval_ms,
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );

    if config.metrics_port != 0 {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.metrics_port))
            .install()
            .with_context(|| {
                format!("installing metrics exporter on port {}", config.metrics_port)
            })?;
        metrics::register_metrics();
        info!(port = config.metrics_port, "Metrics endpoint listening");
    }

    let transitions = match &config.transitions_path {
        Some(path) => TransitionTable::load(Path::new(path))
            .with_context(|| format!("loading transition table from {}", path))?,
        None => TransitionTable::builtin().context("loading built-in transition table")?,
    };

    let pool = Arc::new(ConnectionPool::new(config.accept_invalid_certs));
    let backends = Backends {
        cluster: Arc::new(JsonDirStore::new(config.state_dir.clone())),
        agent: Arc::new(AgentClient::new(Arc::clone(&pool))),
        flows: Arc::new(RemoteFlows),
        sink: Arc::new(TracingSink),
        transitions: Arc::new(transitions),
        credential_source: Arc::new(EnvCredentialSource::new(config.agent_credentials.clone())),
        pool,
    };
    let reconciler = Arc::new(Reconciler::new(
        ReconcilerSettings::from_config(&config),
        backends,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ReconcileWorker::new(reconciler, config.scan_interval());
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = worker_handle => {
            match result {
                Ok(()) => info!("Reconcile worker exited"),
                Err(e) => error!(error = %e, "Reconcile worker panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Operator shutdown complete");
    Ok(())
}
