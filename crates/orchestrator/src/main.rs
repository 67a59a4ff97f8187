use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use kiln_core::lifecycle::ExecutionMode;
use kiln_core::worker::WorkerConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_orchestrator::{InMemoryJobStore, Orchestrator, OrchestratorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "kiln_orchestrator=info,kiln_process=info,kiln_exec=info,kiln_events=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = OrchestratorConfig::from_env();
    tracing::info!(
        port_start = config.port_range.start,
        port_end = config.port_range.end,
        health_interval_secs = config.health_interval.as_secs(),
        "Loaded orchestrator configuration",
    );

    let workers = match &config.workers_file {
        Some(path) => load_workers(path)?,
        None => Vec::new(),
    };

    // --- Orchestrator ---
    let orchestrator = Orchestrator::start(config, Arc::new(InMemoryJobStore::new()));

    for worker in &workers {
        if worker.execution_mode != ExecutionMode::Server {
            tracing::info!(worker_id = %worker.id, "Skipping CLI worker, it runs per job");
            continue;
        }
        match orchestrator.start_server_worker(worker).await {
            Ok(snapshot) => tracing::info!(
                worker_id = %snapshot.worker_id,
                pid = snapshot.pid,
                port = snapshot.port,
                "Server worker started",
            ),
            Err(e) => tracing::error!(worker_id = %worker.id, error = %e, "Failed to start server worker"),
        }
    }

    shutdown_signal().await;

    orchestrator.shutdown().await;
    Ok(())
}

/// Read the JSON list of worker configurations.
fn load_workers(path: &Path) -> anyhow::Result<Vec<WorkerConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workers file {}", path.display()))?;
    let workers: Vec<WorkerConfig> = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid workers file {}", path.display()))?;
    tracing::info!(count = workers.len(), path = %path.display(), "Loaded worker configurations");
    Ok(workers)
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
