// periodicd: job queue server entry point

use anyhow::Context;
use common::config::Settings;
use common::scheduler::Sched;
use common::server::{Endpoint, Listener, Server};
use common::{storage, telemetry};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(&settings.observability.log_level)?;

    info!(
        listen = %settings.server.listen,
        store = ?settings.store.driver,
        default_timeout_seconds = settings.scheduler.default_timeout_seconds,
        "Starting periodic server"
    );

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let store = storage::connect(&settings.store).await.map_err(|e| {
        error!(error = %e, "Failed to connect to job store");
        e
    })?;

    let sched = Sched::new(store, settings.scheduler.clone())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to recover scheduler state");
            e
        })?;

    let endpoint = Endpoint::parse(&settings.server.listen).map_err(anyhow::Error::msg)?;
    let listener = Listener::bind(&endpoint)
        .await
        .with_context(|| format!("Failed to bind {}", endpoint))?;
    let server = Server::new(listener, sched.clone(), &settings.server);
    info!(addr = ?server.local_endpoint().ok(), "Listening");

    let sched_for_shutdown = Arc::clone(&sched);
    tokio::spawn(async move {
        shutdown_signal().await;
        sched_for_shutdown.shutdown().await;
    });

    server.run().await;

    // Nothing mutates the store once the server has stopped
    sched.close_store().await?;
    info!("Periodic server stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }

    info!("Initiating graceful shutdown");
}
