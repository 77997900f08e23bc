use std::sync::Arc;

use anyhow::Context;

use orchestrator_api::app;
use orchestrator_core::SystemClock;
use orchestrator_infra::{OrchestratorConfig, Sweeper};
use orchestrator_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env();
    let log_format = config.log_format.parse::<LogFormat>();
    orchestrator_observability::init(log_format.clone().unwrap_or_default());
    if let Err(e) = log_format {
        tracing::warn!(error = %e, "falling back to json logs");
    }

    let services = Arc::new(app::services::build_services(config.clone(), Arc::new(SystemClock)));
    let sweeper = Sweeper::spawn(services.orchestrator.clone(), config.sweep_interval)
        .context("failed to start sweeper thread")?;

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app::build_app(services))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tokio::task::spawn_blocking(move || sweeper.shutdown())
        .await
        .context("sweeper did not shut down cleanly")?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
