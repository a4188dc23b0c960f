use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use shelfsync_api::app::{build_app, services};
use shelfsync_infra::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    shelfsync_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    let services = Arc::new(services::build_services(&settings).await?);
    let app = build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!(addr = %listener.local_addr()?, backend = services.backend.as_str(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining workers");
    services.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
