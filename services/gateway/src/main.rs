// Gateway service main entry point.
use anyhow::{Context, Result};
use gateway::config::GatewayConfig;
use gateway::observability;
use gateway::tcp::{self, Handlers};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use viaduct_backend::MockBackend;

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::from_env_or_yaml()?;
    let prometheus = observability::init_observability();
    tokio::spawn(observability::serve_metrics(prometheus, config.metrics_bind));

    // The in-memory backend keeps the gateway runnable out of the box;
    // real deployments wire their own source/sink here.
    let backend = Arc::new(MockBackend::new());
    let handlers = Handlers::from_backend(backend);

    let listener = TcpListener::bind(config.listen_bind)
        .await
        .context("bind TCP listener")?;
    tracing::info!(addr = %listener.local_addr()?, "gateway listening");

    let shutdown = CancellationToken::new();
    let accept_task = {
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(err) = tcp::serve(listener, handlers, config, shutdown).await {
                tracing::warn!(error = %err, "accept loop exited");
            }
        })
    };

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    shutdown.cancel();
    accept_task.abort();
    tracing::info!("gateway stopped");
    Ok(())
}
