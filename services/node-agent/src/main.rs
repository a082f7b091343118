//! babel node agent
//!
//! Serves the orchestrator's control channel for one language and keeps the
//! local compositor converged to the pushed settings.
//!
//! ## Architecture
//!
//! - **Control server**: answers `ping`, `set config`, `run media`,
//!   `stop media` and `get info`
//! - **Reconciler**: re-verifies the compositor every tick
//! - **Media player**: schedules end-of-clip callbacks

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use babel_node_agent::{config, server, MockCompositor, NodeAgent};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to BABEL_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting babel node agent");
    info!(
        lang = %config.lang,
        listen_addr = %config.listen_addr,
        media_dir = %config.media_dir.display(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    warn!("No compositor client configured; driving the in-memory compositor");
    let compositor = Arc::new(MockCompositor::with_defaults());
    let agent = Arc::new(NodeAgent::new(&config, compositor));
    let workers = agent.spawn(shutdown_rx.clone());

    let app = server::create_router(agent.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for control connections");

    let server_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    loop {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                    info!("Control server shutting down");
                })
                .await
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(5);
    for (name, handle) in workers {
        if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
            warn!(worker = name, "Worker did not shut down in time");
        }
    }

    if let Err(e) = agent.player().stop_media().await {
        warn!(error = %e, "Could not take media off air");
    }
    info!("Node agent shutdown complete");
    Ok(())
}
