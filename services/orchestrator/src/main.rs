//! babel orchestrator
//!
//! Serves operator sessions, keeps every language's node configured and
//! drives the media timeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use babel_orchestrator::{
    api,
    auth::{CredentialSource, CredentialSync, FileCredentialSource, StaticCredentialSource},
    broadcast::Broadcaster,
    config,
    importer::{ConfigSource, JsonFileSource},
    infrastructure::StaticProvisioner,
    logring::LogRing,
    monitor::FleetMonitor,
    state::AppState,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;
    let logs = LogRing::new(config.log_ring_capacity);

    // Prefer RUST_LOG, fall back to BABEL_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .with(logs.layer())
        .init();

    info!("Starting babel orchestrator");
    info!(listen_addr = %config.listen_addr, nodes = config.nodes.len(), "Configuration loaded");

    let credentials: Arc<dyn CredentialSource> = match &config.credentials_file {
        Some(path) => Arc::new(FileCredentialSource::new(path)),
        None => {
            warn!("No credentials file configured; only anonymous sessions can connect");
            Arc::new(StaticCredentialSource::default())
        }
    };
    let importer = config
        .config_file
        .clone()
        .map(|path| Arc::new(JsonFileSource::new(path)) as Arc<dyn ConfigSource>);

    let state = AppState::new(
        config.clone(),
        logs,
        Box::new(StaticProvisioner::new(config.nodes.clone())),
        importer,
    );

    let reconnected = state.restore_snapshot().await;
    info!(
        lifecycle = %state.registry().lifecycle(),
        reconnected,
        "Startup state ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers: Vec<(&str, JoinHandle<()>)> = Vec::new();

    let sync = CredentialSync::new(credentials, state.users().clone(), config.credential_sync_interval);
    if let Err(e) = sync.sync_once().await {
        error!(error = %e, "Initial credential sync failed");
    }
    workers.push(("credential sync", tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { sync.run(shutdown_rx).await }
    })));

    let broadcaster = Broadcaster::new(
        state.registry().clone(),
        state.fleet().clone(),
        state.broadcasts().clone(),
        config.broadcast_interval,
    );
    workers.push(("broadcaster", tokio::spawn(broadcaster.run(shutdown_rx.clone()))));

    let monitor = FleetMonitor::new(state.clone(), config.monitor_interval);
    workers.push(("fleet monitor", tokio::spawn(monitor.run(shutdown_rx.clone()))));

    workers.push(("timing", state.timing().spawn(shutdown_rx.clone())));

    let app = api::create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for sessions");

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
                    info!("HTTP server shutting down");
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
    let shutdown_timeout = Duration::from_secs(10);
    for (name, handle) in workers {
        if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
            warn!(worker = name, "Worker did not shut down in time");
        }
    }

    state.fleet().disconnect_all();
    info!("Orchestrator shutdown complete");
    Ok(())
}
