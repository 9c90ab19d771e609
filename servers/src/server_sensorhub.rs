//! # Sensorhub Gateway
//!
//! Subscribes to sensor telemetry on an MQTT broker, persists every reading,
//! and serves it back over HTTP: historical queries, the latest value, a
//! server-sent-event stream, a WebSocket push feed and a manual submission
//! endpoint.
//!
//! Startup order: environment and configuration, logging, event store, shared
//! state, the ingestion side (pipeline plus MQTT client), then the HTTP
//! listener. Ctrl-C or SIGTERM cancels the ingestion tasks, closes every live
//! subscription and drains the HTTP server.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod sensorhub_logic;
use lib_sensorhub::loggers::{LogSettings, init_tracing};
use sensorhub_logic::{config::Config, downstream, state, upstream};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; real environment variables still apply.
    let dotenv = dotenvy::dotenv();
    let config = Config::parse();

    let _log_guard = init_tracing(&LogSettings {
        app_name: "server_sensorhub".to_string(),
        level: config.log_level.clone(),
        log_dir: config.log_dir.clone(),
    })?;
    if let Ok(path) = dotenv {
        info!("Loaded environment from {}", path.display());
    }

    let store = state::open_store(&config).await;
    let app_state = state::AppState::new(&config, store);
    info!(backend = app_state.store.backend(), "Event store selected");

    let shutdown = CancellationToken::new();
    let upstream = upstream::spawn(&config, &app_state, shutdown.child_token())?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr()))?;
    let downstream_handle = tokio::spawn(downstream::run(listener, app_state.clone(), shutdown.clone()));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            info!("SIGTERM received, initiating shutdown.");
        }
    }

    shutdown.cancel();
    app_state.broadcaster.shutdown();

    if let Err(e) = upstream.join().await {
        warn!("Ingestion tasks ended abnormally: {:#}", e);
    }
    downstream_handle.await.context("downstream server task panicked")??;

    info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
}
