//! # Sensor Network Dashboard Server
//!
//! Backend for the environmental sensor network dashboard.
//!
//! ## Workflow
//! - **Upstream**: one long-lived MQTT subscription feeds the ingestion
//!   gateway, which fills the `graph` (home sensor, plausible readings) and
//!   `log` (all traffic) retention buffers.
//! - **Downstream**: an axum server exposes snapshots of those buffers as
//!   JSON, a CSV export and a WebSocket change feed.
//! - **Monitor**: a liveness prober checks the bus with its own short-lived
//!   connections on a fixed interval.
//!
//! All three tasks share a broadcast shutdown channel fired on Ctrl-C or
//! SIGTERM.

use anyhow::{Context, Result};
use lib_sensornet::ingestors::MqttSubscription;
use lib_sensornet::loggers::setup_logging;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

mod sensornet_logic;
use sensornet_logic::{config, downstream, monitor, state, upstream};

const APP_NAME: &str = "server_sensornet";

#[tokio::main]
async fn main() -> Result<()> {
    // --- Phase 1: configuration and logging ---
    let settings = config::load_settings().context("Invalid configuration")?;
    let log_path = setup_logging(&settings.log_dir, &settings.log_level, APP_NAME)
        .context("Failed to initialize logging")?;
    log::info!("Logging to {}", log_path.display());
    log::info!(
        "Broker {} topic '{}' target '{}'",
        settings.endpoint,
        settings.topic,
        settings.target_id
    );

    // --- Phase 2: shared state ---
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let subscription = MqttSubscription::new(settings.subscription());
    let app_state = state::AppState::new(&settings, subscription.status());

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    // --- Phase 3: tasks ---
    let upstream_handle = tokio::spawn(upstream::run(
        subscription,
        Arc::clone(&app_state.gateway),
        shutdown_tx.subscribe(),
    ));

    let downstream_handle = tokio::spawn(downstream::run(
        listener,
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    let monitor_handle = tokio::spawn(monitor::run(
        Arc::clone(&app_state.prober),
        settings.probe_interval,
        shutdown_tx.subscribe(),
    ));

    // --- Phase 4: wait for shutdown signal ---
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = tokio::try_join!(upstream_handle, downstream_handle, monitor_handle);

    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
