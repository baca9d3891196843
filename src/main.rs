// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! NexChat Server
//!
//! Presence-aware real-time message router. Provides:
//! - WebSocket endpoint for private and group chat
//! - Offline queueing and replay on reconnect
//! - HTTP endpoints for health checks and Prometheus metrics

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};

use nexchat_server::config::ServerConfig;
use nexchat_server::history::create_history_store;
use nexchat_server::http::{create_router, HttpState};
use nexchat_server::metrics::ServerMetrics;
use nexchat_server::server::{self, ServerState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nexchat_server=info".parse()?),
        )
        .init();

    let config = ServerConfig::from_env();

    info!("Starting NexChat Server v{}", env!("CARGO_PKG_VERSION"));
    info!("WebSocket: ws://{}{}", config.listen_addr, config.ws_path);
    info!("Metrics endpoint: {}", config.metrics_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    info!("Heartbeat timeout: {}s", config.heartbeat_timeout_secs);

    let metrics = ServerMetrics::new().context("failed to register metrics")?;
    let history = create_history_store(
        config.storage_backend,
        &config.data_dir,
        config.history_limit,
    )
    .context("failed to open history store")?;

    let listen_addr = config.listen_addr;
    let metrics_addr = config.metrics_addr;
    let state = ServerState::new(config, history, metrics.clone());

    match state.router.restore() {
        Ok(0) => {}
        Ok(n) => info!("Restored {} groups from history", n),
        Err(e) => error!("Failed to restore groups: {}", e),
    }

    state.spawn_fault_detector();

    // Start HTTP server for health/metrics
    let http_router = create_router(HttpState {
        metrics,
        router: state.router.clone(),
    });
    let http_listener = TcpListener::bind(metrics_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", metrics_addr))?;
    tokio::spawn(async move {
        info!("HTTP server listening on {}", metrics_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server failed: {}", e);
        }
    });

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {}", listen_addr))?;
    info!("WebSocket server listening on {}", listen_addr);

    server::serve(listener, state).await;
    Ok(())
}
