// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Accept Loop
//!
//! Accepts TCP connections, completes the WebSocket handshake at the
//! configured endpoint path and spawns one worker per client.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::fault_detector::FaultDetector;
use crate::handler::{self, ConnectionDeps};
use crate::history::HistoryStore;
use crate::metrics::ServerMetrics;
use crate::router::MessageRouter;

/// Everything a running server shares between its tasks.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub router: Arc<MessageRouter>,
    pub metrics: ServerMetrics,
}

impl ServerState {
    pub fn new(config: ServerConfig, history: Arc<dyn HistoryStore>, metrics: ServerMetrics) -> Self {
        let router = Arc::new(MessageRouter::new(
            history,
            metrics.clone(),
            config.offline_queue_capacity,
        ));
        ServerState {
            config: Arc::new(config),
            router,
            metrics,
        }
    }

    /// Starts the heartbeat sweep in the background.
    pub fn spawn_fault_detector(&self) -> JoinHandle<()> {
        let detector = FaultDetector::new(
            self.router.clone(),
            self.config.heartbeat_interval(),
            self.config.heartbeat_timeout(),
        );
        tokio::spawn(detector.run())
    }
}

/// True if a request path addresses the WebSocket endpoint. A trailing
/// slash on either side is ignored.
pub fn path_matches(path: &str, ws_path: &str) -> bool {
    path.trim_end_matches('/') == ws_path.trim_end_matches('/')
}

/// Accepts connections until the listener fails permanently.
pub async fn serve(listener: TcpListener, state: ServerState) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    accept_connection(stream, state).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn accept_connection(stream: TcpStream, state: ServerState) {
    let ServerState {
        config,
        router,
        metrics,
    } = state;

    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let ws_path = config.ws_path.clone();
    let check_path = move |request: &Request, response: Response| {
        if path_matches(request.uri().path(), &ws_path) {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    // Bound the handshake so idle sockets cannot pin a task forever
    match timeout(config.handshake_timeout(), accept_hdr_async(stream, check_path)).await {
        Ok(Ok(ws_stream)) => {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
            info!("New WebSocket connection from {}", peer);

            handler::handle_connection(
                ws_stream,
                ConnectionDeps {
                    router,
                    metrics: metrics.clone(),
                    max_message_size: config.max_message_size,
                    session_buffer: config.session_buffer(),
                    identify_timeout: config.heartbeat_timeout(),
                },
            )
            .await;

            metrics.connections_active.dec();
            info!("WebSocket connection from {} closed", peer);
        }
        Ok(Err(e)) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            metrics.connection_errors.inc();
        }
        Err(_) => {
            warn!("WebSocket handshake with {} timed out", peer);
            metrics.connection_errors.inc();
        }
    }
}
