// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for chat server integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use nexchat_server::config::ServerConfig;
use nexchat_server::history::MemoryHistoryStore;
use nexchat_server::metrics::ServerMetrics;
use nexchat_server::server::{self, ServerState};

/// How long a test waits for a single frame before giving up.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Starts a server on an ephemeral port with in-memory history.
#[allow(dead_code)]
pub async fn start_server(config: ServerConfig) -> (SocketAddr, ServerState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = ServerState::new(
        config,
        Arc::new(MemoryHistoryStore::default()),
        ServerMetrics::new().unwrap(),
    );
    tokio::spawn(server::serve(listener, state.clone()));
    (addr, state)
}

/// Starts a server with default settings.
#[allow(dead_code)]
pub async fn start_default_server() -> (SocketAddr, ServerState) {
    start_server(ServerConfig::default()).await
}

/// A WebSocket client speaking the JSON packet protocol.
pub struct TestClient {
    pub ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[allow(dead_code)]
impl TestClient {
    /// Opens an anonymous connection to the chat endpoint.
    pub async fn connect(addr: SocketAddr) -> Self {
        let url = format!("ws://{}/ws", addr);
        let (ws, _) = connect_async(&url).await.unwrap();
        TestClient { ws }
    }

    /// Connects and identifies as `username`, returning once the first
    /// presence snapshot has arrived.
    pub async fn login(addr: SocketAddr, username: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(packet("CONN", username, "", "")).await;
        client.recv_kind("SYNC_DATA").await;
        client
    }

    pub async fn send(&mut self, packet: Value) {
        self.ws
            .send(Message::Text(packet.to_string()))
            .await
            .unwrap();
    }

    /// Next decoded packet, or None if the connection closed or nothing
    /// arrived in time.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            let msg = timeout(RECV_TIMEOUT, self.ws.next()).await.ok()??.ok()?;
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).ok(),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Skips packets until one matches `predicate`.
    pub async fn recv_until<F>(&mut self, predicate: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        loop {
            let packet = self
                .recv()
                .await
                .expect("connection closed before expected packet");
            if predicate(&packet) {
                return packet;
            }
        }
    }

    pub async fn recv_kind(&mut self, kind: &str) -> Value {
        self.recv_until(|p| p["type"] == kind).await
    }

    /// True once the server has closed the connection.
    pub async fn closed(&mut self) -> bool {
        loop {
            match timeout(RECV_TIMEOUT, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

/// Builds a client packet.
#[allow(dead_code)]
pub fn packet(kind: &str, from: &str, to: &str, content: &str) -> Value {
    json!({
        "type": kind,
        "from": from,
        "to": to,
        "content": content,
    })
}
