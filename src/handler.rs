// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! One worker per client. The worker multiplexes two sources: frames read
//! from the socket, which are decoded and handed to the router, and the
//! session's outbound channel, whose packets are written to the socket.
//!
//! A connection stays anonymous until its first valid `CONN`; from then on
//! every request is attributed to the bound username, whatever the client
//! writes in `from`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::metrics::ServerMetrics;
use crate::protocol::{decode_packet, encode_packet, Packet, ProtocolError, Request};
use crate::router::MessageRouter;
use crate::session_registry::{ConnectionHandle, ConnectionId};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Shared dependencies for handling a WebSocket connection.
pub struct ConnectionDeps {
    pub router: Arc<MessageRouter>,
    pub metrics: ServerMetrics,
    pub max_message_size: usize,
    /// Capacity of the session's outbound channel.
    pub session_buffer: usize,
    /// Anonymous connections that send no valid CONN within this are closed.
    pub identify_timeout: Duration,
}

/// Writes one packet as a text frame. Returns false on transport failure;
/// a packet that cannot be encoded is logged and skipped.
async fn send_packet(write: &mut WsSink, packet: &Packet, session: &str) -> bool {
    let text = match encode_packet(packet) {
        Ok(text) => text,
        Err(e) => {
            error!("[{}] Failed to encode {:?}: {}", session, packet.kind, e);
            return true;
        }
    };
    write.send(Message::Text(text)).await.is_ok()
}

/// Ends an identified connection: runs disconnect cleanup, then hands
/// `failed` and everything still buffered on `outbound` back to delivery.
/// The registry has dropped its sender by then, so the buffer is final.
pub fn release_session(
    router: &MessageRouter,
    username: &str,
    connection: ConnectionId,
    failed: Option<Packet>,
    outbound: &mut mpsc::Receiver<Packet>,
) {
    router.disconnect(username, connection);
    let mut undelivered: Vec<Packet> = failed.into_iter().collect();
    while let Ok(packet) = outbound.try_recv() {
        undelivered.push(packet);
    }
    router.requeue(username, undelivered);
}

/// Handles a WebSocket connection.
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, deps: ConnectionDeps) {
    let ConnectionDeps {
        router,
        metrics,
        max_message_size,
        session_buffer,
        identify_timeout,
    } = deps;
    // Random label so log lines of one connection can be correlated.
    let label = uuid::Uuid::new_v4().simple().to_string();
    let session = &label[..8];

    let (mut write, mut read) = ws_stream.split();
    let (handle, mut outbound) = ConnectionHandle::new(session_buffer);
    let connection = handle.id();
    // Moved into the registry by the first valid CONN.
    let mut handle = Some(handle);
    let mut username: Option<String> = None;
    let identify_deadline = Instant::now() + identify_timeout;
    let mut failed: Option<Packet> = None;

    loop {
        let msg = tokio::select! {
            ws_msg = read.next() => {
                match ws_msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!("[{}] Read error: {}", session, e);
                        break;
                    }
                    None => {
                        debug!("[{}] Disconnected", session);
                        break;
                    }
                }
            }
            // Packets routed to this session by any worker
            packet = outbound.recv() => {
                let Some(packet) = packet else {
                    // Registry dropped our handle: superseded or reaped
                    info!("[{}] Session ended by server", session);
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                if send_packet(&mut write, &packet, session).await {
                    continue;
                }

                warn!("[{}] Write failed, requeueing undelivered packets", session);
                failed = Some(packet);
                break;
            }
            _ = tokio::time::sleep_until(identify_deadline), if username.is_none() => {
                warn!("[{}] No CONN within {}s", session, identify_timeout.as_secs());
                break;
            }
        };

        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
            Message::Ping(data) => {
                if let Some(user) = &username {
                    router.sessions().touch(user);
                }
                if write.send(Message::Pong(data)).await.is_err() {
                    break;
                }
                continue;
            }
            Message::Pong(_) | Message::Frame(_) => continue,
            Message::Close(_) => {
                debug!("[{}] Close frame received", session);
                break;
            }
        };

        metrics.packets_received.inc();
        if data.len() > max_message_size {
            warn!("[{}] Packet too large: {} bytes", session, data.len());
            metrics.packets_rejected.inc();
            continue;
        }

        let request = match decode_packet(&data).and_then(Request::from_packet) {
            Ok(request) => request,
            Err(ProtocolError::InvalidUsername) if username.is_none() => {
                warn!("[{}] CONN with invalid username", session);
                metrics.packets_rejected.inc();
                let reply = Packet::error("Invalid username");
                if !send_packet(&mut write, &reply, session).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!("[{}] Dropping packet: {}", session, e);
                metrics.packets_rejected.inc();
                continue;
            }
        };

        if let Some(user) = &username {
            router.handle(user, request);
            continue;
        }

        match request {
            Request::Connect { username: name } => {
                let Some(handle) = handle.take() else {
                    break;
                };
                info!("[{}] Identified as {}", session, name);
                router.connect(&name, handle);
                username = Some(name);
            }
            _ => {
                debug!("[{}] Dropping packet before CONN", session);
                metrics.packets_rejected.inc();
            }
        }
    }

    if let Some(user) = username {
        release_session(&router, &user, connection, failed, &mut outbound);
    }
}
