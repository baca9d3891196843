// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Registry
//!
//! Single source of truth for "is this user online". Maps usernames to the
//! outbound channel of their live connection plus a last-seen timestamp.
//!
//! Each connection worker owns the receiving end of its channel and writes
//! whatever arrives to the socket, so sending through the registry never
//! blocks on another client's I/O.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::protocol::Packet;

/// Identifies one physical connection. A reconnecting user gets a new id.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Sending half of a connection's outbound channel.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Packet>,
}

impl ConnectionHandle {
    /// Creates a handle and the receiver its connection worker drains.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        (ConnectionHandle { id, tx }, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn push(&self, packet: Packet) -> Result<(), Packet> {
        self.tx.try_send(packet).map_err(|e| e.into_inner())
    }
}

struct Session {
    handle: ConnectionHandle,
    last_seen: Mutex<Instant>,
}

/// Thread-safe registry of live sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    /// Every username ever identified, online or not.
    known: RwLock<BTreeSet<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            known: RwLock::new(BTreeSet::new()),
        }
    }

    /// Registers `handle` as the live connection for `username`.
    ///
    /// `backlog` is evaluated under the registry write lock and its packets
    /// are pushed into the new channel before the session becomes visible,
    /// so no live send can overtake them. A username already present is a
    /// reconnection: its old handle is dropped, which closes the old
    /// worker's channel.
    ///
    /// Returns true if the username has never been seen before.
    pub fn connect<F>(&self, username: &str, handle: ConnectionHandle, backlog: F) -> bool
    where
        F: FnOnce() -> Vec<Packet>,
    {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        for packet in backlog() {
            if handle.push(packet).is_err() {
                tracing::warn!("Outbound buffer full while replaying offline queue");
            }
        }

        sessions.insert(
            username.to_string(),
            Session {
                handle,
                last_seen: Mutex::new(Instant::now()),
            },
        );

        let mut known = self.known.write().unwrap_or_else(PoisonError::into_inner);
        known.insert(username.to_string())
    }

    /// Records activity for `username`. Returns false if not online.
    pub fn touch(&self, username: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(username) {
            Some(session) => {
                *session.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Removes the session for `username`. Returns whether it was active.
    pub fn disconnect(&self, username: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(username).is_some()
    }

    /// Removes the session only if `connection` is still its live handle.
    ///
    /// A worker whose connection was superseded by a reconnect, or already
    /// reaped by the fault detector, gets false and must not clean up.
    pub fn disconnect_connection(&self, username: &str, connection: ConnectionId) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(username) {
            Some(session) if session.handle.id == connection => {
                sessions.remove(username);
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, username: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.contains_key(username)
    }

    /// Pushes a packet to the user's connection. Returns false if the user
    /// is offline or their outbound buffer is full or closed.
    pub fn send(&self, username: &str, packet: Packet) -> bool {
        self.send_or_else(username, packet, |_| {})
    }

    /// Like `send`, but hands the packet to `fallback` on failure.
    ///
    /// The fallback runs while the registry read lock is held, so it is
    /// ordered against `connect`: a packet queued here is either seen by the
    /// next `connect` backlog or was never needed.
    pub fn send_or_else<F>(&self, username: &str, packet: Packet, fallback: F) -> bool
    where
        F: FnOnce(Packet),
    {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let result = match sessions.get(username) {
            Some(session) => session.handle.push(packet),
            None => Err(packet),
        };
        match result {
            Ok(()) => true,
            Err(packet) => {
                fallback(packet);
                false
            }
        }
    }

    /// Sessions whose last activity is at least `timeout` old.
    pub fn stale(&self, timeout: Duration) -> Vec<(String, ConnectionId)> {
        let now = Instant::now();
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .iter()
            .filter(|(_, session)| {
                let last_seen = *session.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
                now.duration_since(last_seen) >= timeout
            })
            .map(|(name, session)| (name.clone(), session.handle.id))
            .collect()
    }

    /// Online usernames, sorted.
    pub fn online_users(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut users: Vec<String> = sessions.keys().cloned().collect();
        users.sort();
        users
    }

    /// Every username ever identified, sorted.
    pub fn known_users(&self) -> Vec<String> {
        let known = self.known.read().unwrap_or_else(PoisonError::into_inner);
        known.iter().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
