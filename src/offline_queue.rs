// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Offline Queue
//!
//! Bounded per-user FIFO of packets that could not be delivered live.
//! When a queue is full the oldest packet is evicted to make room.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use crate::protocol::Packet;

/// Default number of packets held per user.
pub const DEFAULT_CAPACITY: usize = 100;

/// Per-user bounded queues of undelivered packets.
pub struct OfflineQueue {
    queues: Mutex<HashMap<String, VecDeque<Packet>>>,
    capacity: usize,
}

impl OfflineQueue {
    /// Creates an empty queue set holding at most `capacity` packets per user.
    pub fn new(capacity: usize) -> Self {
        OfflineQueue {
            queues: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Appends a packet for `username`. Returns the evicted packet if the
    /// queue was already at capacity.
    pub fn enqueue(&self, username: &str, packet: Packet) -> Option<Packet> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.entry(username.to_string()).or_default();
        queue.push_back(packet);
        if queue.len() > self.capacity {
            queue.pop_front()
        } else {
            None
        }
    }

    /// Removes and returns everything queued for `username`, ordered by
    /// sequence number. Packets with equal sequence keep arrival order.
    pub fn drain(&self, username: &str) -> Vec<Packet> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let mut packets: Vec<Packet> = queues
            .remove(username)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default();
        packets.sort_by_key(|p| p.sequence);
        packets
    }

    /// Number of packets waiting for `username`.
    pub fn len_for(&self, username: &str) -> usize {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.get(username).map_or(0, VecDeque::len)
    }

    /// Total packets queued across all users.
    pub fn total_len(&self) -> usize {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.values().map(VecDeque::len).sum()
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
