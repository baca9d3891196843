// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Conversation Keys and Sequencing
//!
//! A conversation is either a private pair or a group. Each one owns a
//! monotonic sequence counter so recipients can rebuild a total order.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::protocol::GROUP_KEY_PREFIX;

/// Kind of conversation, as recorded in history entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationType {
    Private,
    Group,
}

impl ConversationType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationType::Private => "private",
            ConversationType::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(ConversationType::Private),
            "group" => Some(ConversationType::Group),
            _ => None,
        }
    }
}

/// Canonical identity of one ordered message stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    /// Two usernames, lexicographically smaller first.
    Private(String, String),
    Group(String),
}

impl ConversationKey {
    /// Builds the private key for a pair. Symmetric in its arguments.
    pub fn private(a: &str, b: &str) -> Self {
        if a <= b {
            ConversationKey::Private(a.to_string(), b.to_string())
        } else {
            ConversationKey::Private(b.to_string(), a.to_string())
        }
    }

    pub fn group(name: &str) -> Self {
        ConversationKey::Group(name.to_string())
    }

    /// Resolves the conversation a user asks history for: `group_<name>`
    /// selects a group, anything else names the peer of a private chat.
    pub fn for_history_request(requester: &str, conversation: &str) -> Self {
        match conversation.strip_prefix(GROUP_KEY_PREFIX) {
            Some(group) if !group.is_empty() => ConversationKey::group(group),
            _ => ConversationKey::private(requester, conversation),
        }
    }

    pub fn conversation_type(&self) -> ConversationType {
        match self {
            ConversationKey::Private(..) => ConversationType::Private,
            ConversationKey::Group(_) => ConversationType::Group,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Private(a, b) => write!(f, "{}_{}", a, b),
            ConversationKey::Group(name) => write!(f, "{}{}", GROUP_KEY_PREFIX, name),
        }
    }
}

/// Per-conversation monotonic counters.
///
/// Counters live here rather than with a session, so they survive
/// reconnects and group membership churn. Numbers are never reused: a
/// counter touched for the first time is seeded from the caller's record
/// of what was issued before.
///
/// Each conversation has its own slot lock, held while the caller emits
/// the numbered packet. Two senders in one conversation therefore reach
/// every recipient in sequence order, while other conversations proceed
/// independently.
#[derive(Default)]
pub struct SequenceAllocator {
    counters: Mutex<HashMap<ConversationKey, Arc<Mutex<Option<u64>>>>>,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &ConversationKey) -> Arc<Mutex<Option<u64>>> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.entry(key.clone()).or_default().clone()
    }

    /// Issues the next number for `key` and runs `emit` with it before
    /// another number can be issued for the same key. `seed` supplies the
    /// last number issued in an earlier run and is called at most once
    /// per key.
    pub fn allocate<R>(
        &self,
        key: &ConversationKey,
        seed: impl FnOnce() -> u64,
        emit: impl FnOnce(u64) -> R,
    ) -> R {
        let slot = self.slot(key);
        let mut last = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let sequence = last.unwrap_or_else(seed) + 1;
        *last = Some(sequence);
        emit(sequence)
    }

    /// Returns the next sequence number for `key`, starting at 1.
    pub fn next(&self, key: &ConversationKey) -> u64 {
        self.allocate(key, || 0, |sequence| sequence)
    }

    /// Returns the last number issued for `key` in this process (0 if none).
    pub fn current(&self, key: &ConversationKey) -> u64 {
        let slot = self.slot(key);
        let last = slot.lock().unwrap_or_else(PoisonError::into_inner);
        last.unwrap_or(0)
    }
}
