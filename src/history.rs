// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message History
//!
//! Durable append-only log per conversation, capped to the most recent
//! entries, plus group metadata records. Supports both in-memory (for
//! testing) and SQLite (for production).
//!
//! The router treats every method as advisory: failures are logged and
//! counted, never allowed to block delivery.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;

use crate::conversation::{ConversationKey, ConversationType};

/// Default number of entries kept per conversation.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown conversation type: {0}")]
    ConversationType(String),

    #[error("history store lock poisoned")]
    Poisoned,
}

/// One persisted message.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub conversation_type: ConversationType,
    pub sequence: u64,
}

/// Persisted group metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRecord {
    pub name: String,
    pub admin: String,
    pub members: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&crate::group_registry::Group> for GroupRecord {
    fn from(group: &crate::group_registry::Group) -> Self {
        GroupRecord {
            name: group.name.clone(),
            admin: group.admin.clone(),
            members: group.members.clone(),
            created_at: group.created_at,
        }
    }
}

impl From<GroupRecord> for crate::group_registry::Group {
    fn from(record: GroupRecord) -> Self {
        crate::group_registry::Group {
            name: record.name,
            admin: record.admin,
            members: record.members,
            created_at: record.created_at,
        }
    }
}

/// Trait for history storage backends.
pub trait HistoryStore: Send + Sync {
    /// Appends a message to a conversation, trimming the oldest entries
    /// beyond the store's limit.
    fn append_message(
        &self,
        key: &ConversationKey,
        message: StoredMessage,
    ) -> Result<(), HistoryError>;

    /// Returns a conversation's retained messages in sequence order.
    fn load_messages(&self, key: &ConversationKey) -> Result<Vec<StoredMessage>, HistoryError>;

    /// Inserts or replaces a group's metadata.
    fn save_group(&self, group: &GroupRecord) -> Result<(), HistoryError>;

    fn delete_group(&self, name: &str) -> Result<(), HistoryError>;

    /// All persisted groups, sorted by name.
    fn load_groups(&self) -> Result<Vec<GroupRecord>, HistoryError>;

    /// Highest sequence number ever issued for a conversation, 0 if none.
    fn last_sequence(&self, key: &ConversationKey) -> Result<u64, HistoryError>;

    /// Records that `sequence` was issued for a conversation. The stored
    /// value never goes down.
    fn record_sequence(&self, key: &ConversationKey, sequence: u64) -> Result<(), HistoryError>;
}

// ============================================================================
// In-Memory Storage
// ============================================================================

pub struct MemoryHistoryStore {
    messages: RwLock<HashMap<ConversationKey, VecDeque<StoredMessage>>>,
    groups: RwLock<HashMap<String, GroupRecord>>,
    sequences: RwLock<HashMap<ConversationKey, u64>>,
    limit: usize,
}

impl MemoryHistoryStore {
    pub fn new(limit: usize) -> Self {
        MemoryHistoryStore {
            messages: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            sequences: RwLock::new(HashMap::new()),
            limit: limit.max(1),
        }
    }
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn append_message(
        &self,
        key: &ConversationKey,
        message: StoredMessage,
    ) -> Result<(), HistoryError> {
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        let log = messages.entry(key.clone()).or_default();
        // Appends may land slightly out of order under concurrency
        let at = log.partition_point(|m| m.sequence <= message.sequence);
        log.insert(at, message);
        while log.len() > self.limit {
            log.pop_front();
        }
        Ok(())
    }

    fn load_messages(&self, key: &ConversationKey) -> Result<Vec<StoredMessage>, HistoryError> {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        Ok(messages
            .get(key)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn save_group(&self, group: &GroupRecord) -> Result<(), HistoryError> {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        groups.insert(group.name.clone(), group.clone());
        Ok(())
    }

    fn delete_group(&self, name: &str) -> Result<(), HistoryError> {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        groups.remove(name);
        Ok(())
    }

    fn load_groups(&self) -> Result<Vec<GroupRecord>, HistoryError> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<GroupRecord> = groups.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn last_sequence(&self, key: &ConversationKey) -> Result<u64, HistoryError> {
        let sequences = self.sequences.read().unwrap_or_else(PoisonError::into_inner);
        Ok(sequences.get(key).copied().unwrap_or(0))
    }

    fn record_sequence(&self, key: &ConversationKey, sequence: u64) -> Result<(), HistoryError> {
        let mut sequences = self.sequences.write().unwrap_or_else(PoisonError::into_inner);
        let last = sequences.entry(key.clone()).or_insert(0);
        *last = (*last).max(sequence);
        Ok(())
    }
}

// ============================================================================
// SQLite Storage
// ============================================================================

pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
    limit: usize,
}

impl SqliteHistoryStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P, limit: usize) -> Result<Self, HistoryError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=10000;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation TEXT NOT NULL,
                conversation_type TEXT NOT NULL,
                message_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                sequence INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_type, conversation, id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sequences (
                conversation TEXT NOT NULL,
                conversation_type TEXT NOT NULL,
                last INTEGER NOT NULL,
                PRIMARY KEY (conversation_type, conversation)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS chat_groups (
                name TEXT PRIMARY KEY,
                admin TEXT NOT NULL,
                members TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(SqliteHistoryStore {
            conn: Mutex::new(conn),
            limit: limit.max(1),
        })
    }

    #[cfg(test)]
    pub fn in_memory(limit: usize) -> Result<Self, HistoryError> {
        Self::open(":memory:", limit)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, HistoryError> {
        self.conn.lock().map_err(|_| HistoryError::Poisoned)
    }
}

fn conversation_columns(key: &ConversationKey) -> (String, &'static str) {
    (key.to_string(), key.conversation_type().as_str())
}

impl HistoryStore for SqliteHistoryStore {
    fn append_message(
        &self,
        key: &ConversationKey,
        message: StoredMessage,
    ) -> Result<(), HistoryError> {
        let (conversation, kind) = conversation_columns(key);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO messages
             (conversation, conversation_type, message_id, sender, content, sent_at, sequence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation,
                kind,
                message.message_id,
                message.sender,
                message.content,
                message.timestamp.to_rfc3339(),
                message.sequence as i64
            ],
        )?;

        tx.execute(
            "DELETE FROM messages
             WHERE conversation_type = ?1 AND conversation = ?2 AND id NOT IN (
                 SELECT id FROM messages
                 WHERE conversation_type = ?1 AND conversation = ?2
                 ORDER BY sequence DESC, id DESC LIMIT ?3
             )",
            params![kind, conversation, self.limit as i64],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn load_messages(&self, key: &ConversationKey) -> Result<Vec<StoredMessage>, HistoryError> {
        let (conversation, kind) = conversation_columns(key);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, sender, content, sent_at, conversation_type, sequence
             FROM messages WHERE conversation_type = ?1 AND conversation = ?2
             ORDER BY sequence ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![kind, conversation], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (message_id, sender, content, sent_at, kind, sequence) = row?;
            let conversation_type = ConversationType::parse(&kind)
                .ok_or(HistoryError::ConversationType(kind))?;
            messages.push(StoredMessage {
                message_id,
                sender,
                content,
                timestamp: DateTime::parse_from_rfc3339(&sent_at)?.with_timezone(&Utc),
                conversation_type,
                sequence: sequence as u64,
            });
        }
        Ok(messages)
    }

    fn save_group(&self, group: &GroupRecord) -> Result<(), HistoryError> {
        let members = serde_json::to_string(&group.members)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO chat_groups (name, admin, members, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![group.name, group.admin, members, group.created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn delete_group(&self, name: &str) -> Result<(), HistoryError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM chat_groups WHERE name = ?1", params![name])?;
        Ok(())
    }

    fn load_groups(&self) -> Result<Vec<GroupRecord>, HistoryError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT name, admin, members, created_at FROM chat_groups ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut groups = Vec::new();
        for row in rows {
            let (name, admin, members, created_at) = row?;
            groups.push(GroupRecord {
                name,
                admin,
                members: serde_json::from_str(&members)?,
                created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
            });
        }
        Ok(groups)
    }

    fn last_sequence(&self, key: &ConversationKey) -> Result<u64, HistoryError> {
        let (conversation, kind) = conversation_columns(key);
        let conn = self.lock()?;
        // Stores written before counters were tracked only have messages
        let last: Option<i64> = conn.query_row(
            "SELECT MAX(v) FROM (
                 SELECT last AS v FROM sequences
                 WHERE conversation_type = ?1 AND conversation = ?2
                 UNION ALL
                 SELECT MAX(sequence) FROM messages
                 WHERE conversation_type = ?1 AND conversation = ?2
             )",
            params![kind, conversation],
            |row| row.get(0),
        )?;
        Ok(last.unwrap_or(0).max(0) as u64)
    }

    fn record_sequence(&self, key: &ConversationKey, sequence: u64) -> Result<(), HistoryError> {
        let (conversation, kind) = conversation_columns(key);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sequences (conversation, conversation_type, last)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(conversation_type, conversation)
             DO UPDATE SET last = MAX(last, excluded.last)",
            params![conversation, kind, sequence as i64],
        )?;
        Ok(())
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// In-memory storage (lost on restart).
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

impl StorageBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Some(StorageBackend::Memory),
            "sqlite" => Some(StorageBackend::Sqlite),
            _ => None,
        }
    }
}

/// Creates a history store for the backend. SQLite databases live at
/// `<data_dir>/history.db`.
pub fn create_history_store(
    backend: StorageBackend,
    data_dir: &Path,
    limit: usize,
) -> Result<Arc<dyn HistoryStore>, HistoryError> {
    match backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryHistoryStore::new(limit))),
        StorageBackend::Sqlite => {
            std::fs::create_dir_all(data_dir)?;
            let store = SqliteHistoryStore::open(data_dir.join("history.db"), limit)?;
            Ok(Arc::new(store))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
