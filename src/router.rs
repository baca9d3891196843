// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message Router
//!
//! Per-request state machine sitting on top of the registries. Every
//! request is applied synchronously: registries are mutated under their own
//! short locks and outbound packets are pushed onto per-session channels,
//! so no call ever waits on another client's socket.
//!
//! Two delivery paths exist. `deliver` falls back to the offline queue and
//! is used for anything a user must eventually see (messages, KICKED,
//! confirmations). `push` is for state that is recomputed anyway (presence
//! snapshots, alerts, typing, acks, replies) and is simply dropped when the
//! recipient is unreachable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::conversation::{ConversationKey, SequenceAllocator};
use crate::group_registry::{Departure, Group, GroupRegistry};
use crate::history::{GroupRecord, HistoryError, HistoryStore, StoredMessage};
use crate::metrics::ServerMetrics;
use crate::offline_queue::OfflineQueue;
use crate::protocol::{
    new_message_id, sender_of_message_id, validate_group_name, validate_username, ClearScope,
    Packet, PacketKind, Request,
};
use crate::session_registry::{ConnectionHandle, ConnectionId, SessionRegistry};

/// Number of message ids whose receipt timestamps are retained.
pub const RECEIPT_LOG_CAPACITY: usize = 10_000;

/// Client-supplied message ids longer than this are replaced.
const MAX_CLIENT_MESSAGE_ID_LEN: usize = 128;

/// Timestamps observed for one message id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Receipt {
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct ReceiptEntries {
    receipts: HashMap<String, Receipt>,
    order: VecDeque<String>,
}

/// Bounded log of delivery and read timestamps, oldest ids forgotten first.
///
/// Observability only: nothing is retried based on it.
pub struct ReceiptLog {
    entries: Mutex<ReceiptEntries>,
    capacity: usize,
}

impl ReceiptLog {
    pub fn new(capacity: usize) -> Self {
        ReceiptLog {
            entries: Mutex::new(ReceiptEntries::default()),
            capacity: capacity.max(1),
        }
    }

    fn update<F: FnOnce(&mut Receipt)>(&self, message_id: &str, f: F) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !entries.receipts.contains_key(message_id) {
            entries.order.push_back(message_id.to_string());
            entries
                .receipts
                .insert(message_id.to_string(), Receipt::default());
            while entries.order.len() > self.capacity {
                if let Some(oldest) = entries.order.pop_front() {
                    entries.receipts.remove(&oldest);
                }
            }
        }
        if let Some(receipt) = entries.receipts.get_mut(message_id) {
            f(receipt);
        }
    }

    pub fn record_sent(&self, message_id: &str) {
        self.update(message_id, |r| r.sent_at = Some(Utc::now()));
    }

    pub fn record_delivered(&self, message_id: &str) {
        self.update(message_id, |r| r.delivered_at = Some(Utc::now()));
    }

    pub fn record_read(&self, message_id: &str) {
        self.update(message_id, |r| r.read_at = Some(Utc::now()));
    }

    pub fn get(&self, message_id: &str) -> Option<Receipt> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.receipts.get(message_id).copied()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a client's message id if it is well formed and names the sender,
/// otherwise mints a new one.
fn resolve_message_id(sender: &str, supplied: &str) -> String {
    if supplied.len() <= MAX_CLIENT_MESSAGE_ID_LEN
        && !supplied.contains('|')
        && sender_of_message_id(supplied) == Some(sender)
    {
        supplied.to_string()
    } else {
        new_message_id(sender)
    }
}

/// Renders history entries as `[HH:MM:SS] [sender] text|messageId`,
/// joined by `|`.
fn format_history(messages: &[StoredMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            format!(
                "[{}] [{}] {}|{}",
                m.timestamp.format("%H:%M:%S"),
                m.sender,
                m.content,
                m.message_id
            )
        })
        .collect::<Vec<_>>()
        .join("|")
}

pub struct MessageRouter {
    sessions: SessionRegistry,
    groups: GroupRegistry,
    sequences: SequenceAllocator,
    offline: OfflineQueue,
    history: Arc<dyn HistoryStore>,
    receipts: ReceiptLog,
    metrics: ServerMetrics,
}

impl MessageRouter {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        metrics: ServerMetrics,
        offline_capacity: usize,
    ) -> Self {
        MessageRouter {
            sessions: SessionRegistry::new(),
            groups: GroupRegistry::new(),
            sequences: SequenceAllocator::new(),
            offline: OfflineQueue::new(offline_capacity),
            history,
            receipts: ReceiptLog::new(RECEIPT_LOG_CAPACITY),
            metrics,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn offline(&self) -> &OfflineQueue {
        &self.offline
    }

    pub fn receipts(&self) -> &ReceiptLog {
        &self.receipts
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Reloads persisted groups. Sequence counters need no restoring: each
    /// one is seeded from the store the first time it is used. Returns the
    /// number of groups restored.
    pub fn restore(&self) -> Result<usize, HistoryError> {
        let mut restored = 0;
        for record in self.history.load_groups()? {
            let name = record.name.clone();
            if !self.groups.restore(Group::from(record)) {
                warn!("Skipping inconsistent persisted group {}", name);
                continue;
            }
            restored += 1;
        }
        Ok(restored)
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Binds `username` to a connection, replays its offline queue, sends
    /// it a snapshot and announces it. Returns true for a first-time user.
    pub fn connect(&self, username: &str, handle: ConnectionHandle) -> bool {
        let connection = handle.id();
        let mut replayed = 0;
        let is_new = self.sessions.connect(username, handle, || {
            let backlog = self.offline.drain(username);
            replayed = backlog.len();
            backlog
        });
        self.metrics
            .sessions_online
            .set(self.sessions.online_count() as i64);

        info!(
            "{} connected (connection {}, {} queued packets replayed)",
            username, connection, replayed
        );

        self.push(username, self.snapshot(username));
        let announcement = if is_new {
            format!("{} has joined the chat", username)
        } else {
            format!("{} is back online", username)
        };
        self.broadcast_alert(&announcement);
        is_new
    }

    /// Tears down `connection` if it is still the live one for `username`:
    /// removes the user from every group, announces the departure and
    /// resyncs everyone. Returns false if another path already cleaned up.
    pub fn disconnect(&self, username: &str, connection: ConnectionId) -> bool {
        if !self.sessions.disconnect_connection(username, connection) {
            debug!(
                "Connection {} for {} already superseded or reaped",
                connection, username
            );
            return false;
        }
        self.metrics
            .sessions_online
            .set(self.sessions.online_count() as i64);
        info!("{} disconnected (connection {})", username, connection);

        for departure in self.groups.remove_member_everywhere(username) {
            self.settle_departure(&departure);
        }

        self.broadcast_alert(&format!("{} has disconnected", username));
        self.sync_all();
        true
    }

    /// Hands packets that never reached the socket back to delivery.
    /// Snapshots and typing signals are stale by then and are dropped.
    pub fn requeue(&self, username: &str, packets: Vec<Packet>) {
        let packets: Vec<Packet> = packets
            .into_iter()
            .filter(|p| !matches!(p.kind, PacketKind::SyncData | PacketKind::Typing))
            .collect();
        if !packets.is_empty() {
            debug!("Requeueing {} packets for {}", packets.len(), username);
        }
        for packet in packets {
            self.deliver(username, packet);
        }
    }

    // ------------------------------------------------------------------
    // Request dispatch
    // ------------------------------------------------------------------

    /// Applies one request from an identified user.
    pub fn handle(&self, username: &str, request: Request) {
        self.sessions.touch(username);

        match request {
            Request::Connect { username: requested } => {
                debug!("Ignoring repeated CONN as {} from {}", requested, username);
            }
            Request::Heartbeat => {}
            Request::GetStatus => {
                self.push(username, self.snapshot(username));
            }
            Request::CreateGroup { group } => self.create_group(username, &group),
            Request::JoinGroup { group } => self.join_group(username, &group),
            Request::LeaveGroup { group } => self.leave_group(username, &group),
            Request::KickMember { group, target } => self.kick_member(username, &group, &target),
            Request::SetAdmin { group, new_admin } => self.set_admin(username, &group, &new_admin),
            Request::DeleteGroup { group } => self.delete_group(username, &group),
            Request::GroupMessage {
                group,
                content,
                message_id,
            } => self.group_message(username, &group, content, &message_id),
            Request::PrivateMessage {
                to,
                content,
                message_id,
            } => {
                let message_id = resolve_message_id(username, &message_id);
                self.private_message(username, &to, content, message_id);
            }
            Request::GroupPrivate {
                group,
                target,
                message,
            } => self.group_private(username, &group, &target, &message),
            Request::ClearChat { target, scope } => self.clear_chat(username, &target, scope),
            Request::Delivered { message_id } => {
                self.receipts.record_delivered(&message_id);
                self.forward_receipt(PacketKind::MsgDelivered, &message_id);
            }
            Request::Read { message_id } => {
                self.receipts.record_read(&message_id);
                self.forward_receipt(PacketKind::MsgRead, &message_id);
            }
            Request::GetHistory { conversation } => self.send_history(username, &conversation),
            Request::Typing { to, content } => {
                let packet = Packet {
                    from: username.to_string(),
                    to: to.clone(),
                    content,
                    sent_time: Some(Utc::now()),
                    ..Packet::new(PacketKind::Typing)
                };
                self.push(&to, packet);
            }
            Request::GetGroupMembers { group } => {
                let members = self.groups.members_of(&group);
                let packet = Packet {
                    group_list: members.join(","),
                    ..Packet::system(PacketKind::GroupMembers, username, group)
                };
                self.push(username, packet);
            }
        }
    }

    // ------------------------------------------------------------------
    // Group lifecycle
    // ------------------------------------------------------------------

    fn create_group(&self, creator: &str, group: &str) {
        if !validate_group_name(group) {
            debug!("{} tried to create invalid group name {:?}", creator, group);
            return;
        }
        if !self.groups.create(creator, group) {
            debug!("Group {} already exists", group);
            return;
        }
        info!("{} created group {}", creator, group);
        self.persist_group(group);
        self.sync_all();
    }

    fn join_group(&self, user: &str, group: &str) {
        if !self.groups.join(user, group) {
            return;
        }
        info!("{} joined group {}", user, group);
        self.persist_group(group);

        self.sequenced(&ConversationKey::group(group), |sequence| {
            self.push(
                user,
                Packet::group_notice(group, format!("Welcome to '{}'!", group), sequence),
            );
        });
        self.notify_group(group, &format!("{} has joined the group", user));
        self.sync_all();
    }

    fn leave_group(&self, user: &str, group: &str) {
        let Some(departure) = self.groups.leave(user, group) else {
            return;
        };
        info!("{} left group {}", user, group);
        self.notify_group(group, &format!("{} has left the group", user));
        self.settle_departure(&departure);
        self.sync_all();
    }

    fn kick_member(&self, admin: &str, group: &str, target: &str) {
        if !self.groups.kick(admin, group, target) {
            debug!("{} could not kick {} from {}", admin, target, group);
            return;
        }
        info!("{} kicked {} from group {}", admin, target, group);
        self.persist_group(group);

        self.deliver(
            target,
            Packet::system(
                PacketKind::Kicked,
                group,
                format!("You were kicked from '{}' by {}", group, admin),
            ),
        );
        self.notify_group(group, &format!("{} was kicked by {}", target, admin));
        self.sync_all();
    }

    fn set_admin(&self, admin: &str, group: &str, new_admin: &str) {
        if !self.groups.set_admin(admin, group, new_admin) {
            debug!("{} could not promote {} in {}", admin, new_admin, group);
            return;
        }
        info!("{} made {} admin of group {}", admin, new_admin, group);
        self.persist_group(group);
        self.notify_group(group, &format!("{} is now the admin", new_admin));
        self.sync_all();
    }

    fn delete_group(&self, admin: &str, group: &str) {
        let Some(members) = self.groups.delete(admin, group) else {
            debug!("{} could not delete {}", admin, group);
            return;
        };
        info!("{} deleted group {}", admin, group);
        self.forget_group(group);

        for member in &members {
            self.deliver(
                member,
                Packet::system(
                    PacketKind::Kicked,
                    group,
                    format!("Group '{}' was deleted by {}", group, admin),
                ),
            );
        }
        self.sync_all();
    }

    /// Persists what a departure left behind and announces a new admin.
    fn settle_departure(&self, departure: &Departure) {
        if departure.deleted {
            info!("Group {} is empty and was removed", departure.group);
            self.forget_group(&departure.group);
            return;
        }
        self.persist_group(&departure.group);
        if let Some(new_admin) = &departure.new_admin {
            self.notify_group(&departure.group, &format!("{} is now the admin", new_admin));
        }
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    fn group_message(&self, sender: &str, group: &str, content: String, supplied_id: &str) {
        if !self.groups.is_member(sender, group) {
            debug!("{} is not a member of {}, dropping GRP_MSG", sender, group);
            return;
        }

        let key = ConversationKey::group(group);
        let message_id = resolve_message_id(sender, supplied_id);
        let packet = self.sequenced(&key, |sequence| {
            let packet = Packet {
                from: sender.to_string(),
                to: group.to_string(),
                content,
                sent_time: Some(Utc::now()),
                sequence,
                message_id,
                ..Packet::new(PacketKind::GrpMsg)
            };
            self.receipts.record_sent(&packet.message_id);
            for member in self.groups.members_of(group) {
                if member != sender {
                    self.deliver(&member, packet.clone());
                }
            }
            packet
        });
        debug!(
            "Group message {} from {} to {} (seq {})",
            packet.message_id, sender, group, packet.sequence
        );
        self.record_history(&key, &packet);
    }

    fn private_message(&self, sender: &str, to: &str, content: String, message_id: String) {
        if !validate_username(to) {
            debug!("{} addressed invalid recipient {:?}", sender, to);
            return;
        }

        let key = ConversationKey::private(sender, to);
        let packet = self.sequenced(&key, |sequence| {
            let packet = Packet {
                from: sender.to_string(),
                to: to.to_string(),
                content,
                sent_time: Some(Utc::now()),
                sequence,
                message_id,
                ..Packet::new(PacketKind::Priv)
            };
            let confirmation = Packet {
                to: to.to_string(),
                ..Packet::receipt(PacketKind::MsgSent, &packet.message_id)
            };
            self.receipts.record_sent(&packet.message_id);
            self.deliver(to, packet.clone());
            self.deliver(sender, confirmation);
            packet
        });
        debug!(
            "Private message {} from {} to {} (seq {})",
            packet.message_id, sender, to, packet.sequence
        );
        self.record_history(&key, &packet);
    }

    fn group_private(&self, sender: &str, group: &str, target: &str, message: &str) {
        if !self.groups.is_member(sender, group) {
            self.deliver(
                sender,
                Packet::error(format!("You are not a member of group '{}'", group)),
            );
            return;
        }
        self.private_message(
            sender,
            target,
            format!("[Group: {}] {}", group, message),
            new_message_id(sender),
        );
    }

    fn clear_chat(&self, user: &str, target: &str, scope: ClearScope) {
        let clear = |to: &str| Packet::system(PacketKind::ClearChat, to, "clear");
        match scope {
            ClearScope::Private => {
                self.push(user, clear(target));
                if target != user && validate_username(target) {
                    self.deliver(target, clear(user));
                }
            }
            ClearScope::Group => {
                if !self.groups.is_member(user, target) {
                    return;
                }
                for member in self.groups.members_of(target) {
                    self.push(&member, clear(target));
                }
            }
        }
    }

    fn forward_receipt(&self, kind: PacketKind, message_id: &str) {
        let Some(sender) = sender_of_message_id(message_id) else {
            debug!("Receipt for unattributable message id {:?}", message_id);
            return;
        };
        self.push(sender, Packet::receipt(kind, message_id));
    }

    fn send_history(&self, user: &str, conversation: &str) {
        let key = ConversationKey::for_history_request(user, conversation);
        let content = match &key {
            ConversationKey::Group(name) if !self.groups.is_member(user, name) => String::new(),
            _ => match self.history.load_messages(&key) {
                Ok(messages) => format_history(&messages),
                Err(e) => {
                    warn!("Failed to load history for {}: {}", key, e);
                    self.metrics.history_errors.inc();
                    String::new()
                }
            },
        };
        self.push(
            user,
            Packet::system(PacketKind::HistoryData, conversation, content),
        );
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Full presence view for `username`: every known user's status, the
    /// user's own groups with role and online/total counts, and all
    /// discoverable groups.
    pub fn snapshot(&self, username: &str) -> Packet {
        let online: HashSet<String> = self.sessions.online_users().into_iter().collect();

        let users = self
            .sessions
            .known_users()
            .iter()
            .map(|u| {
                let status = if online.contains(u) { "online" } else { "offline" };
                format!("{}|{}", u, status)
            })
            .collect::<Vec<_>>()
            .join(",");

        let groups = self.groups.all();
        let mine = groups
            .iter()
            .filter(|g| g.is_member(username))
            .map(|g| {
                let role = if g.admin == username { "admin" } else { "member" };
                let active = g.members.iter().filter(|m| online.contains(*m)).count();
                format!("{}|{}|{}|{}", g.name, role, active, g.members.len())
            })
            .collect::<Vec<_>>()
            .join(",");
        let all = groups
            .iter()
            .map(|g| format!("{}|{}", g.name, g.created_at.format("%Y-%m-%d %H:%M")))
            .collect::<Vec<_>>()
            .join(",");

        Packet {
            group_list: mine,
            all_groups: all,
            ..Packet::system(PacketKind::SyncData, username, users)
        }
    }

    /// Sends every online user a fresh snapshot.
    pub fn sync_all(&self) {
        for user in self.sessions.online_users() {
            self.push(&user, self.snapshot(&user));
        }
    }

    fn broadcast_alert(&self, message: &str) {
        let alert = Packet::alert(message);
        for user in self.sessions.online_users() {
            self.push(&user, alert.clone());
        }
    }

    /// Posts a system notice into a group's sequence stream, online
    /// members only.
    fn notify_group(&self, group: &str, message: &str) {
        let members = self.groups.members_of(group);
        if members.is_empty() {
            return;
        }
        self.sequenced(&ConversationKey::group(group), |sequence| {
            let notice = Packet::group_notice(group, message, sequence);
            for member in members {
                self.push(&member, notice.clone());
            }
        });
    }

    /// Numbers one outbound emission in `key`'s stream. `emit` runs while
    /// the conversation is held, so recipients see numbers in order; the
    /// issued number is persisted afterwards.
    fn sequenced<R>(&self, key: &ConversationKey, emit: impl FnOnce(u64) -> R) -> R {
        let mut issued = 0;
        let result = self.sequences.allocate(
            key,
            || self.stored_sequence(key),
            |sequence| {
                issued = sequence;
                emit(sequence)
            },
        );
        if let Err(e) = self.history.record_sequence(key, issued) {
            warn!("Failed to persist sequence {} for {}: {}", issued, key, e);
            self.metrics.history_errors.inc();
        }
        result
    }

    fn stored_sequence(&self, key: &ConversationKey) -> u64 {
        match self.history.last_sequence(key) {
            Ok(last) => last,
            Err(e) => {
                warn!("Failed to load last sequence for {}: {}", key, e);
                self.metrics.history_errors.inc();
                0
            }
        }
    }

    // ------------------------------------------------------------------
    // Delivery and persistence
    // ------------------------------------------------------------------

    /// Sends to the live connection or falls back to the offline queue.
    fn deliver(&self, username: &str, packet: Packet) -> bool {
        let mut evicted = false;
        let sent = self.sessions.send_or_else(username, packet, |packet| {
            evicted = self.offline.enqueue(username, packet).is_some();
        });

        if sent {
            self.metrics.messages_routed.inc();
        } else {
            self.metrics.messages_queued.inc();
            if evicted {
                self.metrics.offline_evictions.inc();
                debug!("Offline queue for {} full, evicted oldest packet", username);
            }
        }
        sent
    }

    /// Sends to the live connection only.
    fn push(&self, username: &str, packet: Packet) -> bool {
        let sent = self.sessions.send(username, packet);
        if sent {
            self.metrics.messages_routed.inc();
        }
        sent
    }

    fn record_history(&self, key: &ConversationKey, packet: &Packet) {
        let message = StoredMessage {
            message_id: packet.message_id.clone(),
            sender: packet.from.clone(),
            content: packet.content.clone(),
            timestamp: packet.sent_time.unwrap_or_else(Utc::now),
            conversation_type: key.conversation_type(),
            sequence: packet.sequence,
        };
        if let Err(e) = self.history.append_message(key, message) {
            warn!("Failed to persist message {}: {}", packet.message_id, e);
            self.metrics.history_errors.inc();
        }
    }

    fn persist_group(&self, group: &str) {
        let Some(record) = self.groups.get(group).map(|g| GroupRecord::from(&g)) else {
            return;
        };
        if let Err(e) = self.history.save_group(&record) {
            warn!("Failed to persist group {}: {}", group, e);
            self.metrics.history_errors.inc();
        }
    }

    fn forget_group(&self, group: &str) {
        if let Err(e) = self.history.delete_group(group) {
            warn!("Failed to remove group {}: {}", group, e);
            self.metrics.history_errors.inc();
        }
    }
}
