// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! Every frame is one JSON object (`Packet`). The `type` field selects a
//! `PacketKind`; inbound packets are then narrowed into a typed `Request`
//! so the router can match exhaustively instead of switching on strings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sender name used for server-originated packets.
pub const SYSTEM_SENDER: &str = "SYSTEM";

/// Prefix that marks a group conversation in `GET_HISTORY` requests.
pub const GROUP_KEY_PREFIX: &str = "group_";

/// Maximum username length in characters.
pub const MAX_USERNAME_LEN: usize = 32;

/// Maximum group name length in characters.
pub const MAX_GROUP_NAME_LEN: usize = 64;

/// Operation tag carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketKind {
    // Client -> server
    Conn,
    Heartbeat,
    GetStatus,
    GrpCreate,
    GrpJoin,
    GrpLeave,
    GrpKick,
    GrpSetAdmin,
    GrpDelete,
    GrpMsg,
    Priv,
    GroupPriv,
    ClearChat,
    MsgDelivered,
    MsgRead,
    GetHistory,
    Typing,
    GetGroupMembers,
    // Server -> client
    SyncData,
    Alert,
    GroupMembers,
    HistoryData,
    Kicked,
    MsgSent,
    Error,
    #[serde(other)]
    Unknown,
}

/// The unit of wire exchange.
///
/// Packets are never mutated once handed to a connection; the router always
/// builds a fresh one for every outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    #[serde(rename = "type")]
    pub kind: PacketKind,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_list: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub all_groups: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub message_id: String,
}

impl Packet {
    /// Creates an empty packet of the given kind.
    pub fn new(kind: PacketKind) -> Self {
        Packet {
            kind,
            from: String::new(),
            to: String::new(),
            content: String::new(),
            group_list: String::new(),
            all_groups: String::new(),
            sent_time: None,
            sequence: 0,
            message_id: String::new(),
        }
    }

    /// Creates a server-originated packet stamped with the current time.
    pub fn system(kind: PacketKind, to: &str, content: impl Into<String>) -> Self {
        Packet {
            from: SYSTEM_SENDER.to_string(),
            to: to.to_string(),
            content: content.into(),
            sent_time: Some(Utc::now()),
            ..Packet::new(kind)
        }
    }

    /// Creates a broadcast `ALERT`.
    pub fn alert(message: impl Into<String>) -> Self {
        Packet::system(PacketKind::Alert, "", message)
    }

    /// Creates an `ERROR` reply.
    pub fn error(message: impl Into<String>) -> Self {
        Packet::system(PacketKind::Error, "", message)
    }

    /// Creates a system notice in a group's message stream.
    pub fn group_notice(group: &str, message: impl Into<String>, sequence: u64) -> Self {
        Packet {
            sequence,
            ..Packet::system(PacketKind::GrpMsg, group, message)
        }
    }

    /// Creates a delivery/read status packet addressed to the original sender.
    pub fn receipt(kind: PacketKind, message_id: &str) -> Self {
        Packet {
            message_id: message_id.to_string(),
            ..Packet::system(kind, "", message_id)
        }
    }
}

/// Errors raised while turning a frame into a `Request`.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("undecodable packet: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown packet type")]
    UnknownType,

    #[error("{0:?} is a server-only packet type")]
    ServerOnly(PacketKind),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("GROUP_PRIV content must be group|target|message")]
    BadGroupPrivate,

    #[error("invalid username")]
    InvalidUsername,
}

/// Which side of a conversation a `CLEAR_CHAT` applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    Private,
    Group,
}

/// An inbound packet, narrowed to what the router acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Connect { username: String },
    Heartbeat,
    GetStatus,
    CreateGroup { group: String },
    JoinGroup { group: String },
    LeaveGroup { group: String },
    KickMember { group: String, target: String },
    SetAdmin { group: String, new_admin: String },
    DeleteGroup { group: String },
    GroupMessage { group: String, content: String, message_id: String },
    PrivateMessage { to: String, content: String, message_id: String },
    GroupPrivate { group: String, target: String, message: String },
    ClearChat { target: String, scope: ClearScope },
    Delivered { message_id: String },
    Read { message_id: String },
    GetHistory { conversation: String },
    Typing { to: String, content: String },
    GetGroupMembers { group: String },
}

fn required(value: String, field: &'static str) -> Result<String, ProtocolError> {
    if value.trim().is_empty() {
        Err(ProtocolError::MissingField(field))
    } else {
        Ok(value)
    }
}

impl Request {
    /// Narrows a decoded packet into a request.
    pub fn from_packet(packet: Packet) -> Result<Self, ProtocolError> {
        let Packet {
            kind,
            from,
            to,
            content,
            message_id,
            ..
        } = packet;

        let request = match kind {
            PacketKind::Conn => {
                if !validate_username(&from) {
                    return Err(ProtocolError::InvalidUsername);
                }
                Request::Connect { username: from }
            }
            PacketKind::Heartbeat => Request::Heartbeat,
            PacketKind::GetStatus => Request::GetStatus,
            PacketKind::GrpCreate => Request::CreateGroup {
                group: required(content, "content")?,
            },
            PacketKind::GrpJoin => Request::JoinGroup {
                group: required(to, "to")?,
            },
            PacketKind::GrpLeave => Request::LeaveGroup {
                group: required(to, "to")?,
            },
            PacketKind::GrpKick => Request::KickMember {
                group: required(to, "to")?,
                target: required(content, "content")?,
            },
            PacketKind::GrpSetAdmin => Request::SetAdmin {
                group: required(to, "to")?,
                new_admin: required(content, "content")?,
            },
            PacketKind::GrpDelete => Request::DeleteGroup {
                group: required(to, "to")?,
            },
            PacketKind::GrpMsg => Request::GroupMessage {
                group: required(to, "to")?,
                content,
                message_id,
            },
            PacketKind::Priv => Request::PrivateMessage {
                to: required(to, "to")?,
                content,
                message_id,
            },
            PacketKind::GroupPriv => {
                let mut parts = content.splitn(3, '|');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(group), Some(target), Some(message))
                        if !group.is_empty() && !target.is_empty() =>
                    {
                        Request::GroupPrivate {
                            group: group.to_string(),
                            target: target.to_string(),
                            message: message.to_string(),
                        }
                    }
                    _ => return Err(ProtocolError::BadGroupPrivate),
                }
            }
            PacketKind::ClearChat => {
                let scope = match content.as_str() {
                    "private" => ClearScope::Private,
                    "group" => ClearScope::Group,
                    _ => return Err(ProtocolError::MissingField("content")),
                };
                Request::ClearChat {
                    target: required(to, "to")?,
                    scope,
                }
            }
            PacketKind::MsgDelivered => Request::Delivered {
                message_id: required(content, "content")?,
            },
            PacketKind::MsgRead => Request::Read {
                message_id: required(content, "content")?,
            },
            PacketKind::GetHistory => Request::GetHistory {
                conversation: required(content, "content")?,
            },
            PacketKind::Typing => Request::Typing {
                to: required(to, "to")?,
                content,
            },
            PacketKind::GetGroupMembers => Request::GetGroupMembers {
                group: required(content, "content")?,
            },
            PacketKind::SyncData
            | PacketKind::Alert
            | PacketKind::GroupMembers
            | PacketKind::HistoryData
            | PacketKind::Kicked
            | PacketKind::MsgSent
            | PacketKind::Error => return Err(ProtocolError::ServerOnly(kind)),
            PacketKind::Unknown => return Err(ProtocolError::UnknownType),
        };
        Ok(request)
    }
}

/// Validates a username: 1-32 characters, none of them a wire delimiter.
///
/// `_` separates `messageId` segments, `|` and `,` separate snapshot fields.
pub fn validate_username(name: &str) -> bool {
    let len = name.chars().count();
    (1..=MAX_USERNAME_LEN).contains(&len)
        && name != SYSTEM_SENDER
        && !name
            .chars()
            .any(|c| c == '_' || c == '|' || c == ',' || c.is_whitespace() || c.is_control())
}

/// Validates a group name: 1-64 characters, no snapshot delimiters.
pub fn validate_group_name(name: &str) -> bool {
    let len = name.chars().count();
    (1..=MAX_GROUP_NAME_LEN).contains(&len)
        && name.trim() == name
        && !name.chars().any(|c| c == '|' || c == ',' || c.is_control())
}

/// Nanoseconds since the Unix epoch, read from a monotonic clock anchored to
/// the wall clock on first use. Never returns the same value twice.
fn monotonic_nanos() -> u64 {
    static ANCHOR: OnceLock<(Instant, u64)> = OnceLock::new();
    static LAST: AtomicU64 = AtomicU64::new(0);

    let (origin, epoch) = *ANCHOR.get_or_init(|| {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        (Instant::now(), u64::try_from(wall).unwrap_or_default())
    });
    let elapsed = u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
    let now = epoch.saturating_add(elapsed);

    let previous = LAST
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(now.max(last.saturating_add(1)))
        })
        .unwrap_or_else(|last| last);
    now.max(previous.saturating_add(1))
}

/// Generates a globally unique message id: `<sender>_<monotonic-nanos>_<random>`.
pub fn new_message_id(sender: &str) -> String {
    format!(
        "{}_{}_{}",
        sender,
        monotonic_nanos(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Extracts the original sender from a message id (its first segment).
pub fn sender_of_message_id(message_id: &str) -> Option<&str> {
    let (sender, rest) = message_id.split_once('_')?;
    if sender.is_empty() || rest.is_empty() {
        None
    } else {
        Some(sender)
    }
}

/// Decodes one frame.
pub fn decode_packet(data: &[u8]) -> Result<Packet, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}

/// Encodes a packet as a JSON text frame.
pub fn encode_packet(packet: &Packet) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(packet)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(kind: PacketKind, from: &str, to: &str, content: &str) -> Packet {
        Packet {
            from: from.to_string(),
            to: to.to_string(),
            content: content.to_string(),
            ..Packet::new(kind)
        }
    }

    #[test]
    fn test_wire_field_names() {
        let mut p = Packet::system(PacketKind::SyncData, "alice", "bob|online");
        p.group_list = "team|admin|1|1".to_string();
        p.message_id = "x_1_2".to_string();
        let json: serde_json::Value = serde_json::from_str(&encode_packet(&p).unwrap()).unwrap();

        assert_eq!(json["type"], "SYNC_DATA");
        assert_eq!(json["from"], "SYSTEM");
        assert_eq!(json["groupList"], "team|admin|1|1");
        assert_eq!(json["messageId"], "x_1_2");
        assert!(json["sentTime"].is_string());
        assert!(json.get("allGroups").is_none());
    }

    #[test]
    fn test_decode_minimal_packet() {
        let p = decode_packet(br#"{"type":"HEARTBEAT"}"#).unwrap();
        assert_eq!(p.kind, PacketKind::Heartbeat);
        assert!(p.from.is_empty());
        assert_eq!(p.sequence, 0);
    }

    #[test]
    fn test_decode_unknown_type() {
        let p = decode_packet(br#"{"type":"FLY_TO_MOON","from":"a"}"#).unwrap();
        assert_eq!(p.kind, PacketKind::Unknown);
        assert!(matches!(
            Request::from_packet(p),
            Err(ProtocolError::UnknownType)
        ));
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        assert!(matches!(
            decode_packet(b"not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_group_private_split() {
        let req = Request::from_packet(packet(
            PacketKind::GroupPriv,
            "alice",
            "",
            "team|bob|hi | there",
        ))
        .unwrap();
        assert_eq!(
            req,
            Request::GroupPrivate {
                group: "team".to_string(),
                target: "bob".to_string(),
                message: "hi | there".to_string(),
            }
        );
    }

    #[test]
    fn test_group_private_rejects_two_parts() {
        let result = Request::from_packet(packet(PacketKind::GroupPriv, "a", "", "team|bob"));
        assert!(matches!(result, Err(ProtocolError::BadGroupPrivate)));
    }

    #[test]
    fn test_server_only_kinds_rejected() {
        let result = Request::from_packet(packet(PacketKind::SyncData, "a", "", ""));
        assert!(matches!(
            result,
            Err(ProtocolError::ServerOnly(PacketKind::SyncData))
        ));
    }

    #[test]
    fn test_clear_chat_scope() {
        let req = Request::from_packet(packet(PacketKind::ClearChat, "a", "team", "group")).unwrap();
        assert_eq!(
            req,
            Request::ClearChat {
                target: "team".to_string(),
                scope: ClearScope::Group
            }
        );
        assert!(Request::from_packet(packet(PacketKind::ClearChat, "a", "b", "all")).is_err());
    }

    #[test]
    fn test_conn_requires_valid_username() {
        assert!(Request::from_packet(packet(PacketKind::Conn, "alice", "", "")).is_ok());
        assert!(matches!(
            Request::from_packet(packet(PacketKind::Conn, "al_ice", "", "")),
            Err(ProtocolError::InvalidUsername)
        ));
    }

    #[test]
    fn test_validate_username() {
        assert!(validate_username("bob"));
        assert!(validate_username(&"b".repeat(MAX_USERNAME_LEN)));
        assert!(!validate_username(""));
        assert!(!validate_username(&"b".repeat(MAX_USERNAME_LEN + 1)));
        assert!(!validate_username("a|b"));
        assert!(!validate_username("a,b"));
        assert!(!validate_username("a b"));
        assert!(!validate_username(SYSTEM_SENDER));
    }

    #[test]
    fn test_validate_group_name() {
        assert!(validate_group_name("team"));
        assert!(validate_group_name("night shift"));
        assert!(!validate_group_name(""));
        assert!(!validate_group_name(" team"));
        assert!(!validate_group_name("a|b"));
        assert!(!validate_group_name("a,b"));
        assert!(!validate_group_name(&"g".repeat(MAX_GROUP_NAME_LEN + 1)));
    }

    #[test]
    fn test_message_id_carries_sender() {
        let id = new_message_id("alice");
        assert!(id.starts_with("alice_"));
        assert_eq!(id.split('_').count(), 3);
        assert_eq!(sender_of_message_id(&id), Some("alice"));
        assert_ne!(id, new_message_id("alice"));
    }

    #[test]
    fn test_message_id_clock_strictly_increases() {
        let stamps: Vec<u64> = (0..1000)
            .map(|_| {
                let id = new_message_id("alice");
                id.split('_').nth(1).unwrap().parse().unwrap()
            })
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sender_of_message_id_needs_two_segments() {
        assert_eq!(sender_of_message_id("alice"), None);
        assert_eq!(sender_of_message_id("_123"), None);
        assert_eq!(sender_of_message_id("bob_1"), Some("bob"));
    }
}
