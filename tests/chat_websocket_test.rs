// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket integration tests for the chat server.
//!
//! These tests spin up a real TCP listener, connect via WebSocket, and exercise
//! the full connection flow end-to-end. Each test binds to port 0 for isolation.

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use common::{packet, start_default_server, start_server, TestClient};
use nexchat_server::config::ServerConfig;

// ============================================================================
// Handshake and identification
// ============================================================================

#[tokio::test]
async fn test_handshake_outside_endpoint_is_404() {
    let (addr, _state) = start_default_server().await;

    let result = connect_async(format!("ws://{}/chat", addr)).await;
    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("expected HTTP 404, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_trailing_slash_endpoint_is_accepted() {
    let (addr, _state) = start_default_server().await;
    assert!(connect_async(format!("ws://{}/ws/", addr)).await.is_ok());
}

#[tokio::test]
async fn test_conn_yields_snapshot_with_self_online() {
    let (addr, _state) = start_default_server().await;
    let mut alice = TestClient::connect(addr).await;

    alice.send(packet("CONN", "alice", "", "")).await;
    let snapshot = alice.recv_kind("SYNC_DATA").await;

    assert_eq!(snapshot["from"], "SYSTEM");
    assert_eq!(snapshot["to"], "alice");
    assert_eq!(snapshot["content"], "alice|online");
}

#[tokio::test]
async fn test_invalid_username_gets_error() {
    let (addr, state) = start_default_server().await;
    let mut client = TestClient::connect(addr).await;

    client.send(packet("CONN", "bad|name", "", "")).await;
    let reply = client.recv().await.unwrap();

    assert_eq!(reply["type"], "ERROR");
    assert_eq!(reply["content"], "Invalid username");
    assert_eq!(state.router.sessions().online_count(), 0);
}

#[tokio::test]
async fn test_packets_before_conn_are_dropped() {
    let (addr, _state) = start_default_server().await;
    let mut bob = TestClient::login(addr, "bob").await;
    let mut anonymous = TestClient::connect(addr).await;

    anonymous
        .send(packet("PRIV", "mallory", "bob", "sneaky"))
        .await;
    anonymous.send(packet("CONN", "alice", "", "")).await;

    // Everything bob sees up to alice's arrival must be free of the PRIV
    loop {
        let p = bob.recv().await.unwrap();
        assert_ne!(p["type"], "PRIV");
        if p["type"] == "ALERT" && p["content"] == "alice has joined the chat" {
            break;
        }
    }
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let (addr, _state) = start_default_server().await;
    let mut alice = TestClient::login(addr, "alice").await;

    alice
        .ws
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();
    alice.send(json!({"type": "NO_SUCH_TYPE"})).await;
    alice.send(packet("GET_STATUS", "alice", "", "")).await;

    let snapshot = alice.recv_kind("SYNC_DATA").await;
    assert_eq!(snapshot["content"], "alice|online");
}

#[tokio::test]
async fn test_oversized_frame_is_dropped_and_connection_continues() {
    let config = ServerConfig {
        max_message_size: 1024,
        ..ServerConfig::default()
    };
    let (addr, state) = start_server(config).await;
    let mut alice = TestClient::login(addr, "alice").await;
    let mut bob = TestClient::login(addr, "bob").await;

    let huge = "x".repeat(4096);
    alice.send(packet("PRIV", "alice", "bob", &huge)).await;
    alice.send(packet("GET_STATUS", "alice", "", "")).await;

    let snapshot = alice.recv_kind("SYNC_DATA").await;
    assert_eq!(snapshot["content"], "alice|online,bob|online");
    assert_eq!(state.metrics.packets_rejected.get(), 1);

    // The oversized PRIV never reached bob
    alice.send(packet("PRIV", "alice", "bob", "small")).await;
    let message = bob.recv_kind("PRIV").await;
    assert_eq!(message["content"], "small");
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let (addr, _state) = start_default_server().await;
    let mut alice = TestClient::login(addr, "alice").await;

    alice.ws.send(Message::Ping(vec![1, 2, 3])).await.unwrap();

    loop {
        let msg = tokio::time::timeout(common::RECV_TIMEOUT, alice.ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Pong(data) = msg {
            assert_eq!(data, vec![1, 2, 3]);
            break;
        }
    }
}

// ============================================================================
// Private messaging
// ============================================================================

#[tokio::test]
async fn test_private_message_between_online_users() {
    let (addr, _state) = start_default_server().await;
    let mut alice = TestClient::login(addr, "alice").await;
    let mut bob = TestClient::login(addr, "bob").await;

    alice.send(packet("PRIV", "alice", "bob", "hi bob")).await;

    let message = bob.recv_kind("PRIV").await;
    assert_eq!(message["from"], "alice");
    assert_eq!(message["content"], "hi bob");
    assert_eq!(message["sequence"], 1);
    let message_id = message["messageId"].as_str().unwrap().to_string();
    assert!(message_id.starts_with("alice_"));

    let sent = alice.recv_kind("MSG_SENT").await;
    assert_eq!(sent["to"], "bob");
    assert_eq!(sent["messageId"], message_id.as_str());
}

#[tokio::test]
async fn test_sender_cannot_spoof_from() {
    let (addr, _state) = start_default_server().await;
    let mut alice = TestClient::login(addr, "alice").await;
    let mut bob = TestClient::login(addr, "bob").await;

    alice.send(packet("PRIV", "carol", "bob", "it's me")).await;

    let message = bob.recv_kind("PRIV").await;
    assert_eq!(message["from"], "alice");
}

#[tokio::test]
async fn test_offline_message_replayed_on_reconnect() {
    let (addr, _state) = start_default_server().await;
    let mut alice = TestClient::login(addr, "alice").await;

    alice.send(packet("PRIV", "alice", "carol", "see you later")).await;
    let sent = alice.recv_kind("MSG_SENT").await;

    let mut carol = TestClient::connect(addr).await;
    carol.send(packet("CONN", "carol", "", "")).await;

    // Replay comes before the snapshot
    let first = carol.recv().await.unwrap();
    assert_eq!(first["type"], "PRIV");
    assert_eq!(first["content"], "see you later");
    assert_eq!(first["messageId"], sent["messageId"]);
    assert_eq!(carol.recv().await.unwrap()["type"], "SYNC_DATA");
}

#[tokio::test]
async fn test_read_receipt_reaches_sender() {
    let (addr, _state) = start_default_server().await;
    let mut alice = TestClient::login(addr, "alice").await;
    let mut bob = TestClient::login(addr, "bob").await;

    alice.send(packet("PRIV", "alice", "bob", "read me")).await;
    let message = bob.recv_kind("PRIV").await;
    let message_id = message["messageId"].as_str().unwrap();

    bob.send(packet("MSG_DELIVERED", "bob", "", message_id)).await;
    bob.send(packet("MSG_READ", "bob", "", message_id)).await;

    let delivered = alice.recv_kind("MSG_DELIVERED").await;
    assert_eq!(delivered["messageId"], message_id);
    let read = alice.recv_kind("MSG_READ").await;
    assert_eq!(read["content"], message_id);
}

// ============================================================================
// Groups
// ============================================================================

#[tokio::test]
async fn test_group_create_join_and_message() {
    let (addr, _state) = start_default_server().await;
    let mut alice = TestClient::login(addr, "alice").await;
    let mut bob = TestClient::login(addr, "bob").await;

    alice.send(packet("GRP_CREATE", "alice", "", "team")).await;
    let snapshot = alice
        .recv_until(|p| p["type"] == "SYNC_DATA" && p["groupList"] == "team|admin|1|1")
        .await;
    assert!(snapshot["allGroups"].as_str().unwrap().starts_with("team|"));

    bob.send(packet("GRP_JOIN", "bob", "team", "")).await;
    let welcome = bob.recv_kind("GRP_MSG").await;
    assert_eq!(welcome["from"], "SYSTEM");
    assert_eq!(welcome["content"], "Welcome to 'team'!");

    let joined = alice
        .recv_until(|p| p["type"] == "GRP_MSG" && p["from"] == "SYSTEM")
        .await;
    assert_eq!(joined["content"], "bob has joined the group");

    alice.send(packet("GRP_MSG", "alice", "team", "standup")).await;
    let message = bob
        .recv_until(|p| p["type"] == "GRP_MSG" && p["from"] == "alice")
        .await;
    assert_eq!(message["to"], "team");
    assert_eq!(message["content"], "standup");
    assert!(message["sequence"].as_u64().unwrap() > joined["sequence"].as_u64().unwrap());
}

#[tokio::test]
async fn test_group_private_from_non_member_is_rejected() {
    let (addr, _state) = start_default_server().await;
    let mut alice = TestClient::login(addr, "alice").await;
    let mut eve = TestClient::login(addr, "eve").await;

    alice.send(packet("GRP_CREATE", "alice", "", "team")).await;
    alice
        .recv_until(|p| p["type"] == "SYNC_DATA" && p["groupList"] == "team|admin|1|1")
        .await;

    eve.send(packet("GROUP_PRIV", "eve", "", "team|alice|psst")).await;
    let error = eve.recv_kind("ERROR").await;
    assert_eq!(error["content"], "You are not a member of group 'team'");
}

#[tokio::test]
async fn test_disconnect_hands_admin_to_next_member() {
    let (addr, state) = start_default_server().await;
    let mut alice = TestClient::login(addr, "alice").await;
    let mut bob = TestClient::login(addr, "bob").await;

    alice.send(packet("GRP_CREATE", "alice", "", "team")).await;
    alice
        .recv_until(|p| p["type"] == "SYNC_DATA" && p["groupList"] == "team|admin|1|1")
        .await;
    bob.send(packet("GRP_JOIN", "bob", "team", "")).await;
    bob.recv_kind("GRP_MSG").await;

    drop(alice);

    let notice = bob
        .recv_until(|p| p["type"] == "GRP_MSG" && p["content"] == "bob is now the admin")
        .await;
    assert_eq!(notice["to"], "team");
    bob.recv_until(|p| p["type"] == "ALERT" && p["content"] == "alice has disconnected")
        .await;
    assert_eq!(state.router.groups().get("team").unwrap().admin, "bob");
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn test_reconnect_supersedes_previous_connection() {
    let (addr, state) = start_default_server().await;
    let mut first = TestClient::login(addr, "alice").await;
    let _second = TestClient::login(addr, "alice").await;

    assert!(first.closed().await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.router.sessions().is_online("alice"));
    assert_eq!(state.router.sessions().online_count(), 1);
}

#[tokio::test]
async fn test_anonymous_connection_is_closed_after_identify_timeout() {
    let config = ServerConfig {
        heartbeat_timeout_secs: 1,
        ..ServerConfig::default()
    };
    let (addr, _state) = start_server(config).await;
    let mut client = TestClient::connect(addr).await;

    assert!(client.closed().await);
}

#[tokio::test]
async fn test_silent_session_is_reaped() {
    let config = ServerConfig {
        heartbeat_timeout_secs: 1,
        heartbeat_interval_secs: 1,
        ..ServerConfig::default()
    };
    let (addr, state) = start_server(config).await;
    let _detector = state.spawn_fault_detector();

    let mut alice = TestClient::login(addr, "alice").await;
    let mut bob = TestClient::login(addr, "bob").await;

    // bob keeps heartbeating while alice stays silent
    let alert = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            bob.send(packet("HEARTBEAT", "bob", "", "")).await;
            let Ok(Some(p)) = tokio::time::timeout(Duration::from_millis(200), bob.recv()).await
            else {
                continue;
            };
            if p["type"] == "ALERT" && p["content"] == "alice has disconnected" {
                break p;
            }
        }
    })
    .await
    .expect("alice was never reaped");
    assert_eq!(alert["from"], "SYSTEM");
    assert!(alice.closed().await);
    assert!(state.router.sessions().is_online("bob"));
    assert_eq!(state.metrics.heartbeat_timeouts.get(), 1);
}
