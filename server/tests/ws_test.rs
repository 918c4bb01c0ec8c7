//! Integration tests for websocket auth, dispatch, fan-out and per-connection limits.

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;

use huddle_server::chat::{ConversationKind, NewConversation};

async fn seed_conversation(server: &TestServer, members: &[&str]) -> String {
    server
        .state
        .chat
        .create_conversation(NewConversation {
            tenant_id: "t1".into(),
            kind: ConversationKind::Group,
            title: Some("conv-1".into()),
            created_by: members[0].into(),
            members: members.iter().map(|m| m.to_string()).collect(),
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_upgrade_without_token_is_rejected() {
    let server = start_test_server().await;
    let url = format!("ws://{}/ws", server.addr);
    match tokio_tungstenite::connect_async(url).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_upgrade_with_bad_token_is_rejected() {
    let server = start_test_server().await;
    match tokio_tungstenite::connect_async(server.ws_url("not-a-jwt")).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_upgrade_with_bearer_header() {
    let server = start_test_server().await;
    let mut req = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
    req.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", server.token("alice", "t1")).parse().unwrap(),
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();

    let pong = request(&mut ws, "ping", json!({}), "p1").await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["success"], true);
}

#[tokio::test]
async fn test_message_reaches_joined_members_only() {
    let server = start_test_server().await;
    let conv = seed_conversation(&server, &["alice", "bob"]).await;

    let mut a = server.connect("alice").await;
    let mut b = server.connect("bob").await;
    let mut d = server.connect("dave").await;

    let joined = request(&mut a, "conversation.join", json!({ "conversation_id": conv }), "j-a").await;
    assert_eq!(joined["success"], true);
    let joined = request(&mut b, "conversation.join", json!({ "conversation_id": conv }), "j-b").await;
    assert_eq!(joined["success"], true);

    let sent = request(
        &mut a,
        "message.send",
        json!({ "conversation_id": conv, "content": "hello B" }),
        "s1",
    )
    .await;
    assert_eq!(sent["success"], true);

    let received = next_of_type(&mut b, "message.receive").await;
    assert_eq!(received["data"]["conversation_id"], conv);
    assert_eq!(received["data"]["content"], "hello B");
    assert_eq!(received["data"]["sender_id"], "alice");

    assert!(next_json_within(&mut d, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_non_member_cannot_join() {
    let server = start_test_server().await;
    let conv = seed_conversation(&server, &["alice", "bob"]).await;
    let mut d = server.connect("dave").await;

    let reply = request(&mut d, "conversation.join", json!({ "conversation_id": conv }), "j").await;
    assert_eq!(reply["success"], false);
    assert_eq!(reply["code"], "forbidden");
}

#[tokio::test]
async fn test_unknown_type_keeps_connection_open() {
    let server = start_test_server().await;
    let mut ws = server.connect("alice").await;

    let reply = request(&mut ws, "bogus.type", json!({}), "u1").await;
    assert_eq!(reply["success"], false);
    assert_eq!(reply["code"], "unknown_type");

    let pong = request(&mut ws, "ping", json!({}), "p1").await;
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn test_malformed_envelope_gets_error() {
    let server = start_test_server().await;
    let mut ws = server.connect("alice").await;

    send_json(&mut ws, json!({ "data": {} })).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["success"], false);
    assert_eq!(reply["code"], "invalid_message");
}

#[tokio::test]
async fn test_rate_limit_rejects_sixty_first_message() {
    let server = start_test_server().await;
    let mut ws = server.connect("alice").await;

    for i in 0..61 {
        send_json(
            &mut ws,
            json!({ "type": "conversation.list", "request_id": format!("r{}", i) }),
        )
        .await;
    }

    let mut replies = Vec::new();
    while replies.len() < 61 {
        let frame = next_json(&mut ws).await;
        if frame["type"] == "conversation.list" {
            replies.push(frame);
        }
    }
    assert!(replies[..60].iter().all(|r| r["success"] == true));
    assert_eq!(replies[60]["success"], false);
    assert_eq!(replies[60]["code"], "rate_limited");
    assert_eq!(replies[60]["request_id"], "r60");

    // Heartbeats are exempt
    let pong = request(&mut ws, "ping", json!({}), "hb").await;
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn test_oversized_frame_is_refused() {
    let server = start_test_server_with(|config| config.realtime.max_message_bytes = 1024).await;
    let mut ws = server.connect("alice").await;

    let big = "x".repeat(2048);
    send_json(&mut ws, json!({ "type": "ping", "data": { "pad": big } })).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["success"], false);
    assert_eq!(reply["code"], "message_too_large");

    let pong = request(&mut ws, "ping", json!({}), "p1").await;
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn test_status_watchers_see_connect_and_disconnect() {
    let server = start_test_server().await;
    let mut watcher = server.connect("alice").await;

    let snapshot = request(
        &mut watcher,
        "user.status.subscribe",
        json!({ "user_ids": ["bob"] }),
        "w1",
    )
    .await;
    assert_eq!(snapshot["success"], true);
    assert_eq!(snapshot["data"]["statuses"][0]["status"], "offline");

    let bob = server.connect("bob").await;
    let online = next_of_type(&mut watcher, "user.status").await;
    assert_eq!(online["data"]["user_id"], "bob");
    assert_eq!(online["data"]["status"], "online");

    drop(bob);
    let offline = next_of_type(&mut watcher, "user.status").await;
    assert_eq!(offline["data"]["status"], "offline");
}

#[tokio::test]
async fn test_create_direct_conversation_notifies_peer() {
    let server = start_test_server().await;
    let mut a = server.connect("alice").await;
    let mut b = server.connect("bob").await;

    let created = request(
        &mut a,
        "conversation.create",
        json!({ "kind": "direct", "member_ids": ["bob"] }),
        "c1",
    )
    .await;
    assert_eq!(created["success"], true);
    let conv_id = created["data"]["conversation"]["id"].as_str().unwrap().to_string();

    let event = next_of_type(&mut b, "conversation.created").await;
    assert_eq!(event["data"]["id"], conv_id.as_str());

    // A second create for the same pair returns the existing conversation
    let again = request(
        &mut a,
        "conversation.create",
        json!({ "kind": "direct", "member_ids": ["bob"] }),
        "c2",
    )
    .await;
    assert_eq!(again["data"]["conversation"]["id"], conv_id.as_str());
    assert_eq!(again["data"]["created"], false);
}

/// Poll until the user has no live connection and no online key.
async fn wait_until_offline(server: &TestServer, user: &str) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if !server.state.hub.is_user_connected(user)
            && server.state.presence.is_online(user).await == Some(false)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_silent_client_dropped_after_read_deadline() {
    let server = start_test_server_with(|config| config.realtime.pong_wait_secs = 1).await;
    let mut ws = server.connect("alice").await;
    let pong = request(&mut ws, "ping", json!({}), "p1").await;
    assert_eq!(pong["type"], "pong");
    assert!(server.state.hub.is_user_connected("alice"));

    // Never polled again, so the server's pings go unanswered
    assert!(wait_until_offline(&server, "alice").await);
}

#[tokio::test]
async fn test_app_ping_keeps_read_deadline_alive() {
    let server = start_test_server_with(|config| config.realtime.pong_wait_secs = 1).await;
    let mut ws = server.connect("alice").await;
    request(&mut ws, "ping", json!({}), "p0").await;

    // Sends only; protocol pings are never answered, so app pings alone hold the deadline
    for i in 0..8 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        send_json(&mut ws, json!({ "type": "ping", "request_id": format!("hb{}", i) })).await;
    }
    assert!(server.state.hub.is_user_connected("alice"));

    let pong = request(&mut ws, "ping", json!({}), "last").await;
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn test_app_ping_is_not_rate_limited() {
    let server = start_test_server_with(|config| config.realtime.rate_limit_messages = 3).await;
    let mut ws = server.connect("alice").await;

    for i in 0..10 {
        let pong = request(&mut ws, "ping", json!({}), &format!("hb{}", i)).await;
        assert_eq!(pong["success"], true);
    }
    for i in 0..3 {
        let listed = request(&mut ws, "conversation.list", json!({}), &format!("l{}", i)).await;
        assert_eq!(listed["success"], true);
    }
    let limited = request(&mut ws, "conversation.list", json!({}), "l3").await;
    assert_eq!(limited["code"], "rate_limited");
}

#[tokio::test]
async fn test_slow_consumer_gets_policy_close() {
    use futures_util::StreamExt;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message;

    let server = start_test_server_with(|config| config.realtime.outbound_queue_capacity = 1).await;
    let mut ws = server.connect("alice").await;
    request(&mut ws, "ping", json!({}), "p1").await;

    // Single-threaded test runtime: the writer cannot drain between these enqueues
    for i in 0..8 {
        server
            .state
            .hub
            .broadcast_to_users(&["alice"][..], "notification.message", json!({ "n": i }));
    }
    assert!(!server.state.hub.is_user_connected("alice"));

    let mut close_code = None;
    while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
        match frame {
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|f| f.code);
                break;
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    assert_eq!(close_code, Some(CloseCode::Policy));
}
