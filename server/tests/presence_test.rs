//! Integration tests for the presence REST endpoints.

mod common;

use common::*;
use serde_json::{json, Value};
use std::time::Duration;

async fn get_presence(server: &TestServer, token: &str, user_id: &str) -> Value {
    reqwest::Client::new()
        .get(format!("{}/api/presence/{}", server.base_url, user_id))
        .bearer_auth(token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_presence_requires_auth() {
    let server = start_test_server().await;
    let resp = reqwest::get(format!("{}/api/presence/alice", server.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn test_presence_follows_connection_lifecycle() {
    let server = start_test_server().await;
    let token = server.token("bob", "t1");

    let before = get_presence(&server, &token, "alice").await;
    assert_eq!(before["status"], "offline");
    assert!(before["last_seen"].is_null());

    let ws = server.connect("alice").await;
    // Registration happens right after the upgrade completes
    let mut online = Value::Null;
    for _ in 0..50 {
        online = get_presence(&server, &token, "alice").await;
        if online["status"] == "online" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(online["status"], "online");

    let listed: Value = reqwest::Client::new()
        .get(format!("{}/api/presence/online", server.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["complete"], true);
    assert!(listed["user_ids"].as_array().unwrap().contains(&json!("alice")));

    drop(ws);
    let mut offline = Value::Null;
    for _ in 0..100 {
        offline = get_presence(&server, &token, "alice").await;
        if offline["status"] == "offline" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(offline["status"], "offline");
    assert!(offline["last_seen"].as_i64().is_some());
}

#[tokio::test]
async fn test_batch_presence() {
    let server = start_test_server().await;
    let token = server.token("bob", "t1");
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/presence/batch", server.base_url))
        .bearer_auth(&token)
        .json(&json!({ "user_ids": ["alice", "carol"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(body.len(), 2);
    assert_eq!(body[0]["user_id"], "alice");
    assert_eq!(body[1]["status"], "offline");

    let too_many: Vec<String> = (0..501).map(|i| format!("u{}", i)).collect();
    let resp = client
        .post(format!("{}/api/presence/batch", server.base_url))
        .bearer_auth(&token)
        .json(&json!({ "user_ids": too_many }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_health() {
    let server = start_test_server().await;
    let body: Value = reqwest::get(format!("{}/health", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);
}
