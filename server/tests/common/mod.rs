//! Shared helpers: boot the router on an ephemeral port and drive it over
//! real websockets and HTTP.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use huddle_server::auth::jwt::issue_access_token;
use huddle_server::config::Config;
use huddle_server::state::AppState;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub base_url: String,
    pub state: AppState,
    pub shutdown: CancellationToken,
    _dir: TempDir,
}

impl TestServer {
    pub fn token(&self, user_id: &str, tenant_id: &str) -> String {
        issue_access_token(&self.state.jwt_secret, user_id, tenant_id).unwrap()
    }

    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={}", self.addr, token)
    }

    pub async fn connect(&self, user_id: &str) -> WsStream {
        let token = self.token(user_id, "t1");
        let (ws, _) = tokio_tungstenite::connect_async(self.ws_url(&token))
            .await
            .expect("WebSocket connect failed");
        ws
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Start the server on a random port with a fresh data dir.
pub async fn start_test_server() -> TestServer {
    start_test_server_with(|_| {}).await
}

pub async fn start_test_server_with(configure: impl FnOnce(&mut Config)) -> TestServer {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = dir.path().to_str().unwrap().to_string();

    let mut config = Config::default();
    config.data_dir = data_dir.clone();
    config.scheduler.poll_interval_ms = 50;
    configure(&mut config);

    let db = huddle_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = huddle_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");
    let state = AppState::build(&config, db, jwt_secret);

    let shutdown = CancellationToken::new();
    if config.scheduler.enabled {
        state.scheduler.reload_scheduled().await.unwrap();
        state.scheduler.clone().spawn(shutdown.clone());
    }

    let app = huddle_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        base_url: format!("http://{}", addr),
        state,
        shutdown,
        _dir: dir,
    }
}

pub async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("WebSocket send failed");
}

/// Next text frame as JSON, or `None` if nothing arrives within `wait`.
pub async fn next_json_within(ws: &mut WsStream, wait: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next()).await.ok()??;
        match frame {
            Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

pub async fn next_json(ws: &mut WsStream) -> Value {
    next_json_within(ws, Duration::from_secs(5))
        .await
        .expect("expected a frame")
}

/// Skip frames until one of type `kind` arrives.
pub async fn next_of_type(ws: &mut WsStream, kind: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = next_json_within(ws, remaining)
            .await
            .unwrap_or_else(|| panic!("no {} frame arrived", kind));
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Send a request and wait for the reply carrying its request id.
pub async fn request(ws: &mut WsStream, kind: &str, data: Value, request_id: &str) -> Value {
    send_json(
        ws,
        serde_json::json!({ "type": kind, "data": data, "request_id": request_id }),
    )
    .await;
    loop {
        let frame = next_json(ws).await;
        if frame["request_id"] == request_id {
            return frame;
        }
    }
}
