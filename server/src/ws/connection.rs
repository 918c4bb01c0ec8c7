//! One websocket connection: identity, bounded outbound queue and the
//! read/write pumps.
//!
//! The hub owns `Arc<Connection>` handles by id. The read pump holds the hub
//! as a capability (through `AppState`) to dispatch and to unregister; it
//! never owns the hub.

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::config::RealtimeSettings;
use crate::error::HubError;
use crate::presence::PresenceService;
use crate::state::AppState;
use crate::ws::hub::Hub;
use crate::ws::protocol::{decode_envelope, is_heartbeat, types, OutboundEnvelope};
use crate::ws::rate_limit::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// The queue is at capacity; the consumer is too slow.
    Full,
    /// The queue was closed by the hub or the writer is gone.
    Closed,
}

pub struct Connection {
    id: ConnectionId,
    user_id: String,
    tenant_id: String,
    connected_at: DateTime<Utc>,
    /// `None` once closed. Dropping the sender lets the writer drain what is
    /// queued, send a close frame and exit.
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    alive: AtomicBool,
    last_heartbeat: Mutex<Instant>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("tenant_id", &self.tenant_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Connection {
    /// Create a connection handle and the receiving end of its outbound queue.
    pub fn new(
        user_id: &str,
        tenant_id: &str,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            user_id: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            connected_at: Utc::now(),
            outbound: Mutex::new(Some(tx)),
            alive: AtomicBool::new(true),
            last_heartbeat: Mutex::new(Instant::now()),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Enqueue a frame without waiting.
    pub fn try_send(&self, frame: Message) -> SendOutcome {
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return SendOutcome::Closed;
        };
        match tx.try_send(frame) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => SendOutcome::Full,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Close the outbound queue. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.alive.store(false, Ordering::Release);
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn mark_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the peer last proved it was alive.
    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// Drive one authenticated socket until either side goes away.
///
/// Registers with the hub, marks the user online, runs the writer as a task
/// and the reader inline, then always unregisters.
pub async fn run_connection(socket: WebSocket, state: AppState, claims: Claims) {
    let settings = state.realtime.clone();
    let (conn, rx) = Connection::new(&claims.sub, &claims.tenant_id, settings.outbound_queue_capacity);

    let user_connections = attach(&state.hub, &state.presence, &conn).await;
    tracing::info!(
        user_id = %conn.user_id(),
        connection_id = %conn.id(),
        connections = user_connections,
        "WebSocket connection started"
    );

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_pump(sink, rx, conn.clone(), settings.clone()));

    read_pump(stream, &state, &conn, &settings, &mut writer).await;

    writer.abort();
    detach(&state.hub, &state.presence, &conn).await;

    tracing::info!(
        user_id = %conn.user_id(),
        connection_id = %conn.id(),
        "WebSocket connection stopped"
    );
}

/// Register `conn` and refresh the user's online key. The user's first
/// connection also announces "online" to watchers. Returns the user's live
/// connection count.
pub(crate) async fn attach(hub: &Hub, presence: &PresenceService, conn: &Arc<Connection>) -> usize {
    let _gate = hub.lock_presence(conn.user_id()).await;
    let user_connections = hub.register(conn.clone());
    if let Err(e) = presence.set_online(conn.user_id()).await {
        tracing::warn!(user_id = %conn.user_id(), error = %e, "Failed to mark user online");
    }
    if user_connections == 1 {
        announce_status(hub, conn, "online");
    }
    user_connections
}

/// Unregister `conn`; when it was the user's last connection, mark them
/// offline and announce it. Runs under the same per-user gate as [`attach`],
/// so a reconnect cannot interleave with the offline update.
pub(crate) async fn detach(hub: &Hub, presence: &PresenceService, conn: &Arc<Connection>) {
    let _gate = hub.lock_presence(conn.user_id()).await;
    hub.unregister(conn.id());
    if hub.user_connection_count(conn.user_id()) == 0 {
        if let Err(e) = presence.set_offline(conn.user_id()).await {
            tracing::warn!(user_id = %conn.user_id(), error = %e, "Failed to mark user offline");
        }
        announce_status(hub, conn, "offline");
    }
}

/// Status changes reach watchers in the connection's own tenant only.
fn announce_status(hub: &Hub, conn: &Connection, status: &str) {
    let user_id = conn.user_id();
    hub.broadcast_to_watchers(
        conn.tenant_id(),
        user_id,
        types::USER_STATUS,
        json!({
            "user_id": user_id,
            "status": status,
            "timestamp": Utc::now().timestamp(),
        }),
    );
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    conn: &Arc<Connection>,
    settings: &RealtimeSettings,
    writer: &mut JoinHandle<()>,
) {
    let mut limiter = RateLimiter::new(settings.rate_limit_messages, settings.rate_limit_window());
    let mut deadline = Instant::now() + settings.pong_wait();

    loop {
        let msg = tokio::select! {
            next = timeout_at(deadline, stream.next()) => match next {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => {
                    tracing::debug!(connection_id = %conn.id(), error = %e, "WebSocket receive error");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::info!(connection_id = %conn.id(), "Read deadline expired");
                    break;
                }
            },
            _ = &mut *writer => {
                tracing::debug!(connection_id = %conn.id(), "Writer stopped, ending read loop");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if text.len() > settings.max_message_bytes {
                    reply_error(
                        state,
                        conn,
                        HubError::MessageTooLarge {
                            size: text.len(),
                            max: settings.max_message_bytes,
                        },
                    );
                    continue;
                }

                let envelope = decode_envelope(text.as_str());
                let heartbeat = envelope.as_ref().is_ok_and(|env| is_heartbeat(&env.kind));
                if heartbeat {
                    deadline = Instant::now() + settings.pong_wait();
                    conn.mark_heartbeat();
                } else if !limiter.check() {
                    let (kind, request_id) = match &envelope {
                        Ok(env) => (Some(env.kind.as_str()), env.request_id.as_deref()),
                        Err(_) => (None, None),
                    };
                    state.hub.send_envelope(
                        conn,
                        &OutboundEnvelope::error(kind, request_id, &HubError::RateLimited),
                    );
                    continue;
                }

                match envelope {
                    Ok(envelope) => state.hub.dispatch(conn, envelope).await,
                    Err(e) => reply_error(state, conn, e),
                }
            }
            Message::Binary(data) => {
                let err = if data.len() > settings.max_message_bytes {
                    HubError::MessageTooLarge {
                        size: data.len(),
                        max: settings.max_message_bytes,
                    }
                } else {
                    HubError::InvalidMessage("binary frames are not supported".to_string())
                };
                reply_error(state, conn, err);
            }
            Message::Ping(_) | Message::Pong(_) => {
                deadline = Instant::now() + settings.pong_wait();
                conn.mark_heartbeat();
            }
            Message::Close(frame) => {
                tracing::debug!(connection_id = %conn.id(), reason = ?frame, "Client initiated close");
                break;
            }
        }
    }
}

fn reply_error(state: &AppState, conn: &Arc<Connection>, err: HubError) {
    state
        .hub
        .send_envelope(conn, &OutboundEnvelope::error(None, None, &err));
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    conn: Arc<Connection>,
    settings: RealtimeSettings,
) {
    let ping_interval = settings.ping_interval();
    let write_wait = settings.write_wait();
    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent_since_tick = false;

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(frame) => {
                    if !write_frame(&mut sink, frame, write_wait, &conn).await {
                        break;
                    }
                    sent_since_tick = true;
                }
                None => {
                    // Queue closed by the hub: evicted or shutting down
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: "connection closed by server".into(),
                    }));
                    let _ = write_frame(&mut sink, close, write_wait, &conn).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                // A receive-only client still has to answer probes, or its
                // read deadline lapses while events stream out.
                let quiet_peer = conn.heartbeat_age() >= ping_interval;
                if !sent_since_tick || quiet_peer {
                    if !write_frame(&mut sink, Message::Ping(Bytes::new()), write_wait, &conn).await {
                        break;
                    }
                }
                sent_since_tick = false;
            }
        }
    }
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: Message,
    write_wait: Duration,
    conn: &Connection,
) -> bool {
    match timeout(write_wait, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(connection_id = %conn.id(), error = %e, "WebSocket send failed");
            false
        }
        Err(_) => {
            tracing::warn!(connection_id = %conn.id(), "Write deadline exceeded");
            false
        }
    }
}
