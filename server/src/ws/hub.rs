//! Process-wide registry of live connections and the dispatcher for inbound
//! messages.
//!
//! All registry and subscription state lives in one [`HubState`] behind one
//! mutex, so a connection id is in the subscription index only while it is
//! registered. The lock is held for map edits and recipient collection only;
//! payloads are serialized before it is taken and enqueued after it is released.

use axum::extract::ws::Message;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::HubError;
use crate::ws::connection::{Connection, ConnectionId, SendOutcome};
use crate::ws::handlers::{HandlerContext, HandlerOutput, HandlerTable};
use crate::ws::protocol::{InboundEnvelope, OutboundEnvelope};
use crate::ws::subscriptions::SubscriptionIndex;

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    /// user id -> that user's live connections
    users: HashMap<String, HashSet<ConnectionId>>,
    index: SubscriptionIndex,
    /// connection -> conversation it is currently viewing
    active: HashMap<ConnectionId, String>,
}

pub struct Hub {
    state: Mutex<HubState>,
    handlers: HandlerTable,
    /// Per-user locks ordering first-connect and last-disconnect presence updates.
    presence_gates: DashMap<String, Arc<AsyncMutex<()>>>,
}

/// Exclusive right to run one user's connect or disconnect presence update.
/// The entry is dropped from the gate map once nobody else is waiting on it.
pub struct PresenceGate<'a> {
    gates: &'a DashMap<String, Arc<AsyncMutex<()>>>,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PresenceGate<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.gates
            .remove_if(&self.user_id, |_, gate| Arc::strong_count(gate) == 1);
    }
}

impl Hub {
    pub fn new(handlers: HandlerTable) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            handlers,
            presence_gates: DashMap::new(),
        }
    }

    /// Wait for any in-flight presence update of `user_id` to finish. Hold the
    /// gate across register/unregister and the presence write that follows.
    pub async fn lock_presence(&self, user_id: &str) -> PresenceGate<'_> {
        let gate = self
            .presence_gates
            .entry(user_id.to_string())
            .or_default()
            .clone();
        PresenceGate {
            gates: &self.presence_gates,
            user_id: user_id.to_string(),
            guard: Some(gate.lock_owned().await),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Registry ---

    /// Add a connection. Subscriptions are never implied.
    /// Returns how many live connections the user now has.
    pub fn register(&self, conn: Arc<Connection>) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let user_conns = state.users.entry(conn.user_id().to_string()).or_default();
        user_conns.insert(conn.id());
        let count = user_conns.len();
        state.connections.insert(conn.id(), conn);
        count
    }

    /// Remove a connection from the registry and from every subscription,
    /// then close its outbound queue. Safe to call more than once.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let conn = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let conn = state.connections.remove(&id)?;
            if let Some(user_conns) = state.users.get_mut(conn.user_id()) {
                user_conns.remove(&id);
                if user_conns.is_empty() {
                    state.users.remove(conn.user_id());
                }
            }
            state.index.remove_connection(id);
            state.active.remove(&id);
            conn
        };
        conn.close();
        tracing::debug!(
            user_id = %conn.user_id(),
            connection_id = %id,
            "Connection unregistered"
        );
        Some(conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.lock().connections.get(&id).cloned()
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.lock().users.get(user_id).map_or(0, HashSet::len)
    }

    pub fn is_user_connected(&self, user_id: &str) -> bool {
        self.user_connection_count(user_id) > 0
    }

    // --- Subscriptions ---

    /// Returns Ok(false) if already subscribed.
    pub fn subscribe_conversation(
        &self,
        id: ConnectionId,
        conversation_id: &str,
    ) -> Result<bool, HubError> {
        let mut state = self.lock();
        if !state.connections.contains_key(&id) {
            return Err(HubError::NotFound(format!("connection {}", id)));
        }
        Ok(state.index.subscribe_conversation(conversation_id, id))
    }

    pub fn unsubscribe_conversation(&self, id: ConnectionId, conversation_id: &str) -> bool {
        self.lock().index.unsubscribe_conversation(conversation_id, id)
    }

    pub fn watch_user(&self, id: ConnectionId, user_id: &str) -> Result<bool, HubError> {
        let mut state = self.lock();
        if !state.connections.contains_key(&id) {
            return Err(HubError::NotFound(format!("connection {}", id)));
        }
        Ok(state.index.watch_user(user_id, id))
    }

    pub fn unwatch_user(&self, id: ConnectionId, user_id: &str) -> bool {
        self.lock().index.unwatch_user(user_id, id)
    }

    pub fn is_subscribed(&self, id: ConnectionId, conversation_id: &str) -> bool {
        self.lock().index.is_subscribed(conversation_id, id)
    }

    pub fn conversation_subscribers(&self, conversation_id: &str) -> Vec<ConnectionId> {
        self.lock().index.conversation_subscribers(conversation_id)
    }

    // --- Active conversation ---

    /// Set (or clear with `None`) the conversation a connection is viewing.
    /// Returns the previous one.
    pub fn set_active_conversation(
        &self,
        id: ConnectionId,
        conversation_id: Option<&str>,
    ) -> Option<String> {
        let mut state = self.lock();
        if !state.connections.contains_key(&id) {
            return None;
        }
        match conversation_id {
            Some(conv) => state.active.insert(id, conv.to_string()),
            None => state.active.remove(&id),
        }
    }

    pub fn active_conversation(&self, id: ConnectionId) -> Option<String> {
        self.lock().active.get(&id).cloned()
    }

    /// Users with at least one connection currently viewing the conversation.
    pub fn users_viewing(&self, conversation_id: &str) -> HashSet<String> {
        let state = self.lock();
        state
            .active
            .iter()
            .filter(|(_, conv)| conv.as_str() == conversation_id)
            .filter_map(|(id, _)| state.connections.get(id))
            .map(|conn| conn.user_id().to_string())
            .collect()
    }

    // --- Broadcast primitives ---

    /// Send an event to every connection subscribed to the conversation.
    /// Returns the number of connections it was queued for.
    pub fn broadcast_to_conversation(&self, conversation_id: &str, kind: &str, data: Value) -> usize {
        self.broadcast_to_conversation_inner(conversation_id, kind, data, None)
    }

    /// Same as [`Hub::broadcast_to_conversation`], skipping one connection
    /// (typically the sender's).
    pub fn broadcast_to_conversation_except(
        &self,
        conversation_id: &str,
        kind: &str,
        data: Value,
        except: ConnectionId,
    ) -> usize {
        self.broadcast_to_conversation_inner(conversation_id, kind, data, Some(except))
    }

    fn broadcast_to_conversation_inner(
        &self,
        conversation_id: &str,
        kind: &str,
        data: Value,
        except: Option<ConnectionId>,
    ) -> usize {
        let Some(frame) = encode(kind, data) else {
            return 0;
        };
        let targets: Vec<Arc<Connection>> = {
            let state = self.lock();
            state
                .index
                .conversation_subscribers(conversation_id)
                .into_iter()
                .filter(|id| Some(*id) != except)
                .filter_map(|id| state.connections.get(&id).cloned())
                .collect()
        };
        self.fan_out(frame, targets)
    }

    /// Send an event to every live connection of each listed user.
    pub fn broadcast_to_users<S: AsRef<str>>(&self, user_ids: &[S], kind: &str, data: Value) -> usize {
        let Some(frame) = encode(kind, data) else {
            return 0;
        };
        let targets: Vec<Arc<Connection>> = {
            let state = self.lock();
            let mut seen = HashSet::new();
            user_ids
                .iter()
                .filter_map(|user| state.users.get(user.as_ref()))
                .flatten()
                .filter(|id| seen.insert(**id))
                .filter_map(|id| state.connections.get(id).cloned())
                .collect()
        };
        self.fan_out(frame, targets)
    }

    /// Send an event to every connection in `tenant_id` watching `user_id`'s status.
    pub fn broadcast_to_watchers(
        &self,
        tenant_id: &str,
        user_id: &str,
        kind: &str,
        data: Value,
    ) -> usize {
        let Some(frame) = encode(kind, data) else {
            return 0;
        };
        let targets: Vec<Arc<Connection>> = {
            let state = self.lock();
            state
                .index
                .watchers_of(user_id)
                .into_iter()
                .filter_map(|id| state.connections.get(&id))
                .filter(|conn| conn.tenant_id() == tenant_id)
                .cloned()
                .collect()
        };
        self.fan_out(frame, targets)
    }

    /// Send one envelope to one connection (replies, snapshots).
    pub fn send_envelope(&self, conn: &Arc<Connection>, envelope: &OutboundEnvelope) -> bool {
        match envelope.to_frame() {
            Ok(frame) => self.fan_out(frame, vec![conn.clone()]) == 1,
            Err(e) => {
                tracing::error!(kind = %envelope.kind, error = %e, "Failed to serialize envelope");
                false
            }
        }
    }

    /// Enqueue to each target; a full or closed queue evicts that connection.
    fn fan_out(&self, frame: Message, targets: Vec<Arc<Connection>>) -> usize {
        let mut queued = 0;
        for conn in targets {
            match conn.try_send(frame.clone()) {
                SendOutcome::Queued => queued += 1,
                SendOutcome::Full => {
                    tracing::warn!(
                        user_id = %conn.user_id(),
                        connection_id = %conn.id(),
                        "Outbound queue full, evicting slow consumer"
                    );
                    self.unregister(conn.id());
                }
                SendOutcome::Closed => {
                    self.unregister(conn.id());
                }
            }
        }
        queued
    }

    // --- Dispatch ---

    /// Route one decoded envelope to its handler and reply to the sender.
    /// Handler failures become error replies; they never end the connection.
    pub async fn dispatch(&self, conn: &Arc<Connection>, envelope: InboundEnvelope) {
        let InboundEnvelope {
            kind,
            data,
            request_id,
        } = envelope;
        let request_id = request_id.as_deref();

        let Some(handler) = self.handlers.get(kind.as_str()).cloned() else {
            self.send_envelope(
                conn,
                &OutboundEnvelope::error(Some(kind.as_str()), request_id, &HubError::UnknownType(kind.clone())),
            );
            return;
        };

        let ctx = HandlerContext {
            hub: self,
            conn,
            request_id,
        };
        let result = match handler.validate(&data) {
            Ok(()) => handler.handle(&ctx, data).await,
            Err(e) => Err(e),
        };

        let reply = match result {
            Ok(HandlerOutput::Ack) => OutboundEnvelope::reply(&kind, request_id, None),
            Ok(HandlerOutput::Reply(data)) => OutboundEnvelope::reply(&kind, request_id, Some(data)),
            Ok(HandlerOutput::ReplyAs(reply_kind, data)) => {
                OutboundEnvelope::reply(reply_kind, request_id, Some(data))
            }
            Err(e) => {
                if let HubError::Internal(detail) = &e {
                    tracing::error!(
                        user_id = %conn.user_id(),
                        connection_id = %conn.id(),
                        kind = %kind,
                        error = %detail,
                        "Handler failed"
                    );
                }
                OutboundEnvelope::error(Some(kind.as_str()), request_id, &e)
            }
        };
        self.send_envelope(conn, &reply);
    }
}

fn encode(kind: &str, data: Value) -> Option<Message> {
    match OutboundEnvelope::event(kind, data).to_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(kind = %kind, error = %e, "Failed to serialize event");
            None
        }
    }
}
