//! Message handlers, keyed by envelope type.
//!
//! Adding a message type means adding an entry to the table built by
//! [`default_handlers`]; the read loop never changes.

pub mod conversation;
pub mod message;
pub mod presence;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::chat::ChatStore;
use crate::error::HubError;
use crate::presence::PresenceService;
use crate::ws::connection::Connection;
use crate::ws::hub::Hub;
use crate::ws::protocol::types;

pub type HandlerTable = HashMap<&'static str, Arc<dyn MessageHandler>>;

/// What the hub sends back to the requesting connection on success.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    /// `{type, success: true}` with no data.
    Ack,
    /// Reply under the request's own type.
    Reply(Value),
    /// Reply under a different type (`ping` answers `pong`).
    ReplyAs(&'static str, Value),
}

/// Everything a handler may touch for one inbound message.
pub struct HandlerContext<'a> {
    pub hub: &'a Hub,
    pub conn: &'a Arc<Connection>,
    pub request_id: Option<&'a str>,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Check the payload shape before any side effect.
    fn validate(&self, data: &Value) -> Result<(), HubError>;

    async fn handle(&self, ctx: &HandlerContext<'_>, data: Value) -> Result<HandlerOutput, HubError>;
}

/// Decode a handler payload. A missing `data` field decodes as `{}`.
pub fn decode_payload<T: DeserializeOwned>(data: &Value) -> Result<T, HubError> {
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data.clone()
    };
    serde_json::from_value(data).map_err(|e| HubError::InvalidMessage(e.to_string()))
}

/// Reject empty identifiers that serde would otherwise accept.
pub fn require_non_empty(field: &str, value: &str) -> Result<(), HubError> {
    if value.trim().is_empty() {
        return Err(HubError::InvalidMessage(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// The handler table served on `/ws`.
pub fn default_handlers(chat: Arc<dyn ChatStore>, presence: PresenceService) -> HandlerTable {
    let mut table = HandlerTable::new();
    let mut add = |kind: &'static str, handler: Arc<dyn MessageHandler>| {
        table.insert(kind, handler);
    };

    add(types::MESSAGE_SEND, Arc::new(message::SendMessage::new(chat.clone())));
    add(types::MESSAGE_EDIT, Arc::new(message::EditMessage::new(chat.clone())));
    add(types::MESSAGE_DELETE, Arc::new(message::DeleteMessage::new(chat.clone())));
    add(types::MESSAGE_READ, Arc::new(message::MarkRead::new(chat.clone())));
    add(types::MESSAGE_TYPING, Arc::new(message::Typing));

    add(types::CONVERSATION_JOIN, Arc::new(conversation::Join::new(chat.clone())));
    add(types::CONVERSATION_LEAVE, Arc::new(conversation::Leave));
    add(types::CONVERSATION_CREATE, Arc::new(conversation::Create::new(chat.clone())));
    add(types::CONVERSATION_ACTIVE, Arc::new(conversation::SetActive::new(chat.clone())));
    add(types::CONVERSATION_LIST, Arc::new(conversation::List::new(chat)));

    add(
        types::USER_STATUS_SUBSCRIBE,
        Arc::new(presence::SubscribeStatus::new(presence.clone())),
    );
    add(types::USER_STATUS_UNSUBSCRIBE, Arc::new(presence::UnsubscribeStatus));
    add(types::PING, Arc::new(presence::Ping::new(presence)));

    table
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::extract::ws::Message;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    use super::default_handlers;
    use crate::chat::store::SqliteChatStore;
    use crate::chat::ChatStore;
    use crate::db::init_memory_db;
    use crate::presence::memory::MemoryStore;
    use crate::presence::PresenceService;
    use crate::ws::connection::Connection;
    use crate::ws::hub::Hub;
    use crate::ws::protocol::decode_envelope;

    pub struct Harness {
        pub hub: Hub,
        pub chat: Arc<dyn ChatStore>,
        pub presence: PresenceService,
    }

    impl Harness {
        pub fn new() -> Self {
            let chat: Arc<dyn ChatStore> = Arc::new(SqliteChatStore::new(init_memory_db().unwrap()));
            let presence = PresenceService::new(Arc::new(MemoryStore::new()), Duration::from_secs(300));
            let hub = Hub::new(default_handlers(chat.clone(), presence.clone()));
            Self { hub, chat, presence }
        }

        pub fn connect(&self, user: &str) -> (Arc<Connection>, Receiver<Message>) {
            let (conn, rx) = Connection::new(user, "t1", 64);
            self.hub.register(conn.clone());
            (conn, rx)
        }

        pub async fn send(&self, conn: &Arc<Connection>, raw: &str) {
            self.hub.dispatch(conn, decode_envelope(raw).unwrap()).await;
        }
    }

    pub fn drain(rx: &mut Receiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                out.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        out
    }
}
