//! JSON wire protocol for the realtime channel.
//!
//! Inbound frames are `{ "type", "data", "request_id"? }`. Everything the server
//! writes is an [`OutboundEnvelope`]: replies echo the request id and carry
//! `success`/`error`, pushed events carry only `type`, `data` and `timestamp`.

use axum::extract::ws::{Message, Utf8Bytes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;

/// Message type tags understood by the default handler table, plus the event
/// types the server pushes.
pub mod types {
    pub const MESSAGE_SEND: &str = "message.send";
    pub const MESSAGE_EDIT: &str = "message.edit";
    pub const MESSAGE_DELETE: &str = "message.delete";
    pub const MESSAGE_READ: &str = "message.read";
    pub const MESSAGE_TYPING: &str = "message.typing";

    pub const CONVERSATION_JOIN: &str = "conversation.join";
    pub const CONVERSATION_LEAVE: &str = "conversation.leave";
    pub const CONVERSATION_CREATE: &str = "conversation.create";
    pub const CONVERSATION_ACTIVE: &str = "conversation.active";
    pub const CONVERSATION_LIST: &str = "conversation.list";

    pub const USER_STATUS_SUBSCRIBE: &str = "user.status.subscribe";
    pub const USER_STATUS_UNSUBSCRIBE: &str = "user.status.unsubscribe";

    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";

    // Server-pushed events
    pub const MESSAGE_RECEIVE: &str = "message.receive";
    pub const MESSAGE_UPDATED: &str = "message.updated";
    pub const MESSAGE_DELETED: &str = "message.deleted";
    pub const USER_TYPING: &str = "user.typing";
    pub const USER_ACTIVE: &str = "user.active";
    pub const USER_STATUS: &str = "user.status";
    pub const CONVERSATION_CREATED: &str = "conversation.created";
    pub const NOTIFICATION_MESSAGE: &str = "notification.message";
    pub const BROADCAST_MESSAGE: &str = "broadcast.message";
    pub const ERROR: &str = "error";
}

/// Heartbeats bypass the rate limiter and refresh the read deadline.
pub fn is_heartbeat(kind: &str) -> bool {
    kind == types::PING
}

/// A decoded client frame.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Decode a text frame into an envelope.
pub fn decode_envelope(text: &str) -> Result<InboundEnvelope, HubError> {
    let envelope: InboundEnvelope = serde_json::from_str(text)
        .map_err(|e| HubError::InvalidMessage(format!("malformed envelope: {}", e)))?;
    if envelope.kind.trim().is_empty() {
        return Err(HubError::InvalidMessage("missing message type".to_string()));
    }
    Ok(envelope)
}

/// Every frame the server sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OutboundEnvelope {
    /// A server-pushed event.
    pub fn event(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data: Some(data),
            request_id: None,
            success: true,
            error: None,
            code: None,
            timestamp: Utc::now(),
        }
    }

    /// A successful reply to a client request.
    pub fn reply(kind: &str, request_id: Option<&str>, data: Option<Value>) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            request_id: request_id.map(str::to_string),
            success: true,
            error: None,
            code: None,
            timestamp: Utc::now(),
        }
    }

    /// An error reply. `kind` is the request type when known.
    pub fn error(kind: Option<&str>, request_id: Option<&str>, err: &HubError) -> Self {
        Self {
            kind: kind.unwrap_or(types::ERROR).to_string(),
            data: None,
            request_id: request_id.map(str::to_string),
            success: false,
            error: Some(err.to_string()),
            code: Some(err.code().to_string()),
            timestamp: Utc::now(),
        }
    }

    /// Serialize into a websocket text frame. Frames share their buffer on clone,
    /// so one serialization serves every recipient.
    pub fn to_frame(&self) -> Result<Message, serde_json::Error> {
        let text = serde_json::to_string(self)?;
        Ok(Message::Text(Utf8Bytes::from(text)))
    }
}
