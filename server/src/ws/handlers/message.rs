use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{decode_payload, require_non_empty, HandlerContext, HandlerOutput, MessageHandler};
use crate::chat::{ChatMessage, ChatStore};
use crate::error::HubError;
use crate::ws::protocol::types;

/// Longest message body accepted, in characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

/// Characters of the body carried in a notification.
const PREVIEW_CHARS: usize = 100;

fn check_content(content: &str) -> Result<(), HubError> {
    if content.trim().is_empty() {
        return Err(HubError::InvalidMessage("content must not be empty".to_string()));
    }
    let chars = content.chars().count();
    if chars > MAX_CONTENT_CHARS {
        return Err(HubError::InvalidMessage(format!(
            "content is {} characters (max {})",
            chars, MAX_CONTENT_CHARS
        )));
    }
    Ok(())
}

fn to_event(message: &ChatMessage) -> Result<Value, HubError> {
    serde_json::to_value(message).map_err(|e| HubError::Internal(e.to_string()))
}

/// Load a message and check the caller sent it.
async fn owned_message(
    chat: &dyn ChatStore,
    message_id: &str,
    user_id: &str,
) -> Result<ChatMessage, HubError> {
    let message = chat.get_message(message_id).await?;
    if message.sender_id != user_id {
        return Err(HubError::Forbidden("only the sender may change a message".to_string()));
    }
    Ok(message)
}

#[derive(Debug, Deserialize)]
struct SendPayload {
    conversation_id: String,
    content: String,
    /// Client-generated id echoed back so the sender can match its optimistic copy.
    #[serde(default)]
    client_id: Option<String>,
}

/// `message.send`: persist, push `message.receive` to the conversation and
/// `notification.message` to members not looking at it.
pub struct SendMessage {
    chat: Arc<dyn ChatStore>,
}

impl SendMessage {
    pub fn new(chat: Arc<dyn ChatStore>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl MessageHandler for SendMessage {
    fn validate(&self, data: &Value) -> Result<(), HubError> {
        let payload: SendPayload = decode_payload(data)?;
        require_non_empty("conversation_id", &payload.conversation_id)?;
        check_content(&payload.content)
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, data: Value) -> Result<HandlerOutput, HubError> {
        let payload: SendPayload = decode_payload(&data)?;
        let sender = ctx.conn.user_id();

        let members = self.chat.conversation_members(&payload.conversation_id).await?;
        if !members.iter().any(|m| m == sender) {
            return Err(HubError::Forbidden(format!(
                "not a member of conversation {}",
                payload.conversation_id
            )));
        }

        let message = self
            .chat
            .insert_message(&payload.conversation_id, sender, &payload.content)
            .await?;

        let mut event = to_event(&message)?;
        if let Some(client_id) = &payload.client_id {
            event["client_id"] = json!(client_id);
        }
        ctx.hub
            .broadcast_to_conversation(&message.conversation_id, types::MESSAGE_RECEIVE, event.clone());

        let viewing = ctx.hub.users_viewing(&message.conversation_id);
        let notify: Vec<&String> = members
            .iter()
            .filter(|m| m.as_str() != sender && !viewing.contains(m.as_str()))
            .collect();
        if !notify.is_empty() {
            ctx.hub.broadcast_to_users(
                &notify,
                types::NOTIFICATION_MESSAGE,
                json!({
                    "conversation_id": message.conversation_id,
                    "message_id": message.id,
                    "sender_id": message.sender_id,
                    "preview": message.content.chars().take(PREVIEW_CHARS).collect::<String>(),
                    "created_at": message.created_at,
                }),
            );
        }

        Ok(HandlerOutput::Reply(event))
    }
}

#[derive(Debug, Deserialize)]
struct EditPayload {
    message_id: String,
    content: String,
}

/// `message.edit`: sender-only; pushes `message.updated`.
pub struct EditMessage {
    chat: Arc<dyn ChatStore>,
}

impl EditMessage {
    pub fn new(chat: Arc<dyn ChatStore>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl MessageHandler for EditMessage {
    fn validate(&self, data: &Value) -> Result<(), HubError> {
        let payload: EditPayload = decode_payload(data)?;
        require_non_empty("message_id", &payload.message_id)?;
        check_content(&payload.content)
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, data: Value) -> Result<HandlerOutput, HubError> {
        let payload: EditPayload = decode_payload(&data)?;
        owned_message(self.chat.as_ref(), &payload.message_id, ctx.conn.user_id()).await?;

        let updated = self
            .chat
            .edit_message(&payload.message_id, &payload.content)
            .await?;
        let event = to_event(&updated)?;
        ctx.hub
            .broadcast_to_conversation(&updated.conversation_id, types::MESSAGE_UPDATED, event.clone());
        Ok(HandlerOutput::Reply(event))
    }
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    message_id: String,
}

/// `message.delete`: sender-only soft delete; pushes `message.deleted`.
pub struct DeleteMessage {
    chat: Arc<dyn ChatStore>,
}

impl DeleteMessage {
    pub fn new(chat: Arc<dyn ChatStore>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl MessageHandler for DeleteMessage {
    fn validate(&self, data: &Value) -> Result<(), HubError> {
        let payload: MessageRef = decode_payload(data)?;
        require_non_empty("message_id", &payload.message_id)
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, data: Value) -> Result<HandlerOutput, HubError> {
        let payload: MessageRef = decode_payload(&data)?;
        owned_message(self.chat.as_ref(), &payload.message_id, ctx.conn.user_id()).await?;

        let deleted = self.chat.delete_message(&payload.message_id).await?;
        let event = json!({
            "message_id": deleted.id,
            "conversation_id": deleted.conversation_id,
        });
        ctx.hub
            .broadcast_to_conversation(&deleted.conversation_id, types::MESSAGE_DELETED, event.clone());
        Ok(HandlerOutput::Reply(event))
    }
}

#[derive(Debug, Deserialize)]
struct ReadPayload {
    conversation_id: String,
    message_id: String,
}

/// `message.read`: store the read marker; pushes `message.read` to the others.
pub struct MarkRead {
    chat: Arc<dyn ChatStore>,
}

impl MarkRead {
    pub fn new(chat: Arc<dyn ChatStore>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl MessageHandler for MarkRead {
    fn validate(&self, data: &Value) -> Result<(), HubError> {
        let payload: ReadPayload = decode_payload(data)?;
        require_non_empty("conversation_id", &payload.conversation_id)?;
        require_non_empty("message_id", &payload.message_id)
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, data: Value) -> Result<HandlerOutput, HubError> {
        let payload: ReadPayload = decode_payload(&data)?;
        let user_id = ctx.conn.user_id();
        if !self.chat.is_member(&payload.conversation_id, user_id).await? {
            return Err(HubError::Forbidden(format!(
                "not a member of conversation {}",
                payload.conversation_id
            )));
        }

        self.chat
            .mark_read(&payload.conversation_id, user_id, &payload.message_id)
            .await?;
        ctx.hub.broadcast_to_conversation_except(
            &payload.conversation_id,
            types::MESSAGE_READ,
            json!({
                "conversation_id": payload.conversation_id,
                "message_id": payload.message_id,
                "user_id": user_id,
            }),
            ctx.conn.id(),
        );
        Ok(HandlerOutput::Ack)
    }
}

#[derive(Debug, Deserialize)]
struct TypingPayload {
    conversation_id: String,
    #[serde(default = "default_true")]
    is_typing: bool,
}

fn default_true() -> bool {
    true
}

/// `message.typing`: relayed as `user.typing` to the conversation's other
/// subscribers. Only a connection that joined the conversation may send it.
pub struct Typing;

#[async_trait]
impl MessageHandler for Typing {
    fn validate(&self, data: &Value) -> Result<(), HubError> {
        let payload: TypingPayload = decode_payload(data)?;
        require_non_empty("conversation_id", &payload.conversation_id)
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, data: Value) -> Result<HandlerOutput, HubError> {
        let payload: TypingPayload = decode_payload(&data)?;
        if !ctx.hub.is_subscribed(ctx.conn.id(), &payload.conversation_id) {
            return Err(HubError::Forbidden(format!(
                "join conversation {} first",
                payload.conversation_id
            )));
        }
        ctx.hub.broadcast_to_conversation_except(
            &payload.conversation_id,
            types::USER_TYPING,
            json!({
                "conversation_id": payload.conversation_id,
                "user_id": ctx.conn.user_id(),
                "is_typing": payload.is_typing,
            }),
            ctx.conn.id(),
        );
        Ok(HandlerOutput::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ConversationKind, NewConversation};
    use crate::ws::handlers::test_support::{drain, Harness};

    async fn seed(h: &Harness, members: &[&str]) -> String {
        h.chat
            .create_conversation(NewConversation {
                tenant_id: "t1".into(),
                kind: ConversationKind::Group,
                title: None,
                created_by: members[0].to_string(),
                members: members.iter().map(|m| m.to_string()).collect(),
            })
            .await
            .unwrap()
            .id
    }

    fn send_frame(conv: &str, content: &str) -> String {
        json!({
            "type": "message.send",
            "data": { "conversation_id": conv, "content": content },
            "request_id": "s1",
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_send_reaches_subscribers_only() {
        let h = Harness::new();
        let conv = seed(&h, &["alice", "bob", "dave"]).await;
        let (alice, mut rx_a) = h.connect("alice");
        let (bob, mut rx_b) = h.connect("bob");
        let (_dave, mut rx_d) = h.connect("dave");
        h.hub.subscribe_conversation(alice.id(), &conv).unwrap();
        h.hub.subscribe_conversation(bob.id(), &conv).unwrap();

        h.send(&alice, &send_frame(&conv, "hello")).await;

        let b_frames = drain(&mut rx_b);
        let received = b_frames.iter().find(|f| f["type"] == "message.receive").unwrap();
        assert_eq!(received["data"]["conversation_id"], conv.as_str());
        assert_eq!(received["data"]["content"], "hello");

        // dave is a member but never joined: notification only
        let d_frames = drain(&mut rx_d);
        assert!(d_frames.iter().all(|f| f["type"] != "message.receive"));
        assert!(d_frames.iter().any(|f| f["type"] == "notification.message"));

        let a_frames = drain(&mut rx_a);
        assert!(a_frames.iter().any(|f| f["request_id"] == "s1" && f["success"] == true));
        assert!(a_frames.iter().all(|f| f["type"] != "notification.message"));
    }

    #[tokio::test]
    async fn test_no_notification_for_viewers() {
        let h = Harness::new();
        let conv = seed(&h, &["alice", "bob"]).await;
        let (alice, _rx_a) = h.connect("alice");
        let (bob, mut rx_b) = h.connect("bob");
        h.hub.subscribe_conversation(bob.id(), &conv).unwrap();
        h.hub.set_active_conversation(bob.id(), Some(&conv));

        h.send(&alice, &send_frame(&conv, "hi")).await;
        let b_frames = drain(&mut rx_b);
        assert_eq!(b_frames.len(), 1);
        assert_eq!(b_frames[0]["type"], "message.receive");
    }

    #[tokio::test]
    async fn test_send_rejects_non_member_and_oversize() {
        let h = Harness::new();
        let conv = seed(&h, &["alice", "bob"]).await;
        let (mallory, mut rx) = h.connect("mallory");

        h.send(&mallory, &send_frame(&conv, "hi")).await;
        h.send(&mallory, &send_frame(&conv, &"x".repeat(MAX_CONTENT_CHARS + 1)))
            .await;
        let replies = drain(&mut rx);
        assert_eq!(replies[0]["code"], "forbidden");
        assert_eq!(replies[1]["code"], "invalid_message");
    }

    #[tokio::test]
    async fn test_edit_and_delete_are_sender_only() {
        let h = Harness::new();
        let conv = seed(&h, &["alice", "bob"]).await;
        let (alice, mut rx_a) = h.connect("alice");
        let (bob, mut rx_b) = h.connect("bob");
        h.hub.subscribe_conversation(bob.id(), &conv).unwrap();
        let msg = h.chat.insert_message(&conv, "alice", "first").await.unwrap();

        let edit = json!({"type": "message.edit", "data": {"message_id": msg.id, "content": "second"}});
        h.send(&bob, &edit.to_string()).await;
        assert_eq!(drain(&mut rx_b)[0]["code"], "forbidden");

        h.send(&alice, &edit.to_string()).await;
        let updated = drain(&mut rx_b);
        assert_eq!(updated[0]["type"], "message.updated");
        assert_eq!(updated[0]["data"]["content"], "second");

        let delete = json!({"type": "message.delete", "data": {"message_id": msg.id}});
        h.send(&alice, &delete.to_string()).await;
        assert_eq!(drain(&mut rx_b)[0]["type"], "message.deleted");
        assert!(drain(&mut rx_a).iter().all(|f| f["success"] == true));
    }

    #[tokio::test]
    async fn test_typing_requires_join_and_skips_sender() {
        let h = Harness::new();
        let conv = seed(&h, &["alice", "bob"]).await;
        let (alice, mut rx_a) = h.connect("alice");
        let (bob, mut rx_b) = h.connect("bob");
        h.hub.subscribe_conversation(bob.id(), &conv).unwrap();

        let typing = json!({"type": "message.typing", "data": {"conversation_id": conv}}).to_string();
        h.send(&alice, &typing).await;
        assert_eq!(drain(&mut rx_a)[0]["code"], "forbidden");
        assert!(drain(&mut rx_b).is_empty());

        h.hub.subscribe_conversation(alice.id(), &conv).unwrap();
        h.send(&alice, &typing).await;
        let b_frames = drain(&mut rx_b);
        assert_eq!(b_frames[0]["type"], "user.typing");
        assert_eq!(b_frames[0]["data"]["user_id"], "alice");
        let a_frames = drain(&mut rx_a);
        assert_eq!(a_frames.len(), 1);
        assert_eq!(a_frames[0]["type"], "message.typing");
    }

    #[tokio::test]
    async fn test_read_marker_broadcast() {
        let h = Harness::new();
        let conv = seed(&h, &["alice", "bob"]).await;
        let (alice, _rx_a) = h.connect("alice");
        let (bob, mut rx_b) = h.connect("bob");
        h.hub.subscribe_conversation(alice.id(), &conv).unwrap();
        h.hub.subscribe_conversation(bob.id(), &conv).unwrap();
        let msg = h.chat.insert_message(&conv, "bob", "hi").await.unwrap();

        let read = json!({"type": "message.read", "data": {"conversation_id": conv, "message_id": msg.id}});
        h.send(&alice, &read.to_string()).await;
        let b_frames = drain(&mut rx_b);
        assert_eq!(b_frames[0]["type"], "message.read");
        assert_eq!(b_frames[0]["data"]["user_id"], "alice");
    }
}
