use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{decode_payload, require_non_empty, HandlerContext, HandlerOutput, MessageHandler};
use crate::chat::{ChatStore, ConversationKind, NewConversation};
use crate::error::HubError;
use crate::ws::protocol::types;

/// Members a group or business conversation may be created with.
const MAX_MEMBERS: usize = 256;

#[derive(Debug, Deserialize)]
struct ConversationRef {
    conversation_id: String,
}

async fn ensure_member(
    chat: &dyn ChatStore,
    conversation_id: &str,
    user_id: &str,
) -> Result<(), HubError> {
    if chat.is_member(conversation_id, user_id).await? {
        Ok(())
    } else {
        Err(HubError::Forbidden(format!(
            "not a member of conversation {}",
            conversation_id
        )))
    }
}

/// `conversation.join`: start receiving a conversation's events.
pub struct Join {
    chat: Arc<dyn ChatStore>,
}

impl Join {
    pub fn new(chat: Arc<dyn ChatStore>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl MessageHandler for Join {
    fn validate(&self, data: &Value) -> Result<(), HubError> {
        let payload: ConversationRef = decode_payload(data)?;
        require_non_empty("conversation_id", &payload.conversation_id)
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, data: Value) -> Result<HandlerOutput, HubError> {
        let payload: ConversationRef = decode_payload(&data)?;
        ensure_member(self.chat.as_ref(), &payload.conversation_id, ctx.conn.user_id()).await?;

        let newly = ctx
            .hub
            .subscribe_conversation(ctx.conn.id(), &payload.conversation_id)?;
        if newly {
            tracing::debug!(
                user_id = %ctx.conn.user_id(),
                connection_id = %ctx.conn.id(),
                conversation_id = %payload.conversation_id,
                "Joined conversation"
            );
        }
        Ok(HandlerOutput::Reply(json!({
            "conversation_id": payload.conversation_id,
        })))
    }
}

/// `conversation.leave`: stop receiving a conversation's events.
pub struct Leave;

#[async_trait]
impl MessageHandler for Leave {
    fn validate(&self, data: &Value) -> Result<(), HubError> {
        let payload: ConversationRef = decode_payload(data)?;
        require_non_empty("conversation_id", &payload.conversation_id)
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, data: Value) -> Result<HandlerOutput, HubError> {
        let payload: ConversationRef = decode_payload(&data)?;
        ctx.hub
            .unsubscribe_conversation(ctx.conn.id(), &payload.conversation_id);
        if ctx.hub.active_conversation(ctx.conn.id()).as_deref() == Some(payload.conversation_id.as_str()) {
            ctx.hub.set_active_conversation(ctx.conn.id(), None);
        }
        Ok(HandlerOutput::Reply(json!({
            "conversation_id": payload.conversation_id,
        })))
    }
}

#[derive(Debug, Deserialize)]
struct CreatePayload {
    kind: ConversationKind,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    member_ids: Vec<String>,
}

impl CreatePayload {
    /// Members other than the creator, deduplicated and sorted.
    fn others(&self, creator: &str) -> BTreeSet<String> {
        self.member_ids
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty() && *m != creator)
            .map(str::to_string)
            .collect()
    }
}

/// `conversation.create`: create a conversation and tell every member.
///
/// A direct conversation that already exists between the two users is
/// returned instead of creating a duplicate.
pub struct Create {
    chat: Arc<dyn ChatStore>,
}

impl Create {
    pub fn new(chat: Arc<dyn ChatStore>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl MessageHandler for Create {
    fn validate(&self, data: &Value) -> Result<(), HubError> {
        let payload: CreatePayload = decode_payload(data)?;
        if payload.member_ids.len() > MAX_MEMBERS {
            return Err(HubError::InvalidMessage(format!(
                "at most {} members",
                MAX_MEMBERS
            )));
        }
        match payload.kind {
            ConversationKind::Direct if payload.member_ids.iter().filter(|m| !m.trim().is_empty()).count() != 1 => {
                Err(HubError::InvalidMessage(
                    "direct conversations take exactly one other member".to_string(),
                ))
            }
            ConversationKind::Group if payload.member_ids.is_empty() => Err(HubError::InvalidMessage(
                "group conversations need at least one other member".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, data: Value) -> Result<HandlerOutput, HubError> {
        let payload: CreatePayload = decode_payload(&data)?;
        let creator = ctx.conn.user_id();
        let others = payload.others(creator);
        if others.is_empty() && payload.kind != ConversationKind::Business {
            return Err(HubError::InvalidMessage(
                "cannot create a conversation with only yourself".to_string(),
            ));
        }

        if payload.kind == ConversationKind::Direct {
            if let Some(other) = others.iter().next() {
                if let Some(existing) = self
                    .chat
                    .find_direct_conversation(ctx.conn.tenant_id(), creator, other)
                    .await?
                {
                    ctx.hub.subscribe_conversation(ctx.conn.id(), &existing.id)?;
                    return Ok(HandlerOutput::Reply(json!({
                        "conversation": existing,
                        "created": false,
                    })));
                }
            }
        }

        let mut members = vec![creator.to_string()];
        members.extend(others);
        let conversation = self
            .chat
            .create_conversation(NewConversation {
                tenant_id: ctx.conn.tenant_id().to_string(),
                kind: payload.kind,
                title: payload.title.filter(|t| !t.trim().is_empty()),
                created_by: creator.to_string(),
                members,
            })
            .await?;

        ctx.hub.subscribe_conversation(ctx.conn.id(), &conversation.id)?;
        let event = serde_json::to_value(&conversation)
            .map_err(|e| HubError::Internal(e.to_string()))?;
        ctx.hub
            .broadcast_to_users(&conversation.members, types::CONVERSATION_CREATED, event);

        tracing::info!(
            user_id = %creator,
            conversation_id = %conversation.id,
            kind = conversation.kind.as_str(),
            "Conversation created"
        );

        Ok(HandlerOutput::Reply(json!({
            "conversation": conversation,
            "created": true,
        })))
    }
}

#[derive(Debug, Deserialize)]
struct ActivePayload {
    /// `null` clears the active conversation.
    #[serde(default)]
    conversation_id: Option<String>,
}

/// `conversation.active`: record which conversation this connection is viewing
/// and tell the other participants.
pub struct SetActive {
    chat: Arc<dyn ChatStore>,
}

impl SetActive {
    pub fn new(chat: Arc<dyn ChatStore>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl MessageHandler for SetActive {
    fn validate(&self, data: &Value) -> Result<(), HubError> {
        let payload: ActivePayload = decode_payload(data)?;
        match payload.conversation_id {
            Some(id) => require_non_empty("conversation_id", &id),
            None => Ok(()),
        }
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, data: Value) -> Result<HandlerOutput, HubError> {
        let payload: ActivePayload = decode_payload(&data)?;
        let user_id = ctx.conn.user_id();
        if let Some(conversation_id) = &payload.conversation_id {
            ensure_member(self.chat.as_ref(), conversation_id, user_id).await?;
        }

        let previous = ctx
            .hub
            .set_active_conversation(ctx.conn.id(), payload.conversation_id.as_deref());
        if previous == payload.conversation_id {
            return Ok(HandlerOutput::Ack);
        }

        if let Some(previous) = previous {
            ctx.hub.broadcast_to_conversation_except(
                &previous,
                types::USER_ACTIVE,
                json!({ "conversation_id": previous, "user_id": user_id, "active": false }),
                ctx.conn.id(),
            );
        }
        if let Some(current) = &payload.conversation_id {
            ctx.hub.broadcast_to_conversation_except(
                current,
                types::USER_ACTIVE,
                json!({ "conversation_id": current, "user_id": user_id, "active": true }),
                ctx.conn.id(),
            );
        }
        Ok(HandlerOutput::Ack)
    }
}

/// `conversation.list`: the caller's conversations, most recent first.
pub struct List {
    chat: Arc<dyn ChatStore>,
}

impl List {
    pub fn new(chat: Arc<dyn ChatStore>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl MessageHandler for List {
    fn validate(&self, _data: &Value) -> Result<(), HubError> {
        Ok(())
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, _data: Value) -> Result<HandlerOutput, HubError> {
        let conversations = self
            .chat
            .list_conversations(ctx.conn.tenant_id(), ctx.conn.user_id())
            .await?;
        Ok(HandlerOutput::Reply(json!({ "conversations": conversations })))
    }
}
