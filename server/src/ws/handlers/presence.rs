use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{decode_payload, HandlerContext, HandlerOutput, MessageHandler};
use crate::error::HubError;
use crate::presence::PresenceService;
use crate::ws::protocol::types;

/// Users one request may watch or unwatch.
const MAX_WATCHED_PER_REQUEST: usize = 100;

#[derive(Debug, Deserialize)]
struct UsersPayload {
    user_ids: Vec<String>,
}

fn validate_users(data: &Value) -> Result<(), HubError> {
    let payload: UsersPayload = decode_payload(data)?;
    if payload.user_ids.is_empty() {
        return Err(HubError::InvalidMessage("user_ids must not be empty".to_string()));
    }
    if payload.user_ids.len() > MAX_WATCHED_PER_REQUEST {
        return Err(HubError::InvalidMessage(format!(
            "at most {} user_ids per request",
            MAX_WATCHED_PER_REQUEST
        )));
    }
    Ok(())
}

/// `user.status.subscribe`: watch users' online status. Replies with a
/// snapshot; later changes arrive as `user.status` events.
pub struct SubscribeStatus {
    presence: PresenceService,
}

impl SubscribeStatus {
    pub fn new(presence: PresenceService) -> Self {
        Self { presence }
    }
}

#[async_trait]
impl MessageHandler for SubscribeStatus {
    fn validate(&self, data: &Value) -> Result<(), HubError> {
        validate_users(data)
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, data: Value) -> Result<HandlerOutput, HubError> {
        let payload: UsersPayload = decode_payload(&data)?;
        for user_id in &payload.user_ids {
            ctx.hub.watch_user(ctx.conn.id(), user_id)?;
        }

        let statuses: Vec<Value> = match self.presence.get_multiple_presence(&payload.user_ids).await {
            Some(all) => all
                .into_iter()
                .map(|p| {
                    json!({
                        "user_id": p.user_id,
                        "status": if p.is_online { "online" } else { "offline" },
                        "last_seen": p.last_seen,
                    })
                })
                .collect(),
            None => payload
                .user_ids
                .iter()
                .map(|id| json!({ "user_id": id, "status": "unknown", "last_seen": null }))
                .collect(),
        };
        Ok(HandlerOutput::Reply(json!({ "statuses": statuses })))
    }
}

/// `user.status.unsubscribe`
pub struct UnsubscribeStatus;

#[async_trait]
impl MessageHandler for UnsubscribeStatus {
    fn validate(&self, data: &Value) -> Result<(), HubError> {
        validate_users(data)
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, data: Value) -> Result<HandlerOutput, HubError> {
        let payload: UsersPayload = decode_payload(&data)?;
        for user_id in &payload.user_ids {
            ctx.hub.unwatch_user(ctx.conn.id(), user_id);
        }
        Ok(HandlerOutput::Ack)
    }
}

/// `ping`: application heartbeat. Refreshes the online key and answers `pong`.
pub struct Ping {
    presence: PresenceService,
}

impl Ping {
    pub fn new(presence: PresenceService) -> Self {
        Self { presence }
    }
}

#[async_trait]
impl MessageHandler for Ping {
    fn validate(&self, _data: &Value) -> Result<(), HubError> {
        Ok(())
    }

    async fn handle(&self, ctx: &HandlerContext<'_>, _data: Value) -> Result<HandlerOutput, HubError> {
        if let Err(e) = self.presence.set_online(ctx.conn.user_id()).await {
            tracing::warn!(user_id = %ctx.conn.user_id(), error = %e, "Failed to refresh presence");
        }
        Ok(HandlerOutput::ReplyAs(
            types::PONG,
            json!({ "timestamp": Utc::now().timestamp_millis() }),
        ))
    }
}
