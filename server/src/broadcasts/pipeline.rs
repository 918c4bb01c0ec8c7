use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

use super::repository::BroadcastRepository;
use super::Broadcast;
use crate::error::SchedulerError;
use crate::ws::hub::Hub;
use crate::ws::protocol::types;

/// What a fan-out reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub recipients: usize,
    /// Live connections the event was queued on.
    pub delivered: usize,
}

/// Performs the actual fan-out of a due broadcast.
#[async_trait]
pub trait SendPipeline: Send + Sync {
    async fn send(&self, broadcast: &Broadcast) -> Result<SendReport, SchedulerError>;
}

/// Pushes `broadcast.message` to every live connection of each recipient.
/// Offline recipients rely on the persisted record.
pub struct HubSendPipeline {
    hub: Arc<Hub>,
    repo: Arc<dyn BroadcastRepository>,
}

impl HubSendPipeline {
    pub fn new(hub: Arc<Hub>, repo: Arc<dyn BroadcastRepository>) -> Self {
        Self { hub, repo }
    }
}

#[async_trait]
impl SendPipeline for HubSendPipeline {
    async fn send(&self, broadcast: &Broadcast) -> Result<SendReport, SchedulerError> {
        let recipients = self.repo.recipients(&broadcast.id).await?;
        if recipients.is_empty() {
            return Err(SchedulerError::Pipeline("broadcast has no recipients".to_string()));
        }

        let delivered = self.hub.broadcast_to_users(
            &recipients,
            types::BROADCAST_MESSAGE,
            json!({
                "broadcast_id": broadcast.id,
                "sender_id": broadcast.created_by,
                "content": broadcast.content,
                "sent_at": Utc::now().timestamp(),
            }),
        );

        Ok(SendReport {
            recipients: recipients.len(),
            delivered,
        })
    }
}
