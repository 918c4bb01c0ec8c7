//! Scheduled broadcasts: one message fanned out to many recipients at a
//! chosen time. Delivery timing lives in [`crate::scheduler`]; this module
//! holds the record, its repository and the send pipeline.

pub mod pipeline;
pub mod repository;
pub mod routes;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastStatus {
    Scheduled,
    /// Claimed by a worker; the fan-out is running or was interrupted.
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl BroadcastStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: String,
    pub tenant_id: String,
    pub created_by: String,
    pub content: String,
    pub status: BroadcastStatus,
    /// Fire time, unix seconds
    pub scheduled_at: i64,
    pub sent_at: Option<i64>,
    pub failure_reason: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewBroadcast {
    pub tenant_id: String,
    pub created_by: String,
    pub content: String,
    pub scheduled_at: i64,
    pub recipients: Vec<String>,
}
