use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Broadcast, BroadcastStatus, NewBroadcast};
use crate::auth::middleware::Claims;
use crate::error::ApiError;
use crate::scheduler::CancelOutcome;
use crate::state::AppState;
use crate::ws::handlers::message::MAX_CONTENT_CHARS;

const MAX_RECIPIENTS: usize = 10_000;

#[derive(Debug, Deserialize)]
pub struct CreateBroadcastRequest {
    pub content: String,
    pub recipient_ids: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastResponse {
    #[serde(flatten)]
    pub broadcast: Broadcast,
    pub recipient_count: usize,
}

/// POST /api/broadcasts
/// Persists the broadcast, then queues it for `scheduled_at`.
pub async fn create_broadcast(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<CreateBroadcastRequest>,
) -> Result<(StatusCode, Json<BroadcastResponse>), ApiError> {
    let content = body.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".to_string()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::BadRequest(format!(
            "content exceeds {} characters",
            MAX_CONTENT_CHARS
        )));
    }

    let mut recipients: Vec<String> = body
        .recipient_ids
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    recipients.sort();
    recipients.dedup();
    if recipients.is_empty() {
        return Err(ApiError::BadRequest("recipient_ids must not be empty".to_string()));
    }
    if recipients.len() > MAX_RECIPIENTS {
        return Err(ApiError::BadRequest(format!(
            "At most {} recipients per broadcast",
            MAX_RECIPIENTS
        )));
    }
    let recipient_count = recipients.len();

    let broadcast = state
        .broadcasts
        .create(NewBroadcast {
            tenant_id: claims.tenant_id.clone(),
            created_by: claims.sub.clone(),
            content,
            scheduled_at: body.scheduled_at.timestamp(),
            recipients,
        })
        .await?;

    state
        .scheduler
        .schedule(&broadcast.id, broadcast.scheduled_at)
        .await?;

    tracing::info!(
        broadcast_id = %broadcast.id,
        user_id = %claims.sub,
        scheduled_at = broadcast.scheduled_at,
        recipient_count,
        "Broadcast created"
    );

    Ok((
        StatusCode::CREATED,
        Json(BroadcastResponse {
            broadcast,
            recipient_count,
        }),
    ))
}

/// Broadcasts outside the caller's tenant are reported as missing.
async fn load_for_tenant(state: &AppState, claims: &Claims, id: &str) -> Result<Broadcast, ApiError> {
    let broadcast = state.broadcasts.get(id).await?;
    if broadcast.tenant_id != claims.tenant_id {
        return Err(ApiError::NotFound(format!("Not found: broadcast {}", id)));
    }
    Ok(broadcast)
}

/// GET /api/broadcasts/{id}
pub async fn get_broadcast(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<String>,
) -> Result<Json<BroadcastResponse>, ApiError> {
    let broadcast = load_for_tenant(&state, &claims, &id).await?;
    let recipient_count = state.broadcasts.recipients(&id).await?.len();
    Ok(Json(BroadcastResponse {
        broadcast,
        recipient_count,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: String,
    /// "cancelled" or "not_scheduled"
    pub outcome: String,
    pub status: BroadcastStatus,
}

/// DELETE /api/broadcasts/{id}/schedule
/// Only the creator may cancel. Cancelling a job that already fired is not an error.
pub async fn cancel_broadcast(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let broadcast = load_for_tenant(&state, &claims, &id).await?;
    if broadcast.created_by != claims.sub {
        return Err(ApiError::NotFound(format!("Not found: broadcast {}", id)));
    }

    let outcome = state.scheduler.cancel(&id).await?;
    // The record moves only if no worker got there first
    state.broadcasts.mark_cancelled(&id).await?;
    let status = state
        .broadcasts
        .status(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Not found: broadcast {}", id)))?;

    let outcome = match outcome {
        CancelOutcome::Cancelled => "cancelled",
        CancelOutcome::NotScheduled => "not_scheduled",
    };
    tracing::info!(broadcast_id = %id, outcome, status = status.as_str(), "Broadcast cancel requested");

    Ok(Json(CancelResponse {
        id,
        outcome: outcome.to_string(),
        status,
    }))
}
