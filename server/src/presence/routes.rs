use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::error::ApiError;
use crate::presence::Presence;
use crate::state::AppState;

/// Batch lookups above this size are rejected.
const MAX_BATCH_USERS: usize = 500;

#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub user_id: String,
    /// "online", "offline", or "unknown" when the presence store is unreachable
    pub status: String,
    pub last_seen: Option<i64>,
    pub last_active: Option<i64>,
}

impl From<Presence> for PresenceResponse {
    fn from(p: Presence) -> Self {
        Self {
            user_id: p.user_id,
            status: if p.is_online { "online" } else { "offline" }.to_string(),
            last_seen: p.last_seen,
            last_active: p.last_active,
        }
    }
}

impl PresenceResponse {
    fn unknown(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: "unknown".to_string(),
            last_seen: None,
            last_active: None,
        }
    }
}

/// GET /api/presence/{user_id}
pub async fn get_presence(
    State(state): State<AppState>,
    _claims: Claims,
    Path(user_id): Path<String>,
) -> Json<PresenceResponse> {
    let response = match state.presence.get_presence(&user_id).await {
        Some(p) => p.into(),
        None => PresenceResponse::unknown(&user_id),
    };
    Json(response)
}

#[derive(Debug, Deserialize)]
pub struct BatchPresenceRequest {
    pub user_ids: Vec<String>,
}

/// POST /api/presence/batch
/// Body: { "user_ids": ["..."] }
pub async fn get_batch_presence(
    State(state): State<AppState>,
    _claims: Claims,
    Json(body): Json<BatchPresenceRequest>,
) -> Result<Json<Vec<PresenceResponse>>, ApiError> {
    if body.user_ids.len() > MAX_BATCH_USERS {
        return Err(ApiError::BadRequest(format!(
            "At most {} user_ids per request",
            MAX_BATCH_USERS
        )));
    }

    let response = match state.presence.get_multiple_presence(&body.user_ids).await {
        Some(all) => all.into_iter().map(PresenceResponse::from).collect(),
        None => body
            .user_ids
            .iter()
            .map(|id| PresenceResponse::unknown(id))
            .collect(),
    };
    Ok(Json(response))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OnlineUsersResponse {
    pub user_ids: Vec<String>,
    /// False when the store could not be scanned and the list is empty for that reason.
    pub complete: bool,
}

/// GET /api/presence/online
pub async fn get_online_users(
    State(state): State<AppState>,
    _claims: Claims,
) -> Json<OnlineUsersResponse> {
    let response = match state.presence.get_online_users().await {
        Some(user_ids) => OnlineUsersResponse {
            user_ids,
            complete: true,
        },
        None => OnlineUsersResponse {
            user_ids: Vec::new(),
            complete: false,
        },
    };
    Json(response)
}
