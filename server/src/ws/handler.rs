use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::auth::jwt;
use crate::auth::middleware::bearer_token;
use crate::error::ApiError;
use crate::state::AppState;
use crate::ws::connection::run_connection;

/// Browsers cannot set headers on a websocket handshake, so the token may
/// also ride in the query string.
#[derive(Debug, Default, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// GET /ws?token=JWT
/// Authenticates before upgrading; a missing or invalid token gets a plain 401.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers));

    let Some(token) = token else {
        tracing::warn!("WebSocket upgrade without token");
        return ApiError::Unauthorized.into_response();
    };

    let claims = match jwt::validate_access_token(&state.jwt_secret, token) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket auth failed");
            return ApiError::Unauthorized.into_response();
        }
    };

    tracing::info!(
        user_id = %claims.sub,
        tenant_id = %claims.tenant_id,
        "WebSocket connection authenticated"
    );

    // Oversized frames up to this hard cap are read and answered with an
    // error; only beyond it does the transport drop the socket.
    let hard_cap = state.realtime.max_message_bytes.saturating_mul(4);
    ws.max_message_size(hard_cap)
        .max_frame_size(hard_cap)
        .on_upgrade(move |socket| run_connection(socket, state, claims))
}
