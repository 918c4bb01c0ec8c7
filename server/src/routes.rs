use axum::{
    extract::State,
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::middleware::JwtSecret;
use crate::broadcasts::routes as broadcast_routes;
use crate::presence::routes as presence_routes;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    State(state): State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Note: /api/presence/online and /batch MUST come before /api/presence/{user_id}
    let presence = Router::new()
        .route("/api/presence/online", get(presence_routes::get_online_users))
        .route("/api/presence/batch", post(presence_routes::get_batch_presence))
        .route("/api/presence/{user_id}", get(presence_routes::get_presence));

    let broadcasts = Router::new()
        .route("/api/broadcasts", post(broadcast_routes::create_broadcast))
        .route("/api/broadcasts/{id}", get(broadcast_routes::get_broadcast))
        .route(
            "/api/broadcasts/{id}/schedule",
            delete(broadcast_routes::cancel_broadcast),
        );

    // WebSocket endpoint (auth checked inside the handler, before the upgrade)
    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(presence)
        .merge(broadcasts)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness plus a count of open sockets.
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.hub.connection_count(),
    }))
}
