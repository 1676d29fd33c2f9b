use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use crate::server::{api_key_auth, AppState};

use super::chats::{delete_chat, upsert_chat};
use super::health::{health, stats};
use super::messages::route_message;
use super::metrics::prometheus_metrics;
use super::presence::{online_users, user_presence};

pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Collaborator endpoints
        .nest(
            "/api/v1",
            Router::new()
                .route("/messages", post(route_message))
                .route("/chats/{chat_id}", put(upsert_chat).delete(delete_chat))
                .route("/presence", get(online_users))
                .route("/presence/{user_id}", get(user_presence))
                .route_layer(middleware::from_fn_with_state(state, api_key_auth)),
        )
}
