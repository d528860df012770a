use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};

use crate::server::{api_key_auth, AppState};

use super::conversations::{conversation_members, forget_conversation, sync_participants};
use super::health::{health, stats};
use super::messages::message_created;
use super::metrics::prometheus_metrics;
use super::presence::{online_users, user_presence};

pub fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Internal endpoints for the CRUD service
        .nest(
            "/api/v1",
            Router::new()
                // Message fan-out
                .route(
                    "/conversations/{conversation_id}/messages",
                    post(message_created),
                )
                // Conversation directory sync
                .route(
                    "/conversations/{conversation_id}/participants",
                    put(sync_participants),
                )
                .route("/conversations/{conversation_id}", delete(forget_conversation))
                .route(
                    "/conversations/{conversation_id}/members",
                    get(conversation_members),
                )
                // Presence
                .route("/presence", get(online_users))
                .route("/presence/{user_id}", get(user_presence))
                .route_layer(middleware::from_fn_with_state(state, api_key_auth)),
        )
}
