//! Presence queries.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::connection_manager::{ConnectionInfo, UserPresenceInfo};
use crate::server::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUsersResponse {
    pub user_ids: Vec<String>,
    pub count: usize,
}

/// GET /api/v1/presence
pub async fn online_users(State(state): State<AppState>) -> Json<OnlineUsersResponse> {
    let mut user_ids: Vec<String> = state.registry.online_user_ids().into_iter().collect();
    user_ids.sort();

    Json(OnlineUsersResponse {
        count: user_ids.len(),
        user_ids,
    })
}

/// GET /api/v1/presence/{user_id}
pub async fn user_presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<UserPresenceInfo> {
    let rooms = state.registry.rooms();
    let mut connections: Vec<ConnectionInfo> = state
        .registry
        .user_connections(&user_id)
        .iter()
        .map(|conn| ConnectionInfo {
            connection_id: conn.id.to_string(),
            state: conn.state().as_str(),
            connected_at: conn.connected_at.to_rfc3339(),
            current_room: rooms.current_room_of(conn.id),
        })
        .collect();
    connections.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));

    Json(UserPresenceInfo {
        online: state.registry.presence().is_online(&user_id),
        user_id,
        connections,
    })
}
