//! Connection statistics and info structures

use serde::Serialize;
use std::collections::HashMap;

/// Connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub unique_users: usize,
    /// conversation_id -> joined connections
    pub rooms: HashMap<String, usize>,
}

/// A single connection as reported by the admin surface
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub state: &'static str,
    pub connected_at: String,
    pub current_room: Option<String>,
}

/// Presence of one user
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresenceInfo {
    pub user_id: String,
    pub online: bool,
    pub connections: Vec<ConnectionInfo>,
}
