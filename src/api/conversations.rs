//! Conversation directory sync and room inspection.

use std::collections::BTreeSet;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsRequest {
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembersResponse {
    pub conversation_id: String,
    pub connections: usize,
    pub user_ids: Vec<String>,
}

/// PUT /api/v1/conversations/{conversation_id}/participants
pub async fn sync_participants(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(request): Json<ParticipantsRequest>,
) -> Result<StatusCode> {
    if request.participant_ids.iter().any(|id| id.trim().is_empty()) {
        return Err(AppError::Validation(
            "participantIds must not contain empty ids".to_string(),
        ));
    }

    state
        .conversations
        .upsert(conversation_id, request.participant_ids);

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/v1/conversations/{conversation_id}
pub async fn forget_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<StatusCode> {
    if state.conversations.remove(&conversation_id) {
        tracing::info!(conversation_id = %conversation_id, "Conversation removed from directory");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("conversation {}", conversation_id)))
    }
}

/// GET /api/v1/conversations/{conversation_id}/members
pub async fn conversation_members(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Json<MembersResponse> {
    let connections = state.registry.room_connections(&conversation_id);
    let user_ids: BTreeSet<String> = connections
        .iter()
        .filter_map(|conn| conn.user_id().map(str::to_string))
        .collect();

    Json(MembersResponse {
        conversation_id,
        connections: connections.len(),
        user_ids: user_ids.into_iter().collect(),
    })
}
