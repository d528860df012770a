//! Message-created webhook, called by the CRUD service after a message is persisted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::dispatcher::FanoutReport;
use crate::domain::ChatMessage;
use crate::error::Result;
use crate::server::AppState;

/// POST /api/v1/conversations/{conversation_id}/messages
#[tracing::instrument(
    name = "api.message_created",
    skip(state, message),
    fields(message_id = %message.id)
)]
pub async fn message_created(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(message): Json<ChatMessage>,
) -> Result<(StatusCode, Json<FanoutReport>)> {
    let report = state
        .dispatcher
        .notify_message_created(&conversation_id, message)
        .await?;

    tracing::info!(
        conversation_id = %conversation_id,
        message_id = %report.message_id,
        delivered = report.delivered,
        notified = report.notified,
        failed = report.failed,
        "Message fanned out"
    );

    Ok((StatusCode::ACCEPTED, Json(report)))
}
