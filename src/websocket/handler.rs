use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::Response,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::connection_manager::ConnectionHandle;
use crate::metrics::WsMessageMetrics;
use crate::server::AppState;
use crate::supervisor::CloseReason;

use super::message::{ClientMessage, ServerMessage};

/// How long queued events may take to flush once a connection is closing
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// The token may come from the query string or an `Authorization: Bearer`
/// header. Without either, the client must send an `authenticate` frame
/// before the handshake deadline.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let token = extract_token(&query, &headers);

    tracing::debug!(has_token = token.is_some(), "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

/// Extract token from query parameter or Authorization header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    // First try query parameter
    if let Some(ref token) = query.token {
        if !token.is_empty() {
            return Some(token.clone());
        }
    }

    // Then try Authorization header
    if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }

    None
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState, token: Option<String>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (handle, mut rx) = match state.supervisor.accept() {
        Ok(accepted) => accepted,
        Err(e) => {
            tracing::warn!(error = %e, "Connection rejected");
            if let Ok(json) = serde_json::to_string(&ServerMessage::from(&e)) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };
    let connection_id = handle.id;

    // Weak so the task does not keep its own queue alive
    let weak_handle: Weak<ConnectionHandle> = Arc::downgrade(&handle);

    // Task for sending messages from the queue to the WebSocket.
    // Ends once every sender is gone, which happens after the connection
    // has been unregistered and this function drops its handle.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            // Pre-serialized messages avoid the serialization cost here
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize message");
                    continue;
                }
            };

            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                if let Some(handle) = weak_handle.upgrade() {
                    handle.request_close();
                }
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    tracing::info!(connection_id = %connection_id, "WebSocket connection established");

    let reason = run_connection(&state, &handle, &mut ws_receiver, token).await;

    state.supervisor.close(connection_id, reason);
    drop(handle);

    if tokio::time::timeout(SEND_DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        tracing::debug!(connection_id = %connection_id, "Send task did not drain in time");
        send_task.abort();
    }

    tracing::debug!(connection_id = %connection_id, reason = %reason, "WebSocket task finished");
}

/// Drive one connection until it should close, returning why
#[tracing::instrument(
    name = "ws.connection",
    skip(state, handle, receiver, token),
    fields(connection_id = %handle.id)
)]
async fn run_connection(
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    receiver: &mut SplitStream<WebSocket>,
    token: Option<String>,
) -> CloseReason {
    if let Err(reason) = handshake(state, handle, receiver, token).await {
        return reason;
    }

    loop {
        tokio::select! {
            _ = handle.closed() => {
                // Queue overflow, eviction or shutdown; already-closed is a no-op later
                return CloseReason::SendQueueOverflow;
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(msg)) => {
                        if let Some(reason) = process_message(msg, state, handle).await {
                            return reason;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket receive error");
                        return CloseReason::TransportFailure;
                    }
                    None => return CloseReason::ClientClosed,
                }
            }
        }
    }
}

/// Authenticate with the upgrade token, or wait for an `authenticate` frame
async fn handshake(
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    receiver: &mut SplitStream<WebSocket>,
    token: Option<String>,
) -> Result<(), CloseReason> {
    if let Some(token) = token {
        return authenticate(state, handle, &token).await;
    }

    let deadline = tokio::time::Instant::now() + state.supervisor.config().auth_timeout;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(connection_id = %handle.id, "No authenticate frame before deadline");
                let _ = handle.send(ServerMessage::error("TIMEOUT", "Authentication timed out"));
                return Err(CloseReason::AuthTimeout);
            }
            _ = handle.closed() => {
                return Err(CloseReason::AuthTimeout);
            }
            frame = receiver.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(_))) => {
                        let _ = handle.send(ServerMessage::error(
                            "UNSUPPORTED_FORMAT",
                            "Binary messages are not supported",
                        ));
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(CloseReason::ClientClosed),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket receive error during handshake");
                        return Err(CloseReason::TransportFailure);
                    }
                };

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Authenticate { token }) => {
                        WsMessageMetrics::record("authenticate");
                        return authenticate(state, handle, &token).await;
                    }
                    Ok(other) => {
                        WsMessageMetrics::record(other.kind());
                        let _ = handle.send(ServerMessage::error(
                            "UNAUTHENTICATED",
                            "Authenticate before sending other messages",
                        ));
                    }
                    Err(e) => {
                        WsMessageMetrics::record_invalid();
                        let _ = handle.send(ServerMessage::error("INVALID_MESSAGE", e.to_string()));
                    }
                }
            }
        }
    }
}

async fn authenticate(
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
    token: &str,
) -> Result<(), CloseReason> {
    state
        .supervisor
        .authenticate(handle.id, token)
        .await
        .map(|_| ())
        .map_err(|e| CloseReason::for_handshake_error(&e))
}

/// Process a received WebSocket message.
/// Returns a close reason if the connection should be closed.
async fn process_message(
    msg: Message,
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
) -> Option<CloseReason> {
    match msg {
        Message::Text(text) => {
            state.supervisor.touch(handle.id);

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse client message");
                    WsMessageMetrics::record_invalid();
                    let _ = handle.send(ServerMessage::error("INVALID_MESSAGE", e.to_string()));
                    return None;
                }
            };

            handle_client_message(client_msg, state, handle).await
        }
        Message::Binary(_) => {
            // Binary messages not supported
            let _ = handle.send(ServerMessage::error(
                "UNSUPPORTED_FORMAT",
                "Binary messages are not supported",
            ));
            None
        }
        Message::Ping(_) | Message::Pong(_) => {
            // Axum answers pings itself; both still count as liveness
            state.supervisor.touch(handle.id);
            None
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            Some(CloseReason::ClientClosed)
        }
    }
}

/// Handle a parsed client message
#[tracing::instrument(
    name = "ws.message",
    skip(state, handle),
    fields(
        connection_id = %handle.id,
        user_id = ?handle.user_id(),
        message_type = msg.kind()
    )
)]
async fn handle_client_message(
    msg: ClientMessage,
    state: &AppState,
    handle: &Arc<ConnectionHandle>,
) -> Option<CloseReason> {
    WsMessageMetrics::record(msg.kind());

    let result = match msg {
        ClientMessage::Authenticate { .. } => {
            let _ = handle.send(ServerMessage::error(
                "ALREADY_AUTHENTICATED",
                "Connection is already authenticated",
            ));
            Ok(())
        }
        ClientMessage::Join { conversation_id } => {
            let joined = state.dispatcher.handle_join(handle.id, &conversation_id).await;
            joined.map(|_| {
                let _ = handle.send(ServerMessage::Joined { conversation_id });
            })
        }
        ClientMessage::Leave { conversation_id } => {
            state.dispatcher.handle_leave(handle.id, &conversation_id);
            let _ = handle.send(ServerMessage::Left { conversation_id });
            Ok(())
        }
        ClientMessage::Typing {
            conversation_id,
            is_typing,
        } => state
            .dispatcher
            .handle_typing(handle.id, &conversation_id, is_typing)
            .map(|_| ()),
        ClientMessage::Heartbeat => {
            let _ = handle.send(ServerMessage::HeartbeatAck);
            Ok(())
        }
    };

    match result {
        Ok(()) => None,
        Err(e) if e.is_terminal() => {
            tracing::warn!(connection_id = %handle.id, error = %e, "Closing connection after terminal error");
            let _ = handle.send(ServerMessage::from(&e));
            Some(CloseReason::TransportFailure)
        }
        Err(e) => {
            tracing::warn!(
                connection_id = %handle.id,
                code = e.code(),
                error = %e,
                "Rejected client request"
            );
            let _ = handle.send(ServerMessage::from(&e));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_token_prefers_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));

        let query = WsQuery { token: Some("from-query".into()) };
        assert_eq!(extract_token(&query, &headers).as_deref(), Some("from-query"));

        let query = WsQuery { token: None };
        assert_eq!(extract_token(&query, &headers).as_deref(), Some("from-header"));
    }

    #[test]
    fn test_extract_token_missing() {
        let query = WsQuery { token: Some(String::new()) };
        assert_eq!(extract_token(&query, &HeaderMap::new()), None);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token(&WsQuery { token: None }, &headers), None);
    }
}
