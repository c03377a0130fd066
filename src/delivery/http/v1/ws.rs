use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use uuid::Uuid;
use validator::Validate;

use crate::usecase::error::UsecaseError;
use crate::usecase::feed::FeedSnapshot;
use crate::AppState;

#[derive(Deserialize, Validate)]
pub struct WsQuery {
    #[validate(length(min = 1))]
    token: String,
}

/// Browsers cannot set headers on a websocket upgrade, so the access token
/// travels in the query string.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, UsecaseError> {
    if query.validate().is_err() {
        return Err(UsecaseError::Unauthorized("Missing token".to_string()));
    }

    let claims = state.jwt_service.validate_token(&query.token).map_err(|e| {
        tracing::warn!(error = %e, "WS connection rejected: invalid token");
        UsecaseError::Unauthorized(e.to_string())
    })?;

    tracing::info!(user_id = %claims.sub, "WS connection accepted, upgrading");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, claims.sub, state)))
}

fn encode(snapshot: &FeedSnapshot) -> Option<Message> {
    match serde_json::to_string(snapshot) {
        Ok(payload) => Some(Message::Text(payload.into())),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize feed snapshot");
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, user_id: Uuid, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let feed = state.sessions.sign_in(user_id).await;
    let mut rx = feed.subscribe();

    // Current state first; later frames follow every refresh and mutation.
    if let Some(message) = encode(&feed.snapshot()) {
        if ws_sender.send(message).await.is_err() {
            tracing::info!(user_id = %user_id, "WS client disconnected before first frame");
            return;
        }
    }
    drop(feed);

    tracing::info!(user_id = %user_id, "WS client connected");

    loop {
        tokio::select! {
            update = rx.recv() => {
                match update {
                    Ok(snapshot) => {
                        let Some(message) = encode(&snapshot) else { continue };
                        tracing::debug!(
                            user_id = %user_id,
                            count = snapshot.notifications.len(),
                            "sending feed update to WS client"
                        );
                        if ws_sender.send(message).await.is_err() {
                            tracing::info!(user_id = %user_id, "WS send failed, client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Every frame carries the full feed, so only the newest matters.
                        tracing::warn!(user_id = %user_id, lagged = n, "WS client lagged, skipped stale snapshots");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!(user_id = %user_id, "feed closed, session ended");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(user_id = %user_id, "WS client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(user_id = %user_id, error = %e, "WS receive error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
