//! WebSocket attachment to a persistent session.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, Frame, ServerMessage};
use uuid::Uuid;

use super::error::ApiError;
use super::state::AppState;
use crate::session::{SessionId, SessionRegistry};

/// Upgrade handler. Unknown sessions are rejected before the upgrade.
pub async fn ws_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if !state.registry.exists(&id) {
        return ApiError::not_found().into_response();
    }
    let Some(ws) = ws else {
        return ApiError::new(StatusCode::BAD_REQUEST, "WebSocket upgrade required")
            .into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, id))
}

/// Pumps one client connection until either side goes away.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: SessionId) {
    let client_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let mut outbound = match state.registry.attach(&session_id, client_id.clone()).await {
        Ok(rx) => rx,
        Err(e) => {
            tracing::debug!(session_id = %session_id, error = %e, "Session vanished before attach");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    tracing::info!(session_id = %session_id, client_id = %client_id, "Client attached");

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    if !send_message(&mut sender, &message).await {
                        break;
                    }
                }
                None => {
                    // Relay closed: the session ended.
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&state, &session_id, &text).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    forward_input(&state, &session_id, &bytes).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sender.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(client_id = %client_id, error = %e, "WebSocket error");
                    break;
                }
            },
        }
    }

    // Detaching never affects the session.
    let _ = state.registry.detach(&session_id, &client_id).await;
    tracing::info!(session_id = %session_id, client_id = %client_id, "Client detached");
}

async fn send_message<S>(sender: &mut S, message: &ServerMessage) -> bool
where
    S: futures_util::Sink<Message> + Unpin,
{
    let json = match message.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode server message");
            return true;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

/// Dispatches a text frame: structured messages by type, anything that is
/// not JSON as raw input.
async fn handle_text(state: &AppState, session_id: &SessionId, text: &str) {
    match Frame::<ClientMessage>::decode(text) {
        Frame::Structured(ClientMessage::Input { data }) => {
            forward_input(state, session_id, data.as_bytes()).await;
        }
        Frame::Structured(ClientMessage::Resize { cols, rows }) => {
            if cols == 0 || rows == 0 {
                tracing::debug!(session_id = %session_id, cols, rows, "Ignoring empty resize");
                return;
            }
            if let Err(e) = state.registry.resize(session_id, cols, rows).await {
                tracing::debug!(session_id = %session_id, error = %e, "Resize failed");
            }
        }
        Frame::Raw(raw) => forward_input(state, session_id, raw.as_bytes()).await,
        Frame::Unrecognized => {
            tracing::debug!(session_id = %session_id, "Ignoring unrecognized message");
        }
    }
}

async fn forward_input(state: &AppState, session_id: &SessionId, data: &[u8]) {
    if let Err(e) = state.registry.write(session_id, data).await {
        tracing::debug!(session_id = %session_id, error = %e, "Input not delivered");
    }
}
