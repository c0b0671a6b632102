// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The `/v1/ws/tts` WebSocket handler (spec §4.8), grounded on
//! `yapit/gateway/api/v1/ws.py::tts_websocket`.
//!
//! Authentication is out of scope here (spec.md §1 excludes the broader
//! HTTP/REST API surface, which is where the original's `authenticate_ws`
//! dependency lives); the caller's identity is taken from a `user_id` query
//! parameter instead. A real deployment would authenticate the upgrade
//! request and derive `user_id` from the session, the way
//! `echo-session-ws-gateway::ws_handler` checks `Origin` before upgrading.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tts_dispatch::{evict_for_cursor, DispatchOutcome, SynthesisRequest, DEFAULT_BUFFER_AHEAD, DEFAULT_BUFFER_BEHIND};
use tts_protocol::{BlockStatus, ClientMessage, ServerMessage, SynthesisMode, UserId};
use tts_queue::Queue;
use tts_registry::BlockStore;

use crate::state::{AppState, MAX_TTS_REQUESTS_PER_MINUTE};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    user_id: UserId,
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.user_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: UserId) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(64);

    let conn_id = state.hub.lock().expect("hub lock poisoned").register(tx.clone());
    tracing::info!(%user_id, conn_id, "ws_connect");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_rx.next().await {
        let Message::Text(raw) = message else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(&raw) {
            Ok(ClientMessage::Synthesize {
                document_id,
                block_indices,
                cursor: _cursor,
                model,
                voice,
                synthesis_mode,
            }) => {
                state
                    .hub
                    .lock()
                    .expect("hub lock poisoned")
                    .subscribe(conn_id, user_id, document_id);
                handle_synthesize(
                    &state,
                    &tx,
                    user_id,
                    document_id,
                    block_indices,
                    &model,
                    &voice,
                    synthesis_mode,
                )
                .await;
            }
            Ok(ClientMessage::CursorMoved { document_id, cursor }) => {
                handle_cursor_moved(&state, &tx, user_id, document_id, cursor).await;
            }
            Err(err) => {
                let _ = tx
                    .send(ServerMessage::Error {
                        error: err.to_string(),
                    })
                    .await;
            }
        }
    }

    writer.abort();
    state.hub.lock().expect("hub lock poisoned").remove(conn_id);
    tracing::info!(%user_id, conn_id, "ws_disconnect");
}

#[allow(clippy::too_many_arguments)]
async fn handle_synthesize(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<ServerMessage>,
    user_id: UserId,
    document_id: tts_protocol::DocumentId,
    block_indices: Vec<u32>,
    model: &str,
    voice: &str,
    synthesis_mode: SynthesisMode,
) {
    match state.queue.check_rate_limit(user_id, MAX_TTS_REQUESTS_PER_MINUTE).await {
        Ok(true) => {}
        Ok(false) => {
            let _ = tx
                .send(ServerMessage::Error {
                    error: "Rate limit exceeded. Please slow down.".into(),
                })
                .await;
            return;
        }
        Err(err) => {
            let _ = tx.send(ServerMessage::Error { error: err.to_string() }).await;
            return;
        }
    }

    for block_index in block_indices {
        let text = match state.blocks.block_text(document_id, block_index).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::warn!(%document_id, block_index, "block not found, skipping");
                let _ = tx
                    .send(ServerMessage::status(document_id, block_index, BlockStatus::Skipped))
                    .await;
                continue;
            }
            Err(err) => {
                let _ = tx.send(ServerMessage::block_error(document_id, block_index, err.to_string())).await;
                continue;
            }
        };

        let request = SynthesisRequest {
            user_id,
            document_id,
            block_index,
            text,
            model_slug: model.to_string(),
            voice_slug: voice.to_string(),
            parameters: json!({}),
            codec: "opus".to_string(),
            synthesis_mode,
            track_for_websocket: true,
        };

        let outcome = state.dispatcher.request_synthesis(request).await;
        let message = match outcome {
            Ok(DispatchOutcome::Cached { audio_url, .. }) => {
                ServerMessage::cached(document_id, block_index, audio_url)
            }
            Ok(DispatchOutcome::Queued { .. }) => {
                ServerMessage::status(document_id, block_index, BlockStatus::Queued)
            }
            Ok(DispatchOutcome::Error { message }) => {
                ServerMessage::block_error(document_id, block_index, message)
            }
            Err(err) => ServerMessage::block_error(document_id, block_index, err.to_string()),
        };
        let _ = tx.send(message).await;
    }
}

async fn handle_cursor_moved(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<ServerMessage>,
    user_id: UserId,
    document_id: tts_protocol::DocumentId,
    cursor: i64,
) {
    let evicted = evict_for_cursor(
        state.queue.as_ref(),
        user_id,
        document_id,
        cursor,
        DEFAULT_BUFFER_BEHIND,
        DEFAULT_BUFFER_AHEAD,
    )
    .await;

    match evicted {
        Ok(block_indices) if !block_indices.is_empty() => {
            let _ = tx
                .send(ServerMessage::Evicted {
                    document_id,
                    block_indices,
                })
                .await;
        }
        Ok(_) => {}
        Err(err) => {
            let _ = tx.send(ServerMessage::Error { error: err.to_string() }).await;
        }
    }
}
