//! WebSocket stream of experiment events.
//!
//! Protocol: the client's first text frame is a hello,
//! `{"experiment_id": "<uuid>", "last_seq": <n>}`. The server subscribes to
//! the live feed first, replays stored events with seq greater than
//! `last_seq`, then forwards live events past the replay high-water mark —
//! in that order, so a reconnecting client sees no gaps and no duplicates.
//! Omitting `experiment_id` subscribes to the live feed across all
//! experiments with no replay.
//!
//! Delivery is best-effort: a lagged receiver is disconnected and expected
//! to reconnect with its last-seen seq.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::routes::AppState;

#[derive(Debug, Default, Deserialize)]
struct Hello {
    #[serde(default)]
    experiment_id: Option<Uuid>,
    #[serde(default)]
    last_seq: i64,
}

/// GET /ws
pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let hello = match read_hello(&mut socket).await {
        Some(hello) => hello,
        None => return,
    };

    // Subscribe before replaying so nothing published during replay is lost;
    // the seq cursor filters out anything delivered both ways.
    let mut rx = state.broadcaster.subscribe();
    let mut cursor = hello.last_seq;

    if let Some(experiment_id) = hello.experiment_id {
        let replay = match state.store.events_after(experiment_id, cursor) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "ws replay failed");
                return;
            }
        };
        for event in replay {
            cursor = cursor.max(event.seq);
            if send_event(&mut socket, &event).await.is_err() {
                return;
            }
        }
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => {
                    if let Some(experiment_id) = hello.experiment_id {
                        if event.experiment_id != experiment_id || event.seq <= cursor {
                            continue;
                        }
                        cursor = event.seq;
                    }
                    let Ok(frame) = serde_json::to_string(&event) else { continue };
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "ws subscriber lagged, disconnecting");
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
                Err(RecvError::Closed) => return,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                // Clients only ever send the hello; anything later is ignored.
                Some(Ok(_)) => {}
            },
        }
    }
}

/// First text frame, or an empty hello if the client starts with a ping.
async fn read_hello(socket: &mut WebSocket) -> Option<Hello> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => {
                return match serde_json::from_str(&text) {
                    Ok(hello) => Some(hello),
                    Err(e) => {
                        tracing::debug!(error = %e, "malformed ws hello");
                        None
                    }
                };
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => return Some(Hello::default()),
        }
    }
}

async fn send_event(
    socket: &mut WebSocket,
    event: &crate::model::ExperimentEvent,
) -> Result<(), axum::Error> {
    let frame = serde_json::to_string(event).map_err(axum::Error::new)?;
    socket.send(Message::Text(frame.into())).await
}
