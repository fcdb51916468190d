//! WebSocket event stream for connected dashboards.
//!
//! The broadcaster is a thin fan-out over a `tokio::sync::broadcast`
//! channel: publishers never block, and a slow client only loses its own
//! oldest frames.

use super::state::ApiState;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One frame pushed to every connected client.
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

/// Cloneable handle used by the trigger engine and watchdog to push frames.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Frame>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Push a `{type, payload}` frame to every connected client. A send with
    /// no clients is a no-op.
    pub fn broadcast(&self, event: &str, payload: Value) {
        self.tx
            .send(Frame {
                kind: event.to_string(),
                payload,
            })
            .ok();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.tx.subscribe()
    }
}

pub(super) async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = state.deps.broadcaster.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(mut socket: WebSocket, mut rx: broadcast::Receiver<Frame>) {
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(frame) => {
                    let Ok(json) = serde_json::to_string(&frame) else {
                        continue;
                    };
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    tracing::debug!(count, "websocket client lagged, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = socket.recv() => match inbound {
                // The stream is one-way; client frames are drained so pings
                // keep flowing, and a close ends the task.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
