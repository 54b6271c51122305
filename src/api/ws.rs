// =============================================================================
// Primary Stream Handlers — WebSocket push and long-poll
// =============================================================================
//
// Both transports serve the same event sequence from the process's
// `EventHub`:
//
//   WebSocket (`{stream_path}/websocket`)
//     1. One `candle_snapshot` per buffered series on connect.
//     2. Every subsequent hub event, as a JSON text frame.
//     Ping frames are answered with Pong; client text frames are ignored.
//
//   Long-poll (`{stream_path}/polling?cursor&wait_ms`)
//     - without `cursor`: handshake, returns the snapshots and the current
//       cursor immediately;
//     - with `cursor`: returns events newer than it, parking up to
//       `wait_ms` (clamped to the server maximum) when there are none.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Json, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::stream::{PollBatch, StreamEvent};

// =============================================================================
// WebSocket
// =============================================================================

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Manages a single WebSocket connection lifecycle.
///
/// Runs via `tokio::select!` until the client leaves or the process shuts
/// down:
///   1. **Push**: forward every hub event.
///   2. **Recv**: Ping/Pong, Close, and ignored client frames.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let session = Uuid::new_v4();
    let clients = state.client_connected();
    info!(%session, clients, transport = "websocket", "Stream client connected");

    // Subscribe before sending snapshots so nothing published in between is
    // lost. Snapshots are idempotent, so overlap is harmless.
    let mut live = state.hub.subscribe();
    let (mut sender, mut receiver) = socket.split();

    for snapshot in state.candle_snapshots() {
        if let Err(e) = send_event(&mut sender, &snapshot).await {
            warn!(%session, error = %e, "Failed to send initial candle snapshot");
            cleanup(&state, session);
            return;
        }
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            // ── Push ─────────────────────────────────────────────────────
            item = live.recv() => {
                match item {
                    Ok(item) => {
                        if let Err(e) = send_event(&mut sender, &item.event).await {
                            debug!(%session, error = %e, "WebSocket send failed, disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%session, skipped, "WebSocket client lagging, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            // ── Recv ─────────────────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        debug!(%session, "WebSocket Ping received, sending Pong");
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(%session, error = %e, "Failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(%session, "WebSocket Close frame received");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(%session, msg = %text, "Ignoring client text frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(%session, error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    cleanup(&state, session);
}

/// Serialize and send one event as a text frame.
///
/// Serialization failures are logged and skipped; only network errors are
/// returned.
async fn send_event<S>(sender: &mut S, event: &StreamEvent) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    match event.to_json() {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            warn!(error = %e, kind = %event.kind(), "Failed to serialize stream event");
            Ok(())
        }
    }
}

fn cleanup(state: &Arc<AppState>, session: Uuid) {
    let clients = state.client_disconnected();
    info!(%session, clients, "Stream client disconnected");
}

// =============================================================================
// Long-poll
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    cursor: Option<u64>,
    wait_ms: Option<u64>,
}

pub async fn poll_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PollQuery>,
) -> Json<PollBatch> {
    let max_wait = state.config.long_poll_wait();
    let wait = query
        .wait_ms
        .map(Duration::from_millis)
        .unwrap_or(max_wait)
        .min(max_wait);

    match query.cursor {
        None => {
            // Cursor first: anything published while snapshotting may be
            // delivered again on the next poll.
            let cursor = state.hub.latest_seq();
            let events = state.candle_snapshots();
            debug!(
                session = %Uuid::new_v4(),
                cursor,
                snapshots = events.len(),
                "Polling handshake"
            );
            Json(PollBatch { cursor, events })
        }
        Some(cursor) => {
            let batch = tokio::select! {
                _ = state.shutdown.cancelled() => state.hub.since(cursor),
                batch = state.hub.wait_since(cursor, wait) => batch,
            };
            Json(batch)
        }
    }
}
