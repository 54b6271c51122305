// =============================================================================
// SSE Fallback Endpoint — `GET /api/sse/trading`
// =============================================================================
//
// One-way push for clients whose primary transport is blocked. On connect
// the client receives one unnamed event per candle series (a
// `candle_snapshot` payload), then every hub event. `price_update` and
// `trade_update` go out as named events; everything else is unnamed. Each
// event carries its hub sequence number as the SSE `id`.
// =============================================================================

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::stream::{Sequenced, StreamEvent};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Decrements the client counter when the response stream is dropped.
struct ClientGuard {
    state: Arc<AppState>,
    session: Uuid,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let clients = self.state.client_disconnected();
        info!(session = %self.session, clients, "SSE client disconnected");
    }
}

pub async fn sse_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session = Uuid::new_v4();
    let clients = state.client_connected();
    let resumed_from = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    info!(%session, clients, ?resumed_from, transport = "sse", "Stream client connected");

    let live = state.hub.subscribe();
    let snapshots: Vec<Result<Event, Infallible>> = state
        .candle_snapshots()
        .iter()
        .filter_map(|event| encode(event, None))
        .map(Ok)
        .collect();

    let guard = ClientGuard {
        state: state.clone(),
        session,
    };

    let updates = stream::unfold((live, guard), |(mut live, guard)| async move {
        loop {
            let received = tokio::select! {
                _ = guard.state.shutdown.cancelled() => return None,
                received = live.recv() => received,
            };
            match received {
                Ok(Sequenced { seq, event }) => {
                    if let Some(encoded) = encode(&event, Some(seq)) {
                        return Some((Ok(encoded), (live, guard)));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session = %guard.session, skipped, "SSE client lagging, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream::iter(snapshots).chain(updates)).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}

/// Encode a stream event as an SSE event. The payload is the full tagged
/// `StreamEvent` JSON so the client can dispatch on `type`.
fn encode(event: &StreamEvent, seq: Option<u64>) -> Option<Event> {
    let data = match event.to_json() {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, kind = %event.kind(), "Failed to serialize SSE event");
            return None;
        }
    };
    let mut out = Event::default().data(data);
    if let Some(name) = event.kind().sse_name() {
        out = out.event(name);
    }
    if let Some(seq) = seq {
        out = out.id(seq.to_string());
    }
    Some(out)
}
