// =============================================================================
// HTTP Surface — Axum 0.7
// =============================================================================
//
// Routes:
//   GET {stream_path}/websocket            primary stream, WebSocket upgrade
//   GET {stream_path}/polling              primary stream, long-poll
//   GET /api/sse/trading                   SSE fallback
//   GET /api/health                        liveness + per-process stats
//   GET /api/candles/:symbol/:interval_sec buffered candles for one series
//
// No authentication: the relay only serves public market data. CORS is
// permissive so browser charts on other origins can connect.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::app_state::{AppState, ProcessStats};
use crate::market_data::CandleKey;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let stream_path = format!("/{}", state.config.stream_path.trim_matches('/'));

    Router::new()
        // ── Primary stream ──────────────────────────────────────────
        .route(
            &format!("{stream_path}/websocket"),
            get(crate::api::ws::ws_handler),
        )
        .route(
            &format!("{stream_path}/polling"),
            get(crate::api::ws::poll_handler),
        )
        // ── Fallback stream ─────────────────────────────────────────
        .route("/api/sse/trading", get(crate::api::sse::sse_handler))
        // ── Read-only REST ──────────────────────────────────────────
        .route("/api/health", get(health))
        .route("/api/candles/:symbol/:interval_sec", get(candles))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
    #[serde(flatten)]
    stats: ProcessStats,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        server_time: chrono::Utc::now().timestamp_millis(),
        stats: state.stats(),
    };
    Json(resp)
}

// =============================================================================
// Candles
// =============================================================================

async fn candles(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval_sec)): Path<(String, u64)>,
) -> impl IntoResponse {
    let key = CandleKey::new(symbol.to_uppercase(), interval_sec);
    let candles = state.candles.snapshot(&key);
    if candles.is_empty() {
        debug!(key = %key, "Candle series not found");
        let body = serde_json::json!({ "error": format!("no candles for {key}") });
        return (StatusCode::NOT_FOUND, Json(body)).into_response();
    }
    Json(candles).into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::runtime_config::ServerConfig;
    use crate::stream::PriceUpdate;

    fn state() -> Arc<AppState> {
        let config = ServerConfig {
            intervals_sec: vec![60],
            ..ServerConfig::default()
        };
        Arc::new(AppState::new(config, Some(1)))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_reports_process_stats() {
        let state = state();
        state.ingest_price(PriceUpdate {
            symbol: "BTCUSDT".into(),
            price: 1.0,
            timestamp: 0,
        });

        let (status, body) = get_json(router(state), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["worker"], 1);
        assert_eq!(body["ticks_ingested"], 1);
        assert_eq!(body["clients"], 0);
        assert!(body["server_time"].as_i64().unwrap() > 0);
        assert!(body.get("workers_alive").is_none());
    }

    #[tokio::test]
    async fn candles_for_known_and_unknown_series() {
        let state = state();
        for (price, ts) in [(10.0, 0), (12.0, 30_000), (11.0, 61_000)] {
            state.ingest_price(PriceUpdate {
                symbol: "BTCUSDT".into(),
                price,
                timestamp: ts,
            });
        }
        let app = router(state);

        let (status, body) = get_json(app.clone(), "/api/candles/btcusdt/60").await;
        assert_eq!(status, StatusCode::OK);
        let arr = body.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["high"], 12.0);
        assert_eq!(arr[1]["open"], 12.0);

        let (status, _) = get_json(app, "/api/candles/ETHUSDT/60").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn initial_poll_is_a_handshake_with_snapshots() {
        let state = state();
        state.ingest_price(PriceUpdate {
            symbol: "BTCUSDT".into(),
            price: 5.0,
            timestamp: 0,
        });

        let (status, body) = get_json(router(state), "/socket.io/polling?wait_ms=0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cursor"], 1);
        assert_eq!(body["events"][0]["type"], "candle_snapshot");
    }

    #[tokio::test]
    async fn poll_returns_events_after_cursor() {
        let state = state();
        for ts in [0, 1_000] {
            state.ingest_price(PriceUpdate {
                symbol: "BTCUSDT".into(),
                price: 5.0,
                timestamp: ts,
            });
        }

        let (_, body) = get_json(router(state), "/socket.io/polling?cursor=1&wait_ms=0").await;
        assert_eq!(body["cursor"], 2);
        let events = body["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "price_update");
        assert_eq!(events[0]["data"]["timestamp"], 1_000);
    }

    #[tokio::test]
    async fn invalid_poll_query_is_rejected() {
        let resp = router(state())
            .oneshot(
                Request::builder()
                    .uri("/socket.io/polling?cursor=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
