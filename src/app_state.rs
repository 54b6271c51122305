// =============================================================================
// Central Application State — one serving process
// =============================================================================
//
// Ties the candle store and the event hub together for one process (primary
// or worker). Nothing here is shared across processes; every worker builds
// its own `AppState` and subscribes to the upstream feed independently.
//
// Thread safety:
//   - Atomic counters for lock-free stats.
//   - `CandleStore` and `EventHub` manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::market_data::{CandleKey, CandleStore};
use crate::runtime_config::ServerConfig;
use crate::stream::{CandleSnapshot, EventHub, PriceUpdate, StreamEvent, TradeUpdate};
use crate::supervisor::FleetView;

/// Process-local state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: ServerConfig,

    // ── Market Data ─────────────────────────────────────────────────────
    pub candles: Arc<CandleStore>,
    pub hub: Arc<EventHub>,

    // ── Identity ────────────────────────────────────────────────────────
    /// Ordinal of this worker; `None` in the primary.
    pub worker_index: Option<usize>,
    /// Fleet view, present only in the primary.
    pub fleet: Option<FleetView>,

    /// Fired when the process begins shutting down; ends open streams so
    /// graceful shutdown does not wait on them forever.
    pub shutdown: CancellationToken,

    // ── Stats ───────────────────────────────────────────────────────────
    pub ticks_ingested: AtomicU64,
    pub connected_clients: AtomicU64,
    pub start_time: Instant,
}

/// Per-process stats exposed by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    pub worker: Option<usize>,
    pub uptime_ms: u64,
    pub ticks_ingested: u64,
    pub clients: u64,
    pub latest_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers_alive: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_restarts: Option<u64>,
}

impl AppState {
    pub fn new(config: ServerConfig, worker_index: Option<usize>) -> Self {
        Self {
            candles: Arc::new(CandleStore::new(config.max_candles)),
            hub: Arc::new(EventHub::new(config.replay_capacity)),
            config,
            worker_index,
            fleet: None,
            shutdown: CancellationToken::new(),
            ticks_ingested: AtomicU64::new(0),
            connected_clients: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn with_fleet(mut self, fleet: FleetView) -> Self {
        self.fleet = Some(fleet);
        self
    }

    // ── Ingestion ───────────────────────────────────────────────────────

    /// Fold a price tick into every configured interval for its symbol and
    /// publish it as a `price_update`.
    pub fn ingest_price(&self, update: PriceUpdate) {
        let tick = update.tick();
        for interval in &self.config.intervals_sec {
            let key = CandleKey::new(update.symbol.clone(), *interval);
            let changed = self.candles.apply(&key, tick);
            debug!(
                key = %key,
                index = changed.changed_index,
                close = changed.candle.close,
                "candle folded"
            );
        }
        self.ticks_ingested.fetch_add(1, Ordering::Relaxed);
        self.hub.publish(StreamEvent::PriceUpdate(update));
    }

    /// Publish a trade and fold its price as a tick.
    pub fn ingest_trade(&self, trade: TradeUpdate) {
        let price = PriceUpdate {
            symbol: trade.symbol.clone(),
            price: trade.price,
            timestamp: trade.timestamp,
        };
        self.hub.publish(StreamEvent::TradeUpdate(trade));
        self.ingest_price(price);
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// One `candle_snapshot` event per buffered series, used to rebuild a
    /// client's chart state when it (re)connects.
    pub fn candle_snapshots(&self) -> Vec<StreamEvent> {
        let mut keys = self.candles.keys();
        keys.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then(a.interval_sec.cmp(&b.interval_sec))
        });
        keys.into_iter()
            .map(|key| {
                let candles = self.candles.snapshot(&key);
                StreamEvent::CandleSnapshot(CandleSnapshot {
                    symbol: key.symbol,
                    interval_sec: key.interval_sec,
                    candles,
                })
            })
            .collect()
    }

    // ── Client accounting ───────────────────────────────────────────────

    pub fn client_connected(&self) -> u64 {
        self.connected_clients.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn client_disconnected(&self) -> u64 {
        let prev = self
            .connected_clients
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn stats(&self) -> ProcessStats {
        ProcessStats {
            worker: self.worker_index,
            uptime_ms: self.start_time.elapsed().as_millis() as u64,
            ticks_ingested: self.ticks_ingested.load(Ordering::Relaxed),
            clients: self.connected_clients.load(Ordering::Relaxed),
            latest_seq: self.hub.latest_seq(),
            workers_alive: self.fleet.as_ref().map(FleetView::alive_count),
            worker_restarts: self.fleet.as_ref().map(FleetView::restarts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::TradeSide;

    fn state() -> AppState {
        let config = ServerConfig {
            intervals_sec: vec![60, 300],
            max_candles: 10,
            ..ServerConfig::default()
        };
        AppState::new(config, Some(2))
    }

    #[test]
    fn ingest_price_folds_every_interval_and_publishes() {
        let state = state();
        state.ingest_price(PriceUpdate {
            symbol: "BTCUSDT".into(),
            price: 10.0,
            timestamp: 0,
        });
        state.ingest_price(PriceUpdate {
            symbol: "BTCUSDT".into(),
            price: 11.0,
            timestamp: 61_000,
        });

        assert_eq!(state.candles.count(&CandleKey::new("BTCUSDT", 60)), 2);
        assert_eq!(state.candles.count(&CandleKey::new("BTCUSDT", 300)), 1);
        assert_eq!(state.hub.latest_seq(), 2);
        assert_eq!(state.stats().ticks_ingested, 2);
    }

    #[test]
    fn ingest_trade_publishes_trade_then_price() {
        let state = state();
        state.ingest_trade(TradeUpdate {
            symbol: "ETHUSDT".into(),
            price: 2000.0,
            quantity: 1.5,
            side: TradeSide::Buy,
            timestamp: 5_000,
        });
        let kinds: Vec<_> = state.hub.since(0).events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                crate::stream::EventKind::TradeUpdate,
                crate::stream::EventKind::PriceUpdate
            ]
        );
    }

    #[test]
    fn snapshots_cover_every_series_in_order() {
        let state = state();
        for sym in ["ETHUSDT", "BTCUSDT"] {
            state.ingest_price(PriceUpdate {
                symbol: sym.into(),
                price: 1.0,
                timestamp: 0,
            });
        }
        let snaps = state.candle_snapshots();
        assert_eq!(snaps.len(), 4);
        match &snaps[0] {
            StreamEvent::CandleSnapshot(s) => {
                assert_eq!(s.symbol, "BTCUSDT");
                assert_eq!(s.interval_sec, 60);
                assert_eq!(s.candles.len(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn client_counter_never_underflows_in_stats() {
        let state = state();
        assert_eq!(state.client_connected(), 1);
        assert_eq!(state.client_disconnected(), 0);
        assert_eq!(state.client_disconnected(), 0);
        assert_eq!(state.stats().clients, 0);
    }
}
