// =============================================================================
// Chart Feed — client-side candle state fed by the push channels
// =============================================================================
//
// Owns the primary transport and the SSE fallback and keeps a local
// `CandleStore` in sync:
//   - `candle_snapshot` replaces a series wholesale (idempotent on reconnect),
//   - `price_update` is folded into every tracked interval.
//
// Failover: when the primary transport gives up (terminal Disconnected after
// a failure) the fallback is opened; when the primary reconnects the
// fallback is closed again.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fallback::FallbackStreamClient;
use super::transport::TransportClient;
use crate::market_data::{CandleKey, CandleStore};
use crate::runtime_config::ClientConfig;
use crate::stream::{EventKind, StreamEvent};
use crate::types::{ConnectionPhase, ConnectionState};

pub struct ChartFeed {
    store: Arc<CandleStore>,
    intervals: Vec<u64>,
    transport: Arc<TransportClient>,
    fallback: Arc<FallbackStreamClient>,
}

impl ChartFeed {
    pub fn new(config: &ClientConfig, intervals: Vec<u64>, max_candles: usize) -> Result<Self> {
        let transport = Arc::new(TransportClient::with_network(
            config.origin.clone(),
            config.transport.clone(),
        )?);
        let fallback = Arc::new(FallbackStreamClient::new(
            &config.origin,
            config.fallback.clone(),
        )?);
        Ok(Self::from_parts(transport, fallback, intervals, max_candles))
    }

    pub fn from_parts(
        transport: Arc<TransportClient>,
        fallback: Arc<FallbackStreamClient>,
        intervals: Vec<u64>,
        max_candles: usize,
    ) -> Self {
        Self {
            store: Arc::new(CandleStore::new(max_candles)),
            intervals,
            transport,
            fallback,
        }
    }

    pub fn store(&self) -> &Arc<CandleStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<TransportClient> {
        &self.transport
    }

    pub fn fallback(&self) -> &Arc<FallbackStreamClient> {
        &self.fallback
    }

    /// Apply one pushed event to the local candle state.
    pub fn apply(&self, event: &StreamEvent) {
        apply_event(&self.store, &self.intervals, event);
    }

    /// Connect and keep the local store updated until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut events = self.transport.subscribe_events();
        let mut state_rx = self.transport.watch_state();

        let listeners: Vec<_> = [EventKind::PriceUpdate, EventKind::CandleSnapshot]
            .into_iter()
            .map(|kind| {
                let store = self.store.clone();
                let intervals = self.intervals.clone();
                self.fallback
                    .on(kind, move |event| apply_event(&store, &intervals, event))
            })
            .collect();

        self.transport.connect();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => self.apply(&event),
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Chart feed lagged behind the transport");
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = state_rx.borrow_and_update().clone();
                    self.on_transport_state(&state);
                }
            }
        }

        for id in listeners {
            self.fallback.off(id);
        }
        self.fallback.disconnect();
        self.transport.disconnect();
        debug!("Chart feed stopped");
    }

    fn on_transport_state(&self, state: &ConnectionState) {
        match state.phase {
            ConnectionPhase::Connected => {
                if self.fallback.is_active() {
                    info!("Primary transport restored, closing SSE fallback");
                    self.fallback.disconnect();
                }
            }
            ConnectionPhase::Disconnected if state.last_error.is_some() => {
                if !self.fallback.is_active() {
                    warn!(
                        error = state.last_error.as_deref().unwrap_or_default(),
                        "Primary transport gave up, switching to SSE fallback"
                    );
                    self.fallback.connect();
                }
            }
            _ => {}
        }
    }
}

fn apply_event(store: &CandleStore, intervals: &[u64], event: &StreamEvent) {
    match event {
        StreamEvent::CandleSnapshot(snap) => {
            let key = CandleKey::new(snap.symbol.clone(), snap.interval_sec);
            let kept = store.replace(&key, &snap.candles);
            debug!(key = %key, candles = kept, "Candle snapshot applied");
        }
        StreamEvent::PriceUpdate(update) => {
            let tick = update.tick();
            for &interval in intervals {
                store.apply(&CandleKey::new(update.symbol.clone(), interval), tick);
            }
        }
        StreamEvent::TradeUpdate(_) | StreamEvent::Message(_) => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::market_data::Candle;
    use crate::runtime_config::{FallbackOptions, TransportOptions};
    use crate::stream::{CandleSnapshot, PriceUpdate};

    fn closed_origin() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let origin = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        origin
    }

    fn feed(origin: &str, attempts: u32) -> ChartFeed {
        let transport = TransportClient::with_network(
            origin,
            TransportOptions {
                reconnection_attempts: attempts,
                reconnection_delay_ms: 10,
                reconnection_delay_max_ms: 20,
                timeout_ms: 1000,
                ..TransportOptions::default()
            },
        )
        .unwrap();
        let fallback = FallbackStreamClient::new(
            origin,
            FallbackOptions {
                base_delay_ms: 1000,
                ..FallbackOptions::default()
            },
        )
        .unwrap();
        ChartFeed::from_parts(Arc::new(transport), Arc::new(fallback), vec![60], 100)
    }

    fn candle(time: i64, close: f64) -> Candle {
        Candle {
            time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    #[tokio::test]
    async fn snapshot_then_price_updates() {
        let f = feed(&closed_origin(), 1);
        let key = CandleKey::new("BTCUSDT", 60);

        f.apply(&StreamEvent::CandleSnapshot(CandleSnapshot {
            symbol: "BTCUSDT".into(),
            interval_sec: 60,
            candles: vec![candle(0, 100.0), candle(60, 101.0)],
        }));
        assert_eq!(f.store().count(&key), 2);

        // Same bucket as the last candle.
        f.apply(&StreamEvent::PriceUpdate(PriceUpdate {
            symbol: "BTCUSDT".into(),
            price: 105.0,
            timestamp: 90_000,
        }));
        let last = f.store().last(&key).unwrap();
        assert_eq!(last.time, 60);
        assert_eq!(last.high, 105.0);
        assert_eq!(last.close, 105.0);

        // Next bucket opens at the previous close.
        f.apply(&StreamEvent::PriceUpdate(PriceUpdate {
            symbol: "BTCUSDT".into(),
            price: 99.0,
            timestamp: 125_000,
        }));
        let last = f.store().last(&key).unwrap();
        assert_eq!(last.time, 120);
        assert_eq!(last.open, 105.0);
        assert_eq!(f.store().count(&key), 3);

        // A fresh snapshot replaces the series.
        f.apply(&StreamEvent::CandleSnapshot(CandleSnapshot {
            symbol: "BTCUSDT".into(),
            interval_sec: 60,
            candles: vec![candle(0, 1.0)],
        }));
        assert_eq!(f.store().count(&key), 1);
    }

    #[tokio::test]
    async fn switches_to_fallback_when_primary_gives_up() {
        let f = Arc::new(feed(&closed_origin(), 2));
        let mut fallback_state = f.fallback().watch_state();
        let cancel = CancellationToken::new();

        let runner = {
            let f = f.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { f.run(cancel).await })
        };

        tokio::time::timeout(
            Duration::from_secs(10),
            fallback_state.wait_for(|s| s.phase != ConnectionPhase::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(f.transport().state().phase, ConnectionPhase::Disconnected);

        cancel.cancel();
        runner.await.unwrap();
        assert_eq!(f.fallback().state().phase, ConnectionPhase::Disconnected);
        assert_eq!(f.fallback().listener_count(EventKind::PriceUpdate), 0);
    }
}
