use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::candle_aggregator::{fold, Candle, Tick};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval_sec: u64,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval_sec: u64) -> Self {
        Self {
            symbol: symbol.into(),
            interval_sec,
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}s", self.symbol, self.interval_sec)
    }
}

/// The candle touched by one applied tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandleUpdate {
    pub candle: Candle,
    pub changed_index: usize,
    /// Buffer length after the fold.
    pub len: usize,
}

// ---------------------------------------------------------------------------
// CandleStore -- one rolling buffer per (symbol, interval)
// ---------------------------------------------------------------------------

/// Rolling candle buffers keyed by `(symbol, interval)`.
///
/// The store is the single writer for every buffer it holds: ticks go through
/// [`CandleStore::apply`], which swaps in the buffer returned by [`fold`].
/// Readers only ever receive cloned snapshots.
pub struct CandleStore {
    buffers: RwLock<HashMap<CandleKey, Vec<Candle>>>,
    max_candles: usize,
}

impl CandleStore {
    /// Create a store that retains at most `max_candles` candles per key,
    /// the open candle included.
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles: max_candles.max(1),
        }
    }

    pub fn max_candles(&self) -> usize {
        self.max_candles
    }

    /// Fold `tick` into the buffer for `key`, creating the buffer on first use.
    pub fn apply(&self, key: &CandleKey, tick: Tick) -> CandleUpdate {
        let mut map = self.buffers.write();
        let current = map.get(key).map(Vec::as_slice).unwrap_or(&[]);
        let folded = fold(current, tick, key.interval_sec, self.max_candles);

        let update = CandleUpdate {
            candle: folded.candles[folded.changed_index],
            changed_index: folded.changed_index,
            len: folded.candles.len(),
        };
        map.insert(key.clone(), folded.candles);
        update
    }

    /// Replace the buffer for `key` wholesale, e.g. from a server snapshot.
    ///
    /// Candles that are out of order or duplicated are dropped so the
    /// monotonic invariant holds; only the newest `max_candles` are kept.
    pub fn replace(&self, key: &CandleKey, candles: &[Candle]) -> usize {
        let mut cleaned: Vec<Candle> = Vec::with_capacity(candles.len());
        for c in candles {
            if cleaned.last().map_or(true, |last| c.time > last.time) {
                cleaned.push(*c);
            }
        }
        let start = cleaned.len().saturating_sub(self.max_candles);
        cleaned.drain(..start);

        let len = cleaned.len();
        self.buffers.write().insert(key.clone(), cleaned);
        len
    }

    /// Snapshot of the full buffer for `key` (oldest first).
    pub fn snapshot(&self, key: &CandleKey) -> Vec<Candle> {
        self.buffers.read().get(key).cloned().unwrap_or_default()
    }

    /// The open (last) candle for `key`, if any.
    pub fn last(&self, key: &CandleKey) -> Option<Candle> {
        self.buffers.read().get(key).and_then(|b| b.last().copied())
    }

    pub fn count(&self, key: &CandleKey) -> usize {
        self.buffers.read().get(key).map_or(0, Vec::len)
    }

    /// All keys that currently hold a buffer.
    pub fn keys(&self) -> Vec<CandleKey> {
        self.buffers.read().keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
