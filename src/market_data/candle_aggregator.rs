// =============================================================================
// Candle Aggregator — folds price ticks into time-bucketed OHLC candles
// =============================================================================
//
// `fold` is a pure function over a borrowed buffer: it never mutates the
// caller's slice and always returns a fresh `Vec` together with the index of
// the candle it touched, so renderers can redraw a single bar.
//
// Ticks are folded strictly in call order. A tick whose bucket is at or
// behind the open bucket updates the open bucket; out-of-order delivery is
// resolved here, never by reordering.
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single price observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub price: f64,
    /// Wall-clock time of the observation in Unix milliseconds.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
}

impl Tick {
    pub fn new(price: f64, timestamp_ms: i64) -> Self {
        Self {
            price,
            timestamp_ms,
        }
    }
}

/// OHLC aggregate over one fixed-width bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start, in Unix seconds.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// A flat candle where every price equals `price`.
    fn flat(time: i64, open: f64, price: f64) -> Self {
        Self {
            time,
            open,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
        }
    }

    fn absorb(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }
}

/// Result of folding one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Folded {
    pub candles: Vec<Candle>,
    /// Index (into `candles`) of the candle that was created or updated.
    pub changed_index: usize,
}

/// Start of the bucket containing `timestamp_ms`, in Unix seconds.
///
/// Floors toward negative infinity, so pre-epoch timestamps land in the
/// bucket that contains them. An `interval_sec` of 0 is treated as 1.
pub fn bucket_start(timestamp_ms: i64, interval_sec: u64) -> i64 {
    let interval = interval_sec.max(1).min(i64::MAX as u64) as i64;
    let secs = timestamp_ms.div_euclid(1000);
    secs.div_euclid(interval) * interval
}

/// Fold `tick` into `buffer`, returning the new buffer and the touched index.
///
/// * Empty buffer: one flat candle at the tick's bucket.
/// * Bucket at or behind the last candle: the last candle absorbs the price
///   (`high`/`low` widen, `close` moves, `open` and `time` stay).
/// * Strictly newer bucket: a new candle opening at the previous close is
///   appended, then the oldest candles are evicted down to `max_len`.
///
/// A `max_len` of 0 is treated as 1.
pub fn fold(buffer: &[Candle], tick: Tick, interval_sec: u64, max_len: usize) -> Folded {
    let max_len = max_len.max(1);
    let bucket = bucket_start(tick.timestamp_ms, interval_sec);

    let Some(last) = buffer.last() else {
        return Folded {
            candles: vec![Candle::flat(bucket, tick.price, tick.price)],
            changed_index: 0,
        };
    };

    if bucket <= last.time {
        let mut candles = buffer.to_vec();
        let idx = candles.len() - 1;
        candles[idx].absorb(tick.price);
        return Folded {
            candles,
            changed_index: idx,
        };
    }

    // Keep at most `max_len - 1` of the existing candles so the append lands
    // exactly on the cap.
    let keep_from = buffer.len().saturating_sub(max_len - 1);
    let mut candles = Vec::with_capacity(buffer.len() - keep_from + 1);
    candles.extend_from_slice(&buffer[keep_from..]);
    candles.push(Candle::flat(bucket, last.close, tick.price));

    Folded {
        changed_index: candles.len() - 1,
        candles,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
