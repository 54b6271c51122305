// =============================================================================
// Tick Sources — upstream price feeds for one serving process
// =============================================================================
//
// Every process subscribes to the upstream feed on its own; nothing is shared
// between workers. The simulated feed is a pure function of (symbol, step),
// so independent workers publish identical prices for the same second.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::stream::{TradeSide, TradeUpdate};

// ---------------------------------------------------------------------------
// Binance aggTrade stream
// ---------------------------------------------------------------------------

/// Connect to the Binance aggTrade WebSocket stream for a single symbol and
/// feed every trade into `state`.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the caller can handle reconnection.
pub async fn run_binance_trade_stream(symbol: &str, state: &Arc<AppState>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@aggTrade");
    info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(symbol = %symbol, "trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_agg_trade(&text) {
                        Ok(trade) => state.ingest_trade(trade),
                        Err(e) => {
                            warn!(error = %e, "failed to parse aggTrade message");
                        }
                    }
                }
                // Ping / Pong / Binary / Close: tungstenite answers pings itself.
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance aggTrade message.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "T": 1700000000000, "m": true }
/// ```
fn parse_agg_trade(text: &str) -> Result<TradeUpdate> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let symbol = root["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    let quantity: f64 = root["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    let timestamp = root["T"].as_i64().context("missing field T")?;

    // Buyer is maker => the aggressor sold.
    let is_buyer_maker = root["m"].as_bool().context("missing field m")?;
    let side = if is_buyer_maker {
        TradeSide::Sell
    } else {
        TradeSide::Buy
    };

    Ok(TradeUpdate {
        symbol,
        price,
        quantity,
        side,
        timestamp,
    })
}

// ---------------------------------------------------------------------------
// Simulated feed
// ---------------------------------------------------------------------------

fn symbol_seed(symbol: &str) -> u64 {
    // FNV-1a; stable across processes and builds.
    symbol.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Deterministic simulated trade for `symbol` at `timestamp_ms`.
///
/// Price is a slow two-wave oscillation around a per-symbol base, plus
/// per-step noise seeded from `(symbol, step)`.
pub fn simulated_trade(symbol: &str, timestamp_ms: i64, step_ms: u64) -> TradeUpdate {
    let seed = symbol_seed(symbol);
    let step = timestamp_ms.div_euclid(step_ms.max(1) as i64);

    let base = 50.0 + (seed % 950) as f64;
    let t = step as f64;
    let wave = (t / 600.0 * std::f64::consts::TAU).sin() * 0.02 + (t / 97.0).sin() * 0.005;

    let mut rng = StdRng::seed_from_u64(seed ^ (step as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    let noise: f64 = rng.gen_range(-0.001..0.001);
    let quantity: f64 = rng.gen_range(0.01..2.0);
    let side = if rng.gen_bool(0.5) {
        TradeSide::Buy
    } else {
        TradeSide::Sell
    };

    TradeUpdate {
        symbol: symbol.to_string(),
        price: base * (1.0 + wave + noise),
        quantity,
        side,
        timestamp: timestamp_ms,
    }
}

/// Emit one simulated trade per `period` until `cancel` fires.
pub async fn run_simulated_ticks(
    symbol: String,
    period: Duration,
    state: Arc<AppState>,
    cancel: CancellationToken,
) {
    let step_ms = period.as_millis().max(1) as u64;
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(symbol = %symbol, period_ms = step_ms, "simulated tick source started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let now = chrono::Utc::now().timestamp_millis();
                let trade = simulated_trade(&symbol, now, step_ms);
                debug!(symbol = %symbol, price = trade.price, "simulated trade");
                state.ingest_trade(trade);
            }
        }
    }

    info!(symbol = %symbol, "simulated tick source stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_agg_trade_ok() {
        let json = r#"{"e":"aggTrade","E":1700000000100,"s":"btcusdt","a":1,
                       "p":"37000.50","q":"0.250","f":1,"l":1,"T":1700000000000,"m":true,"M":true}"#;
        let trade = parse_agg_trade(json).unwrap();
        assert_eq!(trade.symbol, "BTCUSDT");
        assert!((trade.price - 37000.5).abs() < f64::EPSILON);
        assert!((trade.quantity - 0.25).abs() < f64::EPSILON);
        assert_eq!(trade.side, TradeSide::Sell);
        assert_eq!(trade.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn parse_agg_trade_rejects_missing_price() {
        let json = r#"{"e":"aggTrade","s":"BTCUSDT","q":"1","T":1,"m":false}"#;
        assert!(parse_agg_trade(json).is_err());
    }

    #[test]
    fn simulated_feed_is_deterministic_per_step() {
        let a = simulated_trade("BTCUSDT", 1_700_000_000_123, 1000);
        let b = simulated_trade("BTCUSDT", 1_700_000_000_999, 1000);
        assert_eq!(a.price, b.price);
        assert_eq!(a.side, b.side);

        let other = simulated_trade("ETHUSDT", 1_700_000_000_123, 1000);
        assert_ne!(a.price, other.price);
    }

    #[test]
    fn simulated_prices_stay_positive() {
        for i in 0..2_000 {
            let t = simulated_trade("SOLUSDT", i * 1000, 1000);
            assert!(t.price > 0.0);
            assert!(t.quantity > 0.0);
        }
    }
}
