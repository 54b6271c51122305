use serde::{Deserialize, Serialize};

use crate::market_data::{Candle, Tick};

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// `price_update` payload: the tick ingestion shape plus its symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: f64,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl PriceUpdate {
    pub fn tick(&self) -> Tick {
        Tick::new(self.price, self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub side: TradeSide,
    pub timestamp: i64,
}

/// Full buffer for one series, sent on (re)connect so clients can rebuild
/// their chart state idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSnapshot {
    pub symbol: String,
    pub interval_sec: u64,
    pub candles: Vec<Candle>,
}

/// Every event the relay pushes to clients.
///
/// On the wire: `{"type": "price_update", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    PriceUpdate(PriceUpdate),
    TradeUpdate(TradeUpdate),
    CandleSnapshot(CandleSnapshot),
    Message(serde_json::Value),
}

/// Payload-free discriminant of [`StreamEvent`], used to key listener tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    PriceUpdate,
    TradeUpdate,
    CandleSnapshot,
    Message,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::PriceUpdate,
        EventKind::TradeUpdate,
        EventKind::CandleSnapshot,
        EventKind::Message,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PriceUpdate => "price_update",
            Self::TradeUpdate => "trade_update",
            Self::CandleSnapshot => "candle_snapshot",
            Self::Message => "message",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// SSE `event:` name for this kind. Snapshots and generic messages go out
    /// as unnamed (default `message`) events.
    pub fn sse_name(self) -> Option<&'static str> {
        match self {
            Self::PriceUpdate | Self::TradeUpdate => Some(self.as_str()),
            Self::CandleSnapshot | Self::Message => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PriceUpdate(_) => EventKind::PriceUpdate,
            Self::TradeUpdate(_) => EventKind::TradeUpdate,
            Self::CandleSnapshot(_) => EventKind::CandleSnapshot,
            Self::Message(_) => EventKind::Message,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_update_wire_shape() {
        let ev = StreamEvent::PriceUpdate(PriceUpdate {
            symbol: "BTCUSDT".into(),
            price: 100.5,
            timestamp: 1_700_000_000_000,
        });
        let json: serde_json::Value = serde_json::from_str(&ev.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "price_update");
        assert_eq!(json["data"]["symbol"], "BTCUSDT");
        assert_eq!(json["data"]["timestamp"], 1_700_000_000_000i64);
    }

    #[test]
    fn generic_message_carries_arbitrary_json() {
        let ev = StreamEvent::from_json(r#"{"type":"message","data":{"hello":[1,2]}}"#).unwrap();
        assert_eq!(ev.kind(), EventKind::Message);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(StreamEvent::from_json(r#"{"type":"order_update","data":{}}"#).is_err());
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("nope"), None);
    }
}
