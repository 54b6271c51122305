pub mod events;
pub mod hub;

pub use events::{CandleSnapshot, EventKind, PriceUpdate, StreamEvent, TradeSide, TradeUpdate};
pub use hub::{EventHub, PollBatch, Sequenced};
