pub mod candle_aggregator;
pub mod candle_store;
pub mod tick_source;

// Re-export the candle types for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_aggregator::{bucket_start, fold, Candle, Folded, Tick};
pub use candle_store::{CandleKey, CandleStore, CandleUpdate};
