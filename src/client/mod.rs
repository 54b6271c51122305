pub mod backoff;
pub mod chart;
pub mod fallback;
pub mod monitor;
pub mod sse;
pub mod transport;

pub use chart::ChartFeed;
pub use fallback::{FallbackStreamClient, ListenerId};
pub use monitor::{ConnectionStatusMonitor, HealthStatus};
pub use transport::{Dialer, Endpoint, EventStream, NetworkDialer, TransportClient};
