// =============================================================================
// Shared types used across the candlewire relay and its clients
// =============================================================================

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a streaming client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl Default for ConnectionPhase {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Observable state of one client transport.
///
/// Only the owning client writes it; everyone else holds a
/// `watch::Receiver<ConnectionState>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Consecutive failed attempts. Reset only by a successful connect.
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }
}

/// Wire transports offered by the primary streaming endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// HTTP long-polling. Never upgrades, so it survives proxies that strip
    /// `Upgrade` headers.
    Polling,
    #[serde(rename = "websocket")]
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Polling => write!(f, "polling"),
            Self::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Tri-state health signal surfaced to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSignal {
    Healthy,
    Degraded,
    Down,
}

impl HealthSignal {
    /// Combine transport liveness and API reachability.
    pub fn from_parts(transport_up: bool, api_up: bool) -> Self {
        match (transport_up, api_up) {
            (true, true) => Self::Healthy,
            (false, false) => Self::Down,
            _ => Self::Degraded,
        }
    }
}

impl std::fmt::Display for HealthSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Where a server process gets its ticks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickSourceKind {
    /// Seeded random walk, for the trading simulator.
    Simulated,
    /// Binance spot `aggTrade` WebSocket stream.
    Binance,
}

impl Default for TickSourceKind {
    fn default() -> Self {
        Self::Simulated
    }
}

impl std::fmt::Display for TickSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulated => write!(f, "simulated"),
            Self::Binance => write!(f, "binance"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_signal_truth_table() {
        assert_eq!(HealthSignal::from_parts(true, true), HealthSignal::Healthy);
        assert_eq!(HealthSignal::from_parts(true, false), HealthSignal::Degraded);
        assert_eq!(HealthSignal::from_parts(false, true), HealthSignal::Degraded);
        assert_eq!(HealthSignal::from_parts(false, false), HealthSignal::Down);
    }

    #[test]
    fn transport_kind_uses_wire_names() {
        let json = serde_json::to_string(&vec![TransportKind::Polling, TransportKind::WebSocket])
            .unwrap();
        assert_eq!(json, r#"["polling","websocket"]"#);
    }
}
