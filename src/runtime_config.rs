// =============================================================================
// Runtime Configuration — relay server and client settings with atomic save
// =============================================================================
//
// One JSON document configures both halves of candlewire: the `server`
// section drives tick ingestion and the HTTP surface, the `client` section
// drives the primary transport, the SSE fallback and the health monitor.
//
// Every field carries a serde default so a partial (or empty) file loads.
// A handful of environment variables override the file after loading:
// `PORT`, `WORKERS` and `RELAY_SYMBOLS`.
//
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{TickSourceKind, TransportKind};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_intervals_sec() -> Vec<u64> {
    vec![60, 300]
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_candles() -> usize {
    500
}

fn default_simulated_tick_ms() -> u64 {
    1000
}

fn default_replay_capacity() -> usize {
    1024
}

fn default_long_poll_wait_ms() -> u64 {
    25_000
}

fn default_origin() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_transport_path() -> String {
    "/socket.io".to_string()
}

fn default_transports() -> Vec<TransportKind> {
    vec![TransportKind::Polling]
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_reconnection_attempts() -> u32 {
    10
}

fn default_reconnection_delay_ms() -> u64 {
    1000
}

fn default_reconnection_delay_max_ms() -> u64 {
    5000
}

fn default_randomization_factor() -> f64 {
    0.5
}

fn default_sse_path() -> String {
    "/api/sse/trading".to_string()
}

fn default_fallback_base_delay_ms() -> u64 {
    1000
}

fn default_fallback_cap_delay_ms() -> u64 {
    30_000
}

fn default_fallback_max_attempts() -> u32 {
    5
}

fn default_health_path() -> String {
    "/api/health".to_string()
}

fn default_monitor_interval_ms() -> u64 {
    5000
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

// =============================================================================
// ServerConfig
// =============================================================================

/// Settings for one serving process (primary or worker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Listen port shared by every process in the fleet.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Worker count override. `None` means `min(4, cores)`.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Symbols every process subscribes to upstream.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Candle intervals maintained per symbol, in seconds.
    #[serde(default = "default_intervals_sec")]
    pub intervals_sec: Vec<u64>,

    /// Rolling window length per (symbol, interval).
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,

    #[serde(default)]
    pub tick_source: TickSourceKind,

    /// Period of the simulated tick generator.
    #[serde(default = "default_simulated_tick_ms")]
    pub simulated_tick_ms: u64,

    /// Events retained for long-poll clients.
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,

    /// Upper bound on how long one long-poll request is held open.
    #[serde(default = "default_long_poll_wait_ms")]
    pub long_poll_wait_ms: u64,

    /// Mount point of the primary streaming endpoint.
    #[serde(default = "default_transport_path")]
    pub stream_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: default_port(),
            workers: None,
            symbols: default_symbols(),
            intervals_sec: default_intervals_sec(),
            max_candles: default_max_candles(),
            tick_source: TickSourceKind::default(),
            simulated_tick_ms: default_simulated_tick_ms(),
            replay_capacity: default_replay_capacity(),
            long_poll_wait_ms: default_long_poll_wait_ms(),
            stream_path: default_transport_path(),
        }
    }
}

impl ServerConfig {
    pub fn long_poll_wait(&self) -> Duration {
        Duration::from_millis(self.long_poll_wait_ms)
    }
}

// =============================================================================
// Client sections
// =============================================================================

/// Primary transport options. Field names follow the named reconnection
/// options `{ timeout, reconnectionAttempts, reconnectionDelay,
/// reconnectionDelayMax, randomizationFactor }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportOptions {
    #[serde(default = "default_transport_path")]
    pub path: String,

    /// Allowed transports, tried in order. Pinned to polling by default.
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,

    /// Per-attempt connect timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failed attempts before giving up.
    #[serde(default = "default_reconnection_attempts")]
    pub reconnection_attempts: u32,

    #[serde(default = "default_reconnection_delay_ms")]
    pub reconnection_delay_ms: u64,

    #[serde(default = "default_reconnection_delay_max_ms")]
    pub reconnection_delay_max_ms: u64,

    /// Jitter applied to each retry delay, in `[0, 1]`.
    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            path: default_transport_path(),
            transports: default_transports(),
            timeout_ms: default_timeout_ms(),
            reconnection_attempts: default_reconnection_attempts(),
            reconnection_delay_ms: default_reconnection_delay_ms(),
            reconnection_delay_max_ms: default_reconnection_delay_max_ms(),
            randomization_factor: default_randomization_factor(),
        }
    }
}

impl TransportOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// SSE fallback options (linear backoff, capped attempts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackOptions {
    #[serde(default = "default_sse_path")]
    pub path: String,

    #[serde(default = "default_fallback_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_fallback_cap_delay_ms")]
    pub cap_delay_ms: u64,

    #[serde(default = "default_fallback_max_attempts")]
    pub max_attempts: u32,

    /// Keep and resend cookies (credentialed requests).
    #[serde(default = "default_true")]
    pub with_credentials: bool,

    /// Extra request headers, e.g. an `Authorization` bearer.
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            path: default_sse_path(),
            base_delay_ms: default_fallback_base_delay_ms(),
            cap_delay_ms: default_fallback_cap_delay_ms(),
            max_attempts: default_fallback_max_attempts(),
            with_credentials: true,
            extra_headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorOptions {
    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            health_path: default_health_path(),
            interval_ms: default_monitor_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Origin of the relay, e.g. `http://127.0.0.1:8000`.
    #[serde(default = "default_origin")]
    pub origin: String,

    #[serde(default)]
    pub transport: TransportOptions,

    #[serde(default)]
    pub fallback: FallbackOptions,

    #[serde(default)]
    pub monitor: MonitorOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            transport: TransportOptions::default(),
            fallback: FallbackOptions::default(),
            monitor: MonitorOptions::default(),
        }
    }
}

// =============================================================================
// RelayConfig
// =============================================================================

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

impl RelayConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read relay config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse relay config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.server.symbols,
            tick_source = %config.server.tick_source,
            "relay config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise relay config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "relay config saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("PORT") {
            match raw.trim().parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(e) => warn!(value = %raw, error = %e, "ignoring invalid PORT"),
            }
        }

        if let Some(raw) = lookup("WORKERS") {
            match raw.trim().parse::<usize>() {
                Ok(0) => self.server.workers = None,
                Ok(n) => self.server.workers = Some(n),
                Err(e) => warn!(value = %raw, error = %e, "ignoring invalid WORKERS"),
            }
        }

        if let Some(raw) = lookup("RELAY_SYMBOLS") {
            let symbols: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                self.server.symbols = symbols;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.server.workers, None);
        assert_eq!(cfg.server.intervals_sec, vec![60, 300]);
        assert_eq!(cfg.client.transport.path, "/socket.io");
        assert_eq!(cfg.client.transport.transports, vec![TransportKind::Polling]);
        assert_eq!(cfg.client.fallback.path, "/api/sse/trading");
        assert!(cfg.client.fallback.with_credentials);
        assert!((cfg.client.transport.randomization_factor - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RelayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.server.max_candles, 500);
        assert_eq!(cfg.server.tick_source, TickSourceKind::Simulated);
        assert_eq!(cfg.client.transport.reconnection_attempts, 10);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "server": { "tick_source": "binance", "symbols": ["SOLUSDT"] },
            "client": { "transport": { "transports": ["websocket", "polling"] } }
        }"#;
        let cfg: RelayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.server.tick_source, TickSourceKind::Binance);
        assert_eq!(cfg.server.symbols, vec!["SOLUSDT"]);
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(
            cfg.client.transport.transports,
            vec![TransportKind::WebSocket, TransportKind::Polling]
        );
        assert_eq!(cfg.client.transport.timeout_ms, 20_000);
    }

    #[test]
    fn env_overrides_port_workers_and_symbols() {
        let mut cfg = RelayConfig::default();
        cfg.apply_overrides(env(&[
            ("PORT", "9100"),
            ("WORKERS", "3"),
            ("RELAY_SYMBOLS", " btcusdt, ,xrpusdt"),
        ]));
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.workers, Some(3));
        assert_eq!(cfg.server.symbols, vec!["BTCUSDT", "XRPUSDT"]);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut cfg = RelayConfig::default();
        cfg.apply_overrides(env(&[("PORT", "eighty"), ("WORKERS", "0")]));
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.server.workers, None);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = std::env::temp_dir().join(format!("candlewire-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relay_config.json");

        let mut cfg = RelayConfig::default();
        cfg.server.symbols = vec!["ADAUSDT".into()];
        cfg.client.fallback.max_attempts = 9;
        cfg.save(&path).unwrap();

        let loaded = RelayConfig::load(&path).unwrap();
        assert_eq!(loaded.server.symbols, vec!["ADAUSDT"]);
        assert_eq!(loaded.client.fallback.max_attempts, 9);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
