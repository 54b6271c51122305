// =============================================================================
// Connection Status Monitor — tri-state health of transport + API
// =============================================================================
//
// Every `interval_ms` the monitor samples the primary transport's phase and
// probes `GET {origin}/api/health` with a short timeout, then publishes a
// `HealthStatus` on a watch channel:
//
//   transport up + API up   → Healthy
//   exactly one up          → Degraded
//   neither                 → Down
//
// The monitor never retries anything on its own; `reconnect()` simply asks
// the transport to connect if it is fully disconnected.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::transport::TransportClient;
use crate::runtime_config::MonitorOptions;
use crate::types::{ConnectionPhase, HealthSignal};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub signal: HealthSignal,
    pub transport_phase: ConnectionPhase,
    pub api_reachable: bool,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    fn initial() -> Self {
        Self {
            signal: HealthSignal::Down,
            transport_phase: ConnectionPhase::Disconnected,
            api_reachable: false,
            checked_at: Utc::now(),
        }
    }
}

struct Probe {
    transport: Arc<TransportClient>,
    http: reqwest::Client,
    health_url: String,
    timeout: Duration,
    status: watch::Sender<HealthStatus>,
}

impl Probe {
    async fn api_reachable(&self) -> bool {
        match self.http.get(&self.health_url).timeout(self.timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(url = %self.health_url, error = %e, "Health probe failed");
                false
            }
        }
    }

    async fn check(&self) -> HealthStatus {
        let api_reachable = self.api_reachable().await;
        let transport_phase = self.transport.state().phase;
        let status = HealthStatus {
            signal: HealthSignal::from_parts(
                transport_phase == ConnectionPhase::Connected,
                api_reachable,
            ),
            transport_phase,
            api_reachable,
            checked_at: Utc::now(),
        };

        let previous = self.status.borrow().signal;
        if previous != status.signal {
            info!(
                from = ?previous,
                to = ?status.signal,
                transport = %transport_phase,
                api = api_reachable,
                "Connection health changed"
            );
        }
        self.status.send_replace(status.clone());
        status
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ConnectionStatusMonitor {
    probe: Arc<Probe>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl ConnectionStatusMonitor {
    pub fn new(transport: Arc<TransportClient>, origin: &str, options: &MonitorOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build health probe client")?;
        let health_url = format!(
            "{}/{}",
            origin.trim_end_matches('/'),
            options.health_path.trim_start_matches('/')
        );
        let (status, _) = watch::channel(HealthStatus::initial());

        Ok(Self {
            probe: Arc::new(Probe {
                transport,
                http,
                health_url,
                timeout: Duration::from_millis(options.probe_timeout_ms),
                status,
            }),
            interval: Duration::from_millis(options.interval_ms.max(1)),
            running: Mutex::new(None),
        })
    }

    pub fn health_url(&self) -> &str {
        &self.probe.health_url
    }

    pub fn status(&self) -> HealthStatus {
        self.probe.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<HealthStatus> {
        self.probe.status.subscribe()
    }

    /// Run one probe immediately and publish its result.
    pub async fn check_now(&self) -> HealthStatus {
        self.probe.check().await
    }

    /// Ask the transport to connect if it is fully disconnected.
    pub fn reconnect(&self) {
        self.probe.transport.ensure_connected();
    }

    /// Start the periodic probe loop. A no-op while it is already running;
    /// after `stop()` it starts a fresh loop.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }
        let probe = self.probe.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        probe.check().await;
                    }
                }
            }
            debug!("Health monitor stopped");
        });
        *running = Some(Running { cancel: token, task });
    }

    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
        }
    }
}

impl Drop for ConnectionStatusMonitor {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::TransportOptions;
    use axum::{routing::get, Router};

    fn closed_origin() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let origin = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        origin
    }

    async fn health_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/api/health", get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn monitor(transport_origin: &str, api_origin: &str) -> ConnectionStatusMonitor {
        let transport = Arc::new(
            TransportClient::with_network(transport_origin, TransportOptions::default()).unwrap(),
        );
        let opts = MonitorOptions {
            probe_timeout_ms: 1000,
            ..MonitorOptions::default()
        };
        ConnectionStatusMonitor::new(transport, api_origin, &opts).unwrap()
    }

    #[tokio::test]
    async fn nothing_reachable_is_down() {
        let origin = closed_origin();
        let m = monitor(&origin, &origin);
        assert_eq!(m.health_url(), format!("{origin}/api/health"));

        let status = m.check_now().await;
        assert_eq!(status.signal, HealthSignal::Down);
        assert!(!status.api_reachable);
        assert_eq!(status.transport_phase, ConnectionPhase::Disconnected);
        assert_eq!(m.status(), status);
    }

    #[tokio::test]
    async fn api_up_transport_down_is_degraded() {
        let api = health_server().await;
        let m = monitor(&closed_origin(), &api);
        let status = m.check_now().await;
        assert!(status.api_reachable);
        assert_eq!(status.signal, HealthSignal::Degraded);
    }

    #[tokio::test]
    async fn reconnect_kicks_a_disconnected_transport() {
        let origin = closed_origin();
        let m = monitor(&origin, &origin);
        m.reconnect();
        assert_ne!(m.probe.transport.state().phase, ConnectionPhase::Disconnected);
        m.probe.transport.disconnect();
    }

    #[tokio::test]
    async fn periodic_loop_publishes() {
        let api = health_server().await;
        let transport = Arc::new(
            TransportClient::with_network(closed_origin(), TransportOptions::default()).unwrap(),
        );
        let opts = MonitorOptions {
            interval_ms: 20,
            probe_timeout_ms: 1000,
            ..MonitorOptions::default()
        };
        let m = ConnectionStatusMonitor::new(transport, &api, &opts).unwrap();
        let mut rx = m.watch();
        m.start();
        m.start();

        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.signal == HealthSignal::Degraded),
        )
        .await
        .unwrap()
        .unwrap();
        m.stop();
    }

    #[tokio::test]
    async fn restart_after_stop_resumes_probing() {
        let api = health_server().await;
        let transport = Arc::new(
            TransportClient::with_network(closed_origin(), TransportOptions::default()).unwrap(),
        );
        let opts = MonitorOptions {
            interval_ms: 20,
            probe_timeout_ms: 1000,
            ..MonitorOptions::default()
        };
        let m = ConnectionStatusMonitor::new(transport, &api, &opts).unwrap();
        let mut rx = m.watch();

        m.start();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.signal == HealthSignal::Degraded),
        )
        .await
        .unwrap()
        .unwrap();
        m.stop();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stopped_at = m.status().checked_at;

        m.start();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.checked_at > stopped_at),
        )
        .await
        .expect("no probe after restart")
        .unwrap();
        m.stop();
    }
}
