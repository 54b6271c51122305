// =============================================================================
// Primary Transport Client — long-lived push connection with reconnection
// =============================================================================
//
// One `TransportClient` owns at most one background driver task. The driver
// opens a session (trying each allowed transport in order, each bounded by
// the connect timeout), pumps inbound events into a broadcast channel, and on
// loss or failure schedules the next attempt with jittered exponential
// backoff.
//
// State machine:
//   Disconnected --connect--> Connecting --ok--> Connected
//   Connecting --fail--> Reconnecting --delay--> Connecting
//   Connected --lost--> Reconnecting
//   any --disconnect--> Disconnected
//   Connecting --fail (cap reached)--> Disconnected (terminal, last_error set)
//
// `connect()` is single-flight: while a driver is Connecting, Connected or
// Reconnecting, further calls are no-ops.
//
// Driver state writes go through `send_if_modified` and are dropped once the
// driver's token is cancelled, so a stale driver can never overwrite the
// state published by `disconnect()` or by a newer driver.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::JitteredBackoff;
use crate::runtime_config::TransportOptions;
use crate::stream::{PollBatch, StreamEvent};
use crate::types::{ConnectionPhase, ConnectionState, TransportKind};

const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Inbound events of one open session. The stream ends (or yields an error)
/// when the session is lost.
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

// =============================================================================
// Endpoint
// =============================================================================

/// Server origin plus the mount path of the streaming endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    origin: String,
    path: String,
}

impl Endpoint {
    pub fn new(origin: impl Into<String>, path: impl Into<String>) -> Self {
        let origin = origin.into().trim_end_matches('/').to_string();
        let path = path.into();
        let path = format!("/{}", path.trim_matches('/'));
        Self { origin, path }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn polling_url(&self) -> String {
        format!("{}{}/polling", self.origin, self.path)
    }

    pub fn websocket_url(&self) -> Result<String> {
        let base = if let Some(rest) = self.origin.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.origin.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if self.origin.starts_with("ws://") || self.origin.starts_with("wss://") {
            self.origin.clone()
        } else {
            bail!("unsupported origin scheme: {}", self.origin);
        };
        Ok(format!("{base}{}/websocket", self.path))
    }
}

// =============================================================================
// Dialer
// =============================================================================

/// Opens one session over a given transport.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, endpoint: &Endpoint, kind: TransportKind) -> BoxFuture<'static, Result<EventStream>>;
}

/// Real network dialer: WebSocket via tokio-tungstenite, polling via reqwest.
#[derive(Clone)]
pub struct NetworkDialer {
    http: reqwest::Client,
    poll_wait: Duration,
}

impl NetworkDialer {
    pub fn new(poll_wait: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, poll_wait })
    }
}

impl Dialer for NetworkDialer {
    fn dial(&self, endpoint: &Endpoint, kind: TransportKind) -> BoxFuture<'static, Result<EventStream>> {
        match kind {
            TransportKind::WebSocket => {
                let url = endpoint.websocket_url();
                async move { open_websocket(url?).await }.boxed()
            }
            TransportKind::Polling => {
                let http = self.http.clone();
                let url = endpoint.polling_url();
                let wait = self.poll_wait;
                async move { open_polling(http, url, wait).await }.boxed()
            }
        }
    }
}

async fn open_websocket(url: String) -> Result<EventStream> {
    let (ws, _resp) = connect_async(url.as_str())
        .await
        .with_context(|| format!("WebSocket connect to {url} failed"))?;
    debug!(url = %url, "WebSocket session open");

    let events = stream::unfold(Some(ws), |ws| async move {
        let mut ws = ws?;
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match StreamEvent::from_json(&text) {
                    Ok(event) => return Some((Ok(event), Some(ws))),
                    Err(e) => warn!(error = %e, "Skipping malformed stream frame"),
                },
                Some(Ok(Message::Close(_))) | None => return None,
                // Pings are answered by tungstenite while reading.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some((Err(anyhow!(e).context("WebSocket read failed")), None)),
            }
        }
    });
    Ok(events.boxed())
}

struct PollState {
    http: reqwest::Client,
    url: String,
    cursor: u64,
    wait: Duration,
    pending: std::collections::VecDeque<StreamEvent>,
    failed: bool,
}

async fn poll_once(http: &reqwest::Client, url: &str, cursor: Option<u64>, wait: Duration) -> Result<PollBatch> {
    let mut req = http
        .get(url)
        .query(&[("wait_ms", wait.as_millis() as u64)])
        .timeout(wait + Duration::from_secs(10));
    if let Some(cursor) = cursor {
        req = req.query(&[("cursor", cursor)]);
    }
    let resp = req.send().await.with_context(|| format!("GET {url} failed"))?;
    if !resp.status().is_success() {
        bail!("GET {url} returned {}", resp.status());
    }
    resp.json::<PollBatch>()
        .await
        .context("Failed to decode poll batch")
}

/// Handshake (cursor-less, non-blocking poll) then an endless long-poll loop.
async fn open_polling(http: reqwest::Client, url: String, wait: Duration) -> Result<EventStream> {
    let handshake = poll_once(&http, &url, None, Duration::ZERO).await?;
    debug!(url = %url, cursor = handshake.cursor, "Polling session open");

    let state = PollState {
        http,
        url,
        cursor: handshake.cursor,
        wait,
        pending: handshake.events.into(),
        failed: false,
    };

    let events = stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.failed {
                return None;
            }
            match poll_once(&st.http, &st.url, Some(st.cursor), st.wait).await {
                Ok(batch) => {
                    st.cursor = batch.cursor;
                    st.pending.extend(batch.events);
                }
                Err(e) => {
                    st.failed = true;
                    return Some((Err(e), st));
                }
            }
        }
    });
    Ok(events.boxed())
}

// =============================================================================
// TransportClient
// =============================================================================

struct Shared {
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<StreamEvent>,
}

pub struct TransportClient {
    endpoint: Endpoint,
    options: TransportOptions,
    backoff: JitteredBackoff,
    dialer: Arc<dyn Dialer>,
    shared: Arc<Shared>,
    /// Cancels the running driver task, if any.
    driver: Mutex<Option<CancellationToken>>,
}

impl TransportClient {
    pub fn new(origin: impl Into<String>, options: TransportOptions, dialer: Arc<dyn Dialer>) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            endpoint: Endpoint::new(origin, options.path.clone()),
            backoff: JitteredBackoff::from_options(&options),
            options,
            dialer,
            shared: Arc::new(Shared { state, events }),
            driver: Mutex::new(None),
        }
    }

    /// Client backed by the real network dialer.
    pub fn with_network(origin: impl Into<String>, options: TransportOptions) -> Result<Self> {
        // Long polls are released well before the connect timeout.
        let poll_wait = options.timeout() / 2;
        let dialer = Arc::new(NetworkDialer::new(poll_wait)?);
        Ok(Self::new(origin, options, dialer))
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Start connecting unless an attempt is already in flight or the client
    /// is already connected.
    pub fn connect(&self) {
        let mut driver = self.driver.lock();

        let phase = self.shared.state.borrow().phase;
        if phase != ConnectionPhase::Disconnected {
            debug!(%phase, "connect() ignored");
            return;
        }

        if let Some(old) = driver.take() {
            old.cancel();
        }

        self.shared.state.send_modify(|s| s.phase = ConnectionPhase::Connecting);

        let cancel = CancellationToken::new();
        let ctx = DriverContext {
            endpoint: self.endpoint.clone(),
            transports: self.options.transports.clone(),
            timeout: self.options.timeout(),
            max_attempts: self.options.reconnection_attempts.max(1),
            backoff: self.backoff.clone(),
            dialer: self.dialer.clone(),
            shared: self.shared.clone(),
            cancel: cancel.clone(),
        };
        info!(origin = %self.endpoint.origin(), "Transport connecting");
        tokio::spawn(run_driver(ctx));
        *driver = Some(cancel);
    }

    /// `connect()` only if the client is fully disconnected.
    pub fn ensure_connected(&self) {
        if self.state().phase == ConnectionPhase::Disconnected {
            self.connect();
        }
    }

    /// Stop the driver and any pending retry. Idempotent.
    pub fn disconnect(&self) {
        if let Some(cancel) = self.driver.lock().take() {
            cancel.cancel();
            info!("Transport disconnected by caller");
        }
        self.shared.state.send_if_modified(|s| {
            if s.phase == ConnectionPhase::Disconnected {
                return false;
            }
            s.phase = ConnectionPhase::Disconnected;
            true
        });
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        if let Some(cancel) = self.driver.get_mut().take() {
            cancel.cancel();
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

struct DriverContext {
    endpoint: Endpoint,
    transports: Vec<TransportKind>,
    timeout: Duration,
    max_attempts: u32,
    backoff: JitteredBackoff,
    dialer: Arc<dyn Dialer>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl DriverContext {
    fn publish(&self, f: impl FnOnce(&mut ConnectionState)) {
        let cancel = &self.cancel;
        self.shared.state.send_if_modified(|s| {
            if cancel.is_cancelled() {
                return false;
            }
            f(s);
            true
        });
    }

    /// Sleep for `delay`; `false` if cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// One attempt: every allowed transport in order. `None` on cancel.
    async fn open_session(&self) -> Option<Result<(TransportKind, EventStream)>> {
        let mut last_err = anyhow!("no transports configured");
        for &kind in &self.transports {
            let dial = tokio::time::timeout(self.timeout, self.dialer.dial(&self.endpoint, kind));
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                outcome = dial => outcome,
            };
            match outcome {
                Ok(Ok(events)) => return Some(Ok((kind, events))),
                Ok(Err(e)) => {
                    debug!(transport = %kind, error = %e, "Transport attempt failed");
                    last_err = e;
                }
                Err(_) => {
                    debug!(transport = %kind, "Transport attempt timed out");
                    last_err = anyhow!("{kind} connect timed out after {:?}", self.timeout);
                }
            }
        }
        Some(Err(last_err))
    }

    /// Forward events until the session drops. `None` on cancel, otherwise
    /// the reason the session ended.
    async fn pump(&self, mut events: EventStream) -> Option<String> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    // No subscribers is fine.
                    let _ = self.shared.events.send(event);
                }
                Some(Err(e)) => return Some(format!("{e:#}")),
                None => return Some("session closed by server".to_string()),
            }
        }
    }
}

async fn run_driver(ctx: DriverContext) {
    let mut failures: u32 = 0;

    loop {
        let Some(outcome) = ctx.open_session().await else {
            return;
        };

        match outcome {
            Ok((kind, events)) => {
                failures = 0;
                ctx.publish(|s| {
                    s.phase = ConnectionPhase::Connected;
                    s.attempt_count = 0;
                    s.last_error = None;
                });
                info!(transport = %kind, "Transport connected");

                let Some(reason) = ctx.pump(events).await else {
                    return;
                };
                warn!(reason = %reason, "Transport connection lost, reconnecting");
                ctx.publish(|s| {
                    s.phase = ConnectionPhase::Reconnecting;
                    s.last_error = Some(reason);
                });
                if !ctx.pause(ctx.backoff.delay(0)).await {
                    return;
                }
            }
            Err(e) => {
                failures += 1;
                let message = format!("{e:#}");

                if failures >= ctx.max_attempts {
                    error!(
                        attempts = failures,
                        error = %message,
                        "Transport giving up after reaching the reconnection cap"
                    );
                    ctx.publish(|s| {
                        s.phase = ConnectionPhase::Disconnected;
                        s.attempt_count = s.attempt_count.saturating_add(1);
                        s.last_error = Some(message);
                    });
                    return;
                }

                let delay = ctx.backoff.delay(failures - 1);
                warn!(
                    attempt = failures,
                    max = ctx.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Transport attempt failed, retrying"
                );
                ctx.publish(|s| {
                    s.phase = ConnectionPhase::Reconnecting;
                    s.attempt_count = s.attempt_count.saturating_add(1);
                    s.last_error = Some(message);
                });
                if !ctx.pause(delay).await {
                    return;
                }
            }
        }

        ctx.publish(|s| s.phase = ConnectionPhase::Connecting);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::stream::PriceUpdate;

    fn price(p: f64) -> StreamEvent {
        StreamEvent::PriceUpdate(PriceUpdate {
            symbol: "BTCUSDT".into(),
            price: p,
            timestamp: 0,
        })
    }

    fn options(attempts: u32) -> TransportOptions {
        TransportOptions {
            reconnection_attempts: attempts,
            reconnection_delay_ms: 100,
            reconnection_delay_max_ms: 1000,
            timeout_ms: 500,
            ..TransportOptions::default()
        }
    }

    /// Dialer whose behaviour is chosen per call number (1-based).
    struct ScriptedDialer {
        calls: AtomicU32,
        script: Box<dyn Fn(u32) -> Script + Send + Sync>,
    }

    enum Script {
        Fail,
        Hang,
        /// Yield the events then stay open.
        Open(Vec<StreamEvent>),
        /// Yield the events then end the session.
        OpenThenDrop(Vec<StreamEvent>),
    }

    impl ScriptedDialer {
        fn new(script: impl Fn(u32) -> Script + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script: Box::new(script),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Dialer for ScriptedDialer {
        fn dial(&self, _endpoint: &Endpoint, _kind: TransportKind) -> BoxFuture<'static, Result<EventStream>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match (self.script)(n) {
                Script::Fail => async { Err(anyhow!("connection refused")) }.boxed(),
                Script::Hang => futures_util::future::pending().boxed(),
                Script::Open(events) => {
                    let s = stream::iter(events.into_iter().map(Ok)).chain(stream::pending());
                    async move { Ok(s.boxed()) }.boxed()
                }
                Script::OpenThenDrop(events) => {
                    let s = stream::iter(events.into_iter().map(Ok));
                    async move { Ok(s.boxed()) }.boxed()
                }
            }
        }
    }

    #[test]
    fn endpoint_urls() {
        let ep = Endpoint::new("http://localhost:8000/", "socket.io/");
        assert_eq!(ep.polling_url(), "http://localhost:8000/socket.io/polling");
        assert_eq!(
            ep.websocket_url().unwrap(),
            "ws://localhost:8000/socket.io/websocket"
        );
        let tls = Endpoint::new("https://relay.example", "/socket.io");
        assert_eq!(
            tls.websocket_url().unwrap(),
            "wss://relay.example/socket.io/websocket"
        );
        assert!(Endpoint::new("ftp://x", "/p").websocket_url().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_single_flight() {
        let dialer = ScriptedDialer::new(|_| Script::Hang);
        let client = TransportClient::new("http://test", options(3), dialer.clone());

        for _ in 0..10 {
            client.connect();
            client.ensure_connected();
        }
        assert_eq!(client.state().phase, ConnectionPhase::Connecting);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dialer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_exactly_the_cap() {
        let dialer = ScriptedDialer::new(|_| Script::Fail);
        let client = TransportClient::new("http://test", options(4), dialer.clone());
        let mut rx = client.watch_state();

        client.connect();
        let terminal = rx
            .wait_for(|s| s.phase == ConnectionPhase::Disconnected)
            .await
            .unwrap()
            .clone();

        assert_eq!(dialer.calls(), 4);
        assert_eq!(terminal.attempt_count, 4);
        assert!(terminal.last_error.unwrap().contains("connection refused"));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(dialer.calls(), 4, "no attempts after giving up");
    }

    #[tokio::test(start_paused = true)]
    async fn manual_connect_after_giving_up_starts_a_new_cycle() {
        let dialer = ScriptedDialer::new(|_| Script::Fail);
        let client = TransportClient::new("http://test", options(2), dialer.clone());
        let mut rx = client.watch_state();

        client.connect();
        rx.wait_for(|s| s.phase == ConnectionPhase::Disconnected).await.unwrap();
        assert_eq!(dialer.calls(), 2);

        client.ensure_connected();
        rx.wait_for(|s| s.phase == ConnectionPhase::Disconnected && s.attempt_count == 4)
            .await
            .unwrap();
        assert_eq!(dialer.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_attempt_count_and_forwards_events() {
        let dialer = ScriptedDialer::new(|n| {
            if n <= 2 {
                Script::Fail
            } else {
                Script::Open(vec![price(42.0)])
            }
        });
        let client = TransportClient::new("http://test", options(5), dialer.clone());
        let mut events = client.subscribe_events();
        let mut rx = client.watch_state();

        client.connect();
        let state = rx
            .wait_for(|s| s.phase == ConnectionPhase::Connected)
            .await
            .unwrap()
            .clone();
        assert_eq!(state.attempt_count, 0);
        assert_eq!(state.last_error, None);
        assert_eq!(dialer.calls(), 3);
        assert_eq!(events.recv().await.unwrap(), price(42.0));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_session_reconnects() {
        let dialer = ScriptedDialer::new(|n| {
            if n == 1 {
                Script::OpenThenDrop(vec![price(1.0)])
            } else {
                Script::Open(vec![price(2.0)])
            }
        });
        let client = TransportClient::new("http://test", options(3), dialer.clone());
        let mut events = client.subscribe_events();

        client.connect();
        assert_eq!(events.recv().await.unwrap(), price(1.0));
        assert_eq!(events.recv().await.unwrap(), price(2.0));
        assert_eq!(dialer.calls(), 2);
        assert_eq!(client.state().phase, ConnectionPhase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_dial_is_bounded_by_timeout() {
        let dialer = ScriptedDialer::new(|_| Script::Hang);
        let client = TransportClient::new("http://test", options(2), dialer.clone());
        let mut rx = client.watch_state();

        client.connect();
        let terminal = rx
            .wait_for(|s| s.phase == ConnectionPhase::Disconnected)
            .await
            .unwrap()
            .clone();
        assert_eq!(dialer.calls(), 2);
        assert!(terminal.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry() {
        let dialer = ScriptedDialer::new(|_| Script::Fail);
        let client = TransportClient::new("http://test", options(10), dialer.clone());
        let mut rx = client.watch_state();

        client.connect();
        rx.wait_for(|s| s.phase == ConnectionPhase::Reconnecting).await.unwrap();
        client.disconnect();
        client.disconnect();
        assert_eq!(client.state().phase, ConnectionPhase::Disconnected);

        let calls = dialer.calls();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(dialer.calls(), calls);
        assert_eq!(client.state().phase, ConnectionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_connected_is_noop_while_connected() {
        let dialer = ScriptedDialer::new(|_| Script::Open(vec![]));
        let client = TransportClient::new("http://test", options(3), dialer.clone());
        let mut rx = client.watch_state();

        client.connect();
        rx.wait_for(|s| s.phase == ConnectionPhase::Connected).await.unwrap();
        client.ensure_connected();
        client.connect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dialer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_stops_the_driver() {
        let dialer = ScriptedDialer::new(|_| Script::Fail);
        let client = TransportClient::new("http://test", options(10), dialer.clone());
        let mut rx = client.watch_state();

        client.connect();
        rx.wait_for(|s| s.phase == ConnectionPhase::Reconnecting).await.unwrap();
        drop(client);

        let calls = dialer.calls();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(dialer.calls(), calls);
    }
}
