// =============================================================================
// SSE Fallback Client — one-way push channel with linear backoff
// =============================================================================
//
// Used when the primary transport is blocked by an intermediary. Opens
// `GET {origin}/api/sse/trading` with `Accept: text/event-stream`, decodes
// frames incrementally and dispatches each payload to the listeners
// registered for its `EventKind`.
//
// Reconnection: every failed open and every lost stream counts as one failed
// attempt; a successful open resets the count. Retry N waits
// `min(base * N, cap)`. After `max_attempts` consecutive failures the client
// stops for good and stays Disconnected until `connect()` is called again.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::header::ACCEPT;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::LinearBackoff;
use super::sse::{SseDecoder, SseFrame};
use crate::runtime_config::FallbackOptions;
use crate::stream::{EventKind, StreamEvent};
use crate::types::{ConnectionPhase, ConnectionState};

pub type Listener = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Handle returned by [`FallbackStreamClient::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(ListenerId, Listener)>>,
}

struct Shared {
    listeners: RwLock<ListenerTable>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    /// Parse one frame and invoke the listeners for its kind. Returns the
    /// number of listeners called.
    fn dispatch(&self, frame: &SseFrame) -> usize {
        let event = match StreamEvent::from_json(&frame.data) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, event = ?frame.event, "Dropping malformed SSE payload");
                return 0;
            }
        };

        // `message` is the generic channel and may carry any payload kind.
        let named = frame
            .event
            .as_deref()
            .filter(|name| *name != EventKind::Message.as_str());
        if let Some(name) = named {
            if EventKind::parse(name) != Some(event.kind()) {
                warn!(
                    event = name,
                    payload = event.kind().as_str(),
                    "Dropping SSE frame whose event name does not match its payload"
                );
                return 0;
            }
        }

        let targets: Vec<Listener> = self
            .listeners
            .read()
            .by_kind
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in &targets {
            listener(&event);
        }
        targets.len()
    }
}

struct DriverHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct FallbackStreamClient {
    url: String,
    options: FallbackOptions,
    http: reqwest::Client,
    shared: Arc<Shared>,
    driver: Mutex<Option<DriverHandle>>,
}

impl FallbackStreamClient {
    pub fn new(origin: &str, options: FallbackOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(options.with_credentials)
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build SSE HTTP client")?;

        let url = format!(
            "{}/{}",
            origin.trim_end_matches('/'),
            options.path.trim_start_matches('/')
        );
        let (state, _) = watch::channel(ConnectionState::default());

        Ok(Self {
            url,
            options,
            http,
            shared: Arc::new(Shared {
                listeners: RwLock::new(ListenerTable::default()),
                state,
            }),
            driver: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    // ── Listeners ───────────────────────────────────────────────────────

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let mut table = self.shared.listeners.write();
        table.next_id += 1;
        let id = ListenerId(table.next_id);
        table
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if the id was unknown.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut table = self.shared.listeners.write();
        for list in table.by_kind.values_mut() {
            if let Some(pos) = list.iter().position(|(lid, _)| *lid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.shared
            .listeners
            .read()
            .by_kind
            .get(&kind)
            .map_or(0, Vec::len)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Open the stream, tearing down any existing connection first.
    pub fn connect(&self) {
        let mut driver = self.driver.lock();
        if let Some(old) = driver.take() {
            old.cancel.cancel();
            debug!("Replacing existing SSE connection");
        }

        self.shared.state.send_modify(|s| {
            s.phase = ConnectionPhase::Connecting;
        });

        let cancel = CancellationToken::new();
        let ctx = DriverContext {
            url: self.url.clone(),
            http: self.http.clone(),
            options: self.options.clone(),
            backoff: LinearBackoff::from_options(&self.options),
            shared: self.shared.clone(),
            cancel: cancel.clone(),
        };
        info!(url = %self.url, "SSE fallback connecting");
        let task = tokio::spawn(run_driver(ctx));
        *driver = Some(DriverHandle { cancel, task });
    }

    /// Close the stream and cancel any pending retry. Idempotent.
    pub fn disconnect(&self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.cancel.cancel();
            info!("SSE fallback disconnected by caller");
        }
        self.shared.state.send_if_modified(|s| {
            if s.phase == ConnectionPhase::Disconnected {
                return false;
            }
            s.phase = ConnectionPhase::Disconnected;
            true
        });
    }

    /// Whether a driver task is still running.
    pub fn is_active(&self) -> bool {
        self.driver
            .lock()
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }
}

impl Drop for FallbackStreamClient {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.get_mut().take() {
            handle.cancel.cancel();
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

struct DriverContext {
    url: String,
    http: reqwest::Client,
    options: FallbackOptions,
    backoff: LinearBackoff,
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

    async fn open(&self, last_event_id: Option<&str>) -> Result<reqwest::Response> {
        let mut req = self.http.get(&self.url).header(ACCEPT, "text/event-stream");
        for (name, value) in &self.options.extra_headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(id) = last_event_id {
            req = req.header("Last-Event-ID", id);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?;
        if !resp.status().is_success() {
            bail!("GET {} returned {}", self.url, resp.status());
        }
        Ok(resp)
    }

    /// Read frames until the stream drops. `None` on cancel, otherwise the
    /// reason the stream ended.
    async fn read(&self, resp: reqwest::Response, last_event_id: &mut Option<String>) -> Option<anyhow::Error> {
        let mut body = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                chunk = body.next() => chunk,
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Some(anyhow::Error::new(e).context("SSE read failed")),
                None => return Some(anyhow::anyhow!("SSE stream closed by server")),
            };
            for frame in decoder.feed(&chunk) {
                if let Some(id) = &frame.id {
                    *last_event_id = Some(id.clone());
                }
                self.shared.dispatch(&frame);
            }
        }
    }
}

async fn run_driver(ctx: DriverContext) {
    let max_attempts = ctx.options.max_attempts.max(1);
    let mut failures: u32 = 0;
    let mut last_event_id: Option<String> = None;

    loop {
        let opened = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            opened = ctx.open(last_event_id.as_deref()) => opened,
        };

        let err = match opened {
            Ok(resp) => {
                failures = 0;
                ctx.publish(|s| {
                    s.phase = ConnectionPhase::Connected;
                    s.attempt_count = 0;
                    s.last_error = None;
                });
                info!(url = %ctx.url, "SSE fallback connected");
                match ctx.read(resp, &mut last_event_id).await {
                    Some(e) => e,
                    None => return,
                }
            }
            Err(e) => e,
        };

        failures += 1;
        let message = format!("{err:#}");

        if failures >= max_attempts {
            error!(
                attempts = failures,
                error = %message,
                "SSE fallback giving up after reaching max attempts"
            );
            ctx.publish(|s| {
                s.phase = ConnectionPhase::Disconnected;
                s.attempt_count = failures;
                s.last_error = Some(message);
            });
            return;
        }

        let delay = ctx.backoff.delay(failures);
        warn!(
            attempt = failures,
            max = max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "SSE fallback error, retrying"
        );
        ctx.publish(|s| {
            s.phase = ConnectionPhase::Reconnecting;
            s.attempt_count = failures;
            s.last_error = Some(message);
        });

        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        ctx.publish(|s| s.phase = ConnectionPhase::Connecting);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
