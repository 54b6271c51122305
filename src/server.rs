// =============================================================================
// Serving Process — listener, tick sources, HTTP surface, graceful shutdown
// =============================================================================
//
// Every process in the fleet (primary and workers) runs exactly this: bind
// the shared port with SO_REUSEPORT so the kernel spreads connections across
// processes, start the upstream tick sources, and serve the router until the
// shutdown token fires.
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api;
use crate::app_state::AppState;
use crate::market_data::tick_source;
use crate::types::TickSourceKind;

const UPSTREAM_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Bind `host:port` so that several processes can listen on it at once.
pub async fn bind_shared(host: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("no address for {host}:{port}"))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .context("failed to create listen socket")?;

    socket
        .set_reuseaddr(true)
        .context("failed to set SO_REUSEADDR")?;
    #[cfg(unix)]
    socket
        .set_reuseport(true)
        .context("failed to set SO_REUSEPORT")?;

    socket
        .bind(addr)
        .with_context(|| format!("failed to bind {addr}"))?;
    socket
        .listen(1024)
        .with_context(|| format!("failed to listen on {addr}"))
}

/// Start one upstream feed per configured symbol.
pub fn spawn_tick_sources(state: &Arc<AppState>, cancel: &CancellationToken) -> JoinSet<()> {
    let mut tasks = JoinSet::new();

    for symbol in state.config.symbols.clone() {
        let state = state.clone();
        let cancel = cancel.clone();
        let kind = state.config.tick_source;

        match kind {
            TickSourceKind::Simulated => {
                let period = Duration::from_millis(state.config.simulated_tick_ms.max(1));
                tasks.spawn(tick_source::run_simulated_ticks(symbol, period, state, cancel));
            }
            TickSourceKind::Binance => {
                tasks.spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            result = tick_source::run_binance_trade_stream(&symbol, &state) => {
                                if let Err(e) = result {
                                    error!(symbol = %symbol, error = %e, "Trade stream error, reconnecting in 5s");
                                }
                            }
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(UPSTREAM_RECONNECT_DELAY) => {}
                        }
                    }
                });
            }
        }
    }

    tasks
}

/// Serve on an already-bound listener until `shutdown` fires.
pub async fn serve_on(listener: TcpListener, state: Arc<AppState>, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    let mut sources = spawn_tick_sources(&state, &shutdown);

    info!(
        addr = %addr,
        worker = ?state.worker_index,
        symbols = ?state.config.symbols,
        "Relay listening"
    );

    let app = api::router(state.clone());
    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            graceful.cancelled().await;
            state.shutdown.cancel();
        })
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    while sources.join_next().await.is_some() {}
    info!(addr = %addr, "Relay stopped");
    Ok(())
}

/// Bind the configured shared port and serve until `shutdown` fires.
pub async fn serve(state: Arc<AppState>, shutdown: CancellationToken) -> Result<()> {
    let listener = bind_shared(&state.config.bind_host, state.config.port).await?;
    serve_on(listener, state, shutdown).await
}

/// Resolve on Ctrl-C or SIGTERM, then cancel `token`.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
        _ = token.cancelled() => {}
    }
    token.cancel();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
