// =============================================================================
// candlewire — Main Entry Point
// =============================================================================
//
// One binary, three roles:
//   candlewire                         primary: supervises W workers and serves
//   WORKER_ID=<n> candlewire           worker: serves only (launched by primary)
//   candlewire watch [SYMBOL] [SECS]   client: follows a relay and logs candles
//
// Every serving process binds the same port (SO_REUSEPORT) and subscribes to
// the upstream feed on its own.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod client;
mod market_data;
mod runtime_config;
mod server;
mod stream;
mod supervisor;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::client::{ChartFeed, ConnectionStatusMonitor};
use crate::market_data::CandleKey;
use crate::runtime_config::RelayConfig;
use crate::supervisor::{ExecLauncher, ProcessSupervisor, WORKER_ID_ENV};

const DEFAULT_CONFIG_PATH: &str = "relay_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = RelayConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RelayConfig::default()
    });
    config.apply_env();

    // ── 2. Role dispatch ─────────────────────────────────────────────────
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("watch") {
        return run_watch(config, &args[1..]).await;
    }

    match std::env::var(WORKER_ID_ENV) {
        Ok(raw) => {
            let index: usize = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid {WORKER_ID_ENV}={raw}"))?;
            run_worker(config, index).await
        }
        Err(_) => run_primary(config).await,
    }
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(config: RelayConfig, index: usize) -> anyhow::Result<()> {
    let span = info_span!("worker", id = index);
    async move {
        info!(pid = std::process::id(), "Worker starting");
        let state = Arc::new(AppState::new(config.server, Some(index)));
        let shutdown = CancellationToken::new();
        tokio::spawn(server::shutdown_signal(shutdown.clone()));

        server::serve(state, shutdown).await?;
        info!("Worker shut down cleanly");
        Ok(())
    }
    .instrument(span)
    .await
}

// =============================================================================
// Primary
// =============================================================================

async fn run_primary(config: RelayConfig) -> anyhow::Result<()> {
    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        candlewire relay — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let cores = supervisor::available_cores();
    let workers = supervisor::resolve_worker_count(config.server.workers, cores);
    info!(
        workers,
        cores,
        port = config.server.port,
        symbols = ?config.server.symbols,
        tick_source = %config.server.tick_source,
        "Primary starting"
    );

    let launcher = ExecLauncher::current_exe()?;
    let supervisor = ProcessSupervisor::new(launcher, workers);
    let fleet = supervisor.fleet();

    let state = Arc::new(AppState::new(config.server, None).with_fleet(fleet));
    let shutdown = CancellationToken::new();
    tokio::spawn(server::shutdown_signal(shutdown.clone()));

    let fleet_task = tokio::spawn(supervisor.run(shutdown.clone()));

    let served = server::serve(state, shutdown.clone()).await;
    shutdown.cancel();

    match fleet_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Supervisor failed"),
        Err(e) => error!(error = %e, "Supervisor task panicked"),
    }

    served?;
    info!("candlewire relay shut down complete.");
    Ok(())
}

// =============================================================================
// Watch (client)
// =============================================================================

async fn run_watch(config: RelayConfig, args: &[String]) -> anyhow::Result<()> {
    let symbol = args
        .first()
        .map(|s| s.to_uppercase())
        .or_else(|| config.server.symbols.first().cloned())
        .unwrap_or_else(|| "BTCUSDT".to_string());
    let interval_sec: u64 = match args.get(1) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid interval seconds: {raw}"))?,
        None => config.server.intervals_sec.first().copied().unwrap_or(60),
    };

    info!(origin = %config.client.origin, symbol = %symbol, interval_sec, "Watching relay");

    let feed = Arc::new(ChartFeed::new(
        &config.client,
        vec![interval_sec],
        config.server.max_candles,
    )?);
    let monitor = ConnectionStatusMonitor::new(
        feed.transport().clone(),
        &config.client.origin,
        &config.client.monitor,
    )?;
    monitor.start();

    let shutdown = CancellationToken::new();
    tokio::spawn(server::shutdown_signal(shutdown.clone()));

    let runner = {
        let feed = feed.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { feed.run(shutdown).await })
    };

    let key = CandleKey::new(symbol, interval_sec);
    let mut report = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = report.tick() => {
                let health = monitor.status();
                match feed.store().last(&key) {
                    Some(c) => info!(
                        key = %key,
                        candles = feed.store().count(&key),
                        time = c.time,
                        open = c.open,
                        high = c.high,
                        low = c.low,
                        close = c.close,
                        health = ?health.signal,
                        "Latest candle"
                    ),
                    None => info!(key = %key, health = ?health.signal, "No candles yet"),
                }
            }
        }
    }

    monitor.stop();
    if let Err(e) = runner.await {
        error!(error = %e, "Chart feed task panicked");
    }
    Ok(())
}
