// =============================================================================
// Process Supervisor — keeps N worker processes alive
// =============================================================================
//
// The primary launches `W` workers, each re-executing the current binary
// with a distinct `WORKER_ID`. A watcher task per child reports its exit on
// an mpsc channel; the supervisor loop turns every exit into exactly one
// replacement for the same ordinal. There is no backoff and no cap: workers
// are expected to be long-running, and the policy is "keep W alive".
//
// Launch failures are retried on a 1 s tick so a broken executable cannot
// spin the loop.
//
// On shutdown each worker receives SIGTERM and has `STOP_GRACE` to finish
// its graceful drain; only then is it killed.
// =============================================================================

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Environment variable carrying a worker's ordinal identity.
pub const WORKER_ID_ENV: &str = "WORKER_ID";

/// Upper bound on the default fleet size.
const DEFAULT_MAX_WORKERS: usize = 4;

const LAUNCH_RETRY: Duration = Duration::from_secs(1);

/// How long a worker gets to drain after SIGTERM before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// `W` = explicit override (when > 0) or `min(4, cores)`.
pub fn resolve_worker_count(override_count: Option<usize>, cores: usize) -> usize {
    match override_count {
        Some(n) if n > 0 => n,
        _ => DEFAULT_MAX_WORKERS.min(cores.max(1)),
    }
}

pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Worker records and restart policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerProcess {
    pub pid: u32,
    pub index: usize,
    pub alive: bool,
}

/// Exit event reported by a worker's watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub index: usize,
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    fn from_status(index: usize, pid: u32, status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            index,
            pid,
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "worker {} (pid {}) exited with code {code}", self.index, self.pid),
            (None, Some(sig)) => write!(f, "worker {} (pid {}) killed by signal {sig}", self.index, self.pid),
            (None, None) => write!(f, "worker {} (pid {}) exited", self.index, self.pid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnRequest {
    pub index: usize,
}

/// Every exit, whatever its cause, is answered by one replacement in the
/// same slot.
pub fn restart_policy(exit: &WorkerExit) -> SpawnRequest {
    SpawnRequest { index: exit.index }
}

// ---------------------------------------------------------------------------
// Launchers
// ---------------------------------------------------------------------------

/// Starts one worker process for a given ordinal.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, index: usize) -> Result<Child>;
}

/// Re-executes a program (by default the current binary) with
/// `WORKER_ID=<index>`.
pub struct ExecLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ExecLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Launcher for the running executable, forwarding its arguments.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("failed to resolve current executable")?;
        Ok(Self::new(program, std::env::args().skip(1).collect()))
    }

    fn command(&self, index: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_ID_ENV, index.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

impl WorkerLauncher for ExecLauncher {
    fn launch(&self, index: usize) -> Result<Child> {
        self.command(index)
            .spawn()
            .with_context(|| format!("failed to launch worker {index} ({})", self.program.display()))
    }
}

// ---------------------------------------------------------------------------
// Fleet view
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FleetInner {
    workers: Vec<WorkerProcess>,
    restarts: u64,
}

/// Read-only handle on the supervised fleet.
#[derive(Clone, Default)]
pub struct FleetView {
    inner: Arc<RwLock<FleetInner>>,
}

impl FleetView {
    pub fn workers(&self) -> Vec<WorkerProcess> {
        self.inner.read().workers.clone()
    }

    pub fn alive_count(&self) -> usize {
        self.inner.read().workers.iter().filter(|w| w.alive).count()
    }

    pub fn restarts(&self) -> u64 {
        self.inner.read().restarts
    }

    fn upsert(&self, worker: WorkerProcess) {
        let mut inner = self.inner.write();
        match inner.workers.iter_mut().find(|w| w.index == worker.index) {
            Some(slot) => *slot = worker,
            None => {
                inner.workers.push(worker);
                inner.workers.sort_by_key(|w| w.index);
            }
        }
    }

    fn mark_exited(&self, index: usize, pid: u32) {
        let mut inner = self.inner.write();
        if let Some(w) = inner
            .workers
            .iter_mut()
            .find(|w| w.index == index && w.pid == pid)
        {
            w.alive = false;
        }
        inner.restarts += 1;
    }

    fn mark_all_stopped(&self) {
        for w in self.inner.write().workers.iter_mut() {
            w.alive = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct ProcessSupervisor<L: WorkerLauncher> {
    launcher: Arc<L>,
    worker_count: usize,
    fleet: FleetView,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
    exit_rx: mpsc::UnboundedReceiver<WorkerExit>,
    watchers: JoinSet<()>,
    /// Slots whose last launch failed.
    pending: Vec<usize>,
    children_cancel: CancellationToken,
    grace: Duration,
}

impl<L: WorkerLauncher> ProcessSupervisor<L> {
    pub fn new(launcher: L, worker_count: usize) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            launcher: Arc::new(launcher),
            worker_count,
            fleet: FleetView::default(),
            exit_tx,
            exit_rx,
            watchers: JoinSet::new(),
            pending: Vec::new(),
            children_cancel: CancellationToken::new(),
            grace: STOP_GRACE,
        }
    }

    #[cfg(test)]
    fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn fleet(&self) -> FleetView {
        self.fleet.clone()
    }

    /// Launch the fleet and keep it at `worker_count` until `shutdown` fires,
    /// then stop every child and wait for the watchers to finish.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(workers = self.worker_count, "starting worker fleet");
        for index in 0..self.worker_count {
            self.spawn_worker(index);
        }

        let mut retry = tokio::time::interval(LAUNCH_RETRY);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(exit) = self.exit_rx.recv() => {
                    warn!(
                        worker = exit.index,
                        pid = exit.pid,
                        code = ?exit.code,
                        signal = ?exit.signal,
                        "{exit}; starting replacement"
                    );
                    self.fleet.mark_exited(exit.index, exit.pid);
                    let request = restart_policy(&exit);
                    self.spawn_worker(request.index);
                }
                _ = retry.tick(), if !self.pending.is_empty() => {
                    for index in std::mem::take(&mut self.pending) {
                        self.spawn_worker(index);
                    }
                }
                Some(_) = self.watchers.join_next(), if !self.watchers.is_empty() => {}
            }
        }

        info!("stopping worker fleet");
        self.children_cancel.cancel();
        while self.watchers.join_next().await.is_some() {}
        self.fleet.mark_all_stopped();
        info!("worker fleet stopped");
        Ok(())
    }

    fn spawn_worker(&mut self, index: usize) {
        let child = match self.launcher.launch(index) {
            Ok(child) => child,
            Err(e) => {
                error!(worker = index, error = %e, "worker launch failed; retrying");
                self.pending.push(index);
                return;
            }
        };

        let pid = child.id().unwrap_or_default();
        self.fleet.upsert(WorkerProcess {
            pid,
            index,
            alive: true,
        });
        info!(worker = index, pid, "worker started");

        let tx = self.exit_tx.clone();
        let cancel = self.children_cancel.clone();
        self.watchers
            .spawn(watch_child(index, pid, child, tx, cancel, self.grace));
    }
}

/// Wait for one child to exit and report it, or stop it on shutdown.
async fn watch_child(
    index: usize,
    pid: u32,
    mut child: Child,
    tx: mpsc::UnboundedSender<WorkerExit>,
    cancel: CancellationToken,
    grace: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            let exit = match status {
                Ok(status) => WorkerExit::from_status(index, pid, &status),
                Err(e) => {
                    warn!(worker = index, pid, error = %e, "failed to wait on worker");
                    WorkerExit { index, pid, code: None, signal: None }
                }
            };
            let _ = tx.send(exit);
        }
        _ = cancel.cancelled() => stop_child(index, pid, &mut child, grace).await,
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn stop_child(index: usize, pid: u32, child: &mut Child, grace: Duration) {
    if request_termination(index, pid) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(worker = index, pid, code = ?status.code(), "worker stopped");
                return;
            }
            Ok(Err(e)) => warn!(worker = index, pid, error = %e, "failed to wait on worker"),
            Err(_) => warn!(worker = index, pid, grace_ms = grace.as_millis() as u64, "worker ignored SIGTERM; killing"),
        }
    }
    if let Err(e) = child.kill().await {
        warn!(worker = index, pid, error = %e, "failed to kill worker");
    }
}

#[cfg(unix)]
fn request_termination(index: usize, pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            warn!(worker = index, pid, error = %e, "failed to send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_termination(_index: usize, _pid: u32) -> bool {
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
