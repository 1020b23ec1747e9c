use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a fmt subscriber honouring `RUST_LOG` (falling back to `info`).
/// Calling this more than once is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Monotonic counters shared by the head tracker, transaction manager and
/// scheduler.
#[derive(Default, Debug)]
pub struct Telemetry {
    heads_delivered: AtomicU64,
    reorgs: AtomicU64,
    runs_created: AtomicU64,
    runs_completed: AtomicU64,
    runs_errored: AtomicU64,
    tx_attempts: AtomicU64,
    gas_bumps: AtomicU64,
    rpc_errors: AtomicU64,
}

impl Telemetry {
    pub fn record_heads_delivered(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.heads_delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_reorg(&self) {
        self.reorgs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_created(&self) {
        self.runs_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_errored(&self) {
        self.runs_errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tx_attempt(&self) {
        self.tx_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gas_bump(&self) {
        self.gas_bumps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rpc_error(&self) {
        self.rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            heads_delivered: self.heads_delivered.load(Ordering::Relaxed),
            reorgs: self.reorgs.load(Ordering::Relaxed),
            runs_created: self.runs_created.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_errored: self.runs_errored.load(Ordering::Relaxed),
            tx_attempts: self.tx_attempts.load(Ordering::Relaxed),
            gas_bumps: self.gas_bumps.load(Ordering::Relaxed),
            rpc_errors: self.rpc_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub heads_delivered: u64,
    pub reorgs: u64,
    pub runs_created: u64,
    pub runs_completed: u64,
    pub runs_errored: u64,
    pub tx_attempts: u64,
    pub gas_bumps: u64,
    pub rpc_errors: u64,
}

impl TelemetrySnapshot {
    /// Runs created but not yet finished, as far as the counters can tell.
    pub fn runs_open(&self) -> u64 {
        self.runs_created
            .saturating_sub(self.runs_completed)
            .saturating_sub(self.runs_errored)
    }
}

/// Spawns a task that logs a counter snapshot every `interval` until `shutdown`
/// is cancelled.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = telemetry.snapshot();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "oraclenode::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    tracing::info!(
                        target: "oraclenode::metrics",
                        heads = current.heads_delivered,
                        new_heads = current.heads_delivered.saturating_sub(last.heads_delivered),
                        reorgs = current.reorgs,
                        runs_open = current.runs_open(),
                        runs_completed = current.runs_completed,
                        runs_errored = current.runs_errored,
                        tx_attempts = current.tx_attempts,
                        gas_bumps = current.gas_bumps,
                        rpc_errors = current.rpc_errors,
                        "runtime metrics snapshot"
                    );
                    last = current;
                }
            }
        }
    })
}
