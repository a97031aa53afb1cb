use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Process-wide counters shared by the pool, workers and scheduler.
#[derive(Default, Debug)]
pub struct Telemetry {
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    task_timeouts: AtomicU64,
    worker_exits: AtomicU64,
    worker_respawns: AtomicU64,
    page_failures: AtomicU64,
    passes_completed: AtomicU64,
    worker_pool_size: AtomicUsize,
}

impl Telemetry {
    pub fn record_task_success(&self) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_failure(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_timeout(&self) {
        self.task_timeouts.fetch_add(1, Ordering::Relaxed);
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_exit(&self) {
        self.worker_exits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_respawn(&self) {
        self.worker_respawns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_failure(&self) {
        self.page_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass_completed(&self) {
        self.passes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_pool_size(&self, workers: usize) {
        self.worker_pool_size.store(workers, Ordering::Relaxed);
    }

    pub fn worker_pool_size(&self) -> usize {
        self.worker_pool_size.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            task_timeouts: self.task_timeouts.load(Ordering::Relaxed),
            worker_exits: self.worker_exits.load(Ordering::Relaxed),
            worker_respawns: self.worker_respawns.load(Ordering::Relaxed),
            page_failures: self.page_failures.load(Ordering::Relaxed),
            passes_completed: self.passes_completed.load(Ordering::Relaxed),
            live_workers: self.worker_pool_size(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub task_timeouts: u64,
    pub worker_exits: u64,
    pub worker_respawns: u64,
    pub page_failures: u64,
    pub passes_completed: u64,
    pub live_workers: usize,
}

impl TelemetrySnapshot {
    pub fn tasks_settled(&self) -> u64 {
        self.tasks_succeeded.saturating_add(self.tasks_failed)
    }
}

/// Spawns a background task that periodically logs task throughput, failures and pool size.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "nodesweep::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let settled_delta = current_snapshot
                        .tasks_settled()
                        .saturating_sub(last_snapshot.tasks_settled());
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        settled_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "nodesweep::metrics",
                        throughput = format!("{throughput:.2}"),
                        succeeded = current_snapshot.tasks_succeeded,
                        failed = current_snapshot.tasks_failed,
                        timeouts = current_snapshot.task_timeouts,
                        worker_exits = current_snapshot.worker_exits,
                        worker_respawns = current_snapshot.worker_respawns,
                        page_failures = current_snapshot.page_failures,
                        passes = current_snapshot.passes_completed,
                        live_workers = current_snapshot.live_workers,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
