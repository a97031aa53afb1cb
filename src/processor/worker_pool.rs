//! Worker pool orchestration for the batch scheduler.
//!
//! This module owns worker creation, task dispatch with per-task timeouts, and
//! the bookkeeping that keeps crashed workers out of rotation (or replaces them
//! when respawning is enabled).

use crate::processor::backoff::cancellable_sleep;
use crate::remote::AccountServiceFactory;
use crate::runtime::config::EngineConfig;
use crate::runtime::telemetry::Telemetry;
use crate::worker::{
    task_channel, Outcome, Task, TaskEnvelope, TaskError, TaskSender, Worker, WorkerState,
};
use anyhow::{bail, Result};
use futures::FutureExt;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

/// Why a worker left its run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Stopped,
    Panicked(String),
}

#[derive(Debug)]
struct WorkerExit {
    index: usize,
    generation: u64,
    reason: ExitReason,
}

struct WorkerHandle {
    generation: u64,
    mailbox: TaskSender,
    state: Arc<WorkerState>,
    join: JoinHandle<()>,
}

pub struct WorkerPoolParams<F: AccountServiceFactory> {
    pub factory: Arc<F>,
    pub telemetry: Arc<Telemetry>,
    pub shutdown: CancellationToken,
    pub task_timeout: Duration,
    pub spawn_delay: Duration,
    pub step_delay: Duration,
    pub respawn: bool,
}

pub struct WorkerPool<F: AccountServiceFactory> {
    factory: Arc<F>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    task_timeout: Duration,
    spawn_delay: Duration,
    step_delay: Duration,
    respawn: bool,
    slots: Mutex<Vec<Option<WorkerHandle>>>,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
    exits_rx: Mutex<mpsc::UnboundedReceiver<WorkerExit>>,
    generation: AtomicU64,
    initialized: AtomicBool,
}

impl<F: AccountServiceFactory> WorkerPool<F> {
    pub fn new(params: WorkerPoolParams<F>) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            factory: params.factory,
            telemetry: params.telemetry,
            shutdown: params.shutdown,
            task_timeout: params.task_timeout,
            spawn_delay: params.spawn_delay,
            step_delay: params.step_delay,
            respawn: params.respawn,
            slots: Mutex::new(Vec::new()),
            exits_tx,
            exits_rx: Mutex::new(exits_rx),
            generation: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn from_config(
        factory: Arc<F>,
        config: &EngineConfig,
        telemetry: Arc<Telemetry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self::new(WorkerPoolParams {
            factory,
            telemetry,
            shutdown,
            task_timeout: config.task_timeout(),
            spawn_delay: config.worker_spawn_delay(),
            step_delay: config.step_delay(),
            respawn: config.respawn_workers(),
        })
    }

    /// Spawns `workers` workers at indices `0..workers`, pausing between spawns.
    ///
    /// Stops early (without error) if shutdown is requested while spawning.
    pub async fn initialize(&self, workers: usize) -> Result<()> {
        if workers == 0 {
            bail!("worker pool requires at least one worker");
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            bail!("worker pool already initialized");
        }

        for index in 0..workers {
            if self.shutdown.is_cancelled() {
                break;
            }
            let handle = self.spawn_worker(index);
            let live = {
                let mut slots = self.lock_slots();
                slots.push(Some(handle));
                count_live(&slots)
            };
            self.telemetry.record_worker_pool_size(live);
            tracing::info!(worker = index, workers, "worker spawned");

            if index + 1 < workers && !cancellable_sleep(self.spawn_delay, &self.shutdown).await {
                break;
            }
        }

        tracing::info!(workers = self.live_workers(), "worker pool initialized");
        Ok(())
    }

    /// Hands `task` to the worker at `worker_index` and waits for its outcome.
    ///
    /// The reply channel is created before the task is enqueued, so an outcome is
    /// never missed. Waiting is bounded by the task timeout; a late outcome is
    /// discarded by the worker.
    pub async fn dispatch(&self, worker_index: usize, task: Task) -> Result<Outcome, TaskError> {
        self.reap_exited();

        let (mailbox, state) = {
            let slots = self.lock_slots();
            match slots.get(worker_index).and_then(Option::as_ref) {
                Some(handle) if handle.state.is_alive() => {
                    (handle.mailbox.clone(), handle.state.clone())
                }
                _ => return Err(TaskError::WorkerNotFound { worker: worker_index }),
            }
        };

        if state.is_busy() {
            tracing::warn!(
                worker = worker_index,
                sequence = task.sequence,
                "worker still busy with an earlier task; new task queues behind it"
            );
        }

        let (reply, outcome_rx) = oneshot::channel();
        let exchange = async move {
            mailbox
                .send(TaskEnvelope { task, reply })
                .await
                .map_err(|_| TaskError::WorkerNotFound { worker: worker_index })?;
            match outcome_rx.await {
                Ok(outcome) => Ok(outcome),
                Err(_) => {
                    // Reply dropped without an outcome: the worker is on its way out.
                    state.exited().await;
                    Err(TaskError::WorkerNotFound { worker: worker_index })
                }
            }
        };

        match timeout(self.task_timeout, exchange).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => {
                self.reap_exited();
                Err(err)
            }
            Err(_) => Err(TaskError::WorkerTimeout {
                worker: worker_index,
                timeout: self.task_timeout,
            }),
        }
    }

    /// Number of workers currently alive.
    pub fn live_workers(&self) -> usize {
        self.reap_exited();
        count_live(&self.lock_slots())
    }

    pub fn is_alive(&self, worker_index: usize) -> bool {
        self.reap_exited();
        self.lock_slots()
            .get(worker_index)
            .and_then(Option::as_ref)
            .is_some_and(|handle| handle.state.is_alive())
    }

    /// Stops every worker and waits for them to exit. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<WorkerHandle> = self.lock_slots().drain(..).flatten().collect();
        let count = handles.len();

        for handle in handles {
            let WorkerHandle { mailbox, join, .. } = handle;
            drop(mailbox);
            if let Err(err) = join.await {
                tracing::debug!(error = %err, "worker join failed during shutdown");
            }
        }

        self.telemetry.record_worker_pool_size(0);
        if count > 0 {
            tracing::info!(workers = count, "worker pool stopped");
        }
    }

    fn spawn_worker(&self, index: usize) -> WorkerHandle {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let (mailbox, rx) = task_channel();
        let state = Arc::new(WorkerState::new());
        let worker = Worker::new(
            index,
            self.factory.clone(),
            rx,
            self.shutdown.child_token(),
            state.clone(),
            self.step_delay,
        );

        let exits = self.exits_tx.clone();
        let telemetry = self.telemetry.clone();
        let exit_state = state.clone();
        let join = tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(worker.run())
                .catch_unwind()
                .await;
            let reason = match result {
                Ok(()) => ExitReason::Stopped,
                Err(panic_payload) => {
                    let panic_msg = panic_message(panic_payload.as_ref());
                    tracing::error!(worker = index, panic = %panic_msg, "worker task panicked");
                    telemetry.record_worker_exit();
                    ExitReason::Panicked(panic_msg)
                }
            };

            let _ = exits.send(WorkerExit {
                index,
                generation,
                reason,
            });
            exit_state.mark_exited();
        });

        WorkerHandle {
            generation,
            mailbox,
            state,
            join,
        }
    }

    fn reap_exited(&self) {
        let exits: Vec<WorkerExit> = {
            let mut rx = self.exits_rx.lock().unwrap_or_else(PoisonError::into_inner);
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        if exits.is_empty() {
            return;
        }

        let mut slots = self.lock_slots();
        for exit in exits {
            let Some(slot) = slots.get_mut(exit.index) else {
                continue;
            };
            if slot.as_ref().map(|handle| handle.generation) != Some(exit.generation) {
                continue;
            }

            let restart = self.respawn
                && !self.shutdown.is_cancelled()
                && matches!(exit.reason, ExitReason::Panicked(_));
            if restart {
                *slot = Some(self.spawn_worker(exit.index));
                self.telemetry.record_worker_respawn();
                tracing::warn!(worker = exit.index, reason = ?exit.reason, "worker replaced");
            } else {
                *slot = None;
                if !self.shutdown.is_cancelled() {
                    tracing::warn!(
                        worker = exit.index,
                        reason = ?exit.reason,
                        live_workers = count_live(&slots),
                        "worker removed from pool"
                    );
                }
            }
        }
        self.telemetry.record_worker_pool_size(count_live(&slots));
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Option<WorkerHandle>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn count_live(slots: &[Option<WorkerHandle>]) -> usize {
    slots
        .iter()
        .flatten()
        .filter(|handle| handle.state.is_alive())
        .count()
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
