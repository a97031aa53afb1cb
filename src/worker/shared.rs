use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Exited,
}

/// State a worker shares with its pool handle: liveness and whether a task is in flight.
#[derive(Debug)]
pub struct WorkerState {
    alive: AtomicBool,
    in_flight: AtomicBool,
    exited: CancellationToken,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerState {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
            exited: CancellationToken::new(),
        }
    }

    pub fn liveness(&self) -> Liveness {
        if self.alive.load(Ordering::SeqCst) {
            Liveness::Alive
        } else {
            Liveness::Exited
        }
    }

    pub fn is_alive(&self) -> bool {
        self.liveness() == Liveness::Alive
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_exited(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.in_flight.store(false, Ordering::SeqCst);
        self.exited.cancel();
    }

    /// Resolves once the worker has left its run loop for good.
    pub async fn exited(&self) {
        self.exited.cancelled().await;
    }

    /// Marks a task in flight until the returned guard drops (including on unwind).
    pub(crate) fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.store(true, Ordering::SeqCst);
        InFlightGuard {
            state: Arc::clone(self),
        }
    }
}

pub(crate) struct InFlightGuard {
    state: Arc<WorkerState>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.in_flight.store(false, Ordering::SeqCst);
    }
}
