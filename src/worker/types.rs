use crate::remote::{PointsSnapshot, RemoteStep};
use crate::source::Account;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Mailbox depth per worker. Workers handle one task at a time; the slot lets a
/// dispatcher hand over the next task without waiting for the receive.
const TASK_MAILBOX_CAPACITY: usize = 1;

/// One account bound to a worker slot and a proxy for one pass.
#[derive(Debug, Clone)]
pub struct Task {
    pub account: Account,
    pub proxy: Option<String>,
    pub worker_index: usize,
    /// 1-based position of the account inside the pass.
    pub sequence: u64,
    pub total: u64,
}

pub(crate) struct TaskEnvelope {
    pub(crate) task: Task,
    pub(crate) reply: oneshot::Sender<Outcome>,
}

pub(crate) type TaskSender = mpsc::Sender<TaskEnvelope>;
pub(crate) type TaskReceiver = mpsc::Receiver<TaskEnvelope>;

pub(crate) fn task_channel() -> (TaskSender, TaskReceiver) {
    mpsc::channel(TASK_MAILBOX_CAPACITY)
}

/// Coarse failure class reported with every failed Outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Error,
}

impl ErrorKind {
    /// `Timeout` when the failure text mentions a timeout, `Error` otherwise.
    pub fn classify(message: &str) -> Self {
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("timed out") || lowered.contains("timeout") {
            ErrorKind::Timeout
        } else {
            ErrorKind::Error
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => f.write_str("timeout"),
            ErrorKind::Error => f.write_str("error"),
        }
    }
}

/// Per-account failure. Always converted into a counted outcome, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    Validation(String),
    Remote {
        step: RemoteStep,
        kind: ErrorKind,
        message: String,
    },
    WorkerTimeout {
        worker: usize,
        timeout: Duration,
    },
    WorkerNotFound {
        worker: usize,
    },
}

impl TaskError {
    pub(crate) fn remote(step: RemoteStep, err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");
        TaskError::Remote {
            step,
            kind: ErrorKind::classify(&message),
            message,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Remote { kind, .. } => *kind,
            TaskError::WorkerTimeout { .. } => ErrorKind::Timeout,
            TaskError::Validation(_) | TaskError::WorkerNotFound { .. } => ErrorKind::Error,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Validation(reason) => write!(f, "invalid task: {reason}"),
            TaskError::Remote { step, message, .. } => {
                write!(f, "remote {step} step failed: {message}")
            }
            TaskError::WorkerTimeout { worker, timeout } => write!(
                f,
                "worker {worker} did not report within {}ms",
                timeout.as_millis()
            ),
            TaskError::WorkerNotFound { worker } => write!(f, "worker {worker} not found"),
        }
    }
}

impl std::error::Error for TaskError {}

/// What a fully completed remote sequence produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskReport {
    pub was_running: bool,
    pub points: PointsSnapshot,
    /// Proof obtained for an account that had none; persisted by the scheduler.
    pub proof: Option<String>,
}

/// Exactly one per received task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub address: String,
    pub worker_index: usize,
    pub result: Result<TaskReport, TaskError>,
}

impl Outcome {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.result.as_ref().err().map(TaskError::kind)
    }

    pub fn error_message(&self) -> Option<String> {
        self.result.as_ref().err().map(ToString::to_string)
    }
}
