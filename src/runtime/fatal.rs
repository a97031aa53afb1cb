use anyhow::Error as AnyError;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Captures the first process-fatal error and cancels the run.
///
/// Per-account failures never reach this handler; only data-store
/// initialization and control-loop failures do.
#[derive(Clone)]
pub struct FatalErrorHandler {
    inner: Arc<FatalInner>,
}

struct FatalInner {
    root_shutdown: CancellationToken,
    run_shutdown: CancellationToken,
    first: OnceLock<FatalError>,
}

/// The stage that failed plus its error, shareable between the runner and callers.
#[derive(Clone)]
struct FatalError {
    stage: String,
    source: Arc<AnyError>,
}

impl fmt::Debug for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatalError")
            .field("stage", &self.stage)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {:#}", self.stage, self.source)
    }
}

impl std::error::Error for FatalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref().as_ref())
    }
}

impl FatalErrorHandler {
    pub fn new(root_shutdown: CancellationToken, run_shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(FatalInner {
                root_shutdown,
                run_shutdown,
                first: OnceLock::new(),
            }),
        }
    }

    /// Records `error` if nothing was recorded yet and cancels both tokens.
    /// Later errors are only handed back to the caller.
    pub fn trigger(&self, stage: &str, error: AnyError) -> AnyError {
        let candidate = FatalError {
            stage: stage.to_owned(),
            source: Arc::new(error),
        };

        if self.inner.first.set(candidate.clone()).is_err() {
            tracing::debug!(stage, error = %candidate, "fatal error after shutdown began");
            return candidate.into();
        }

        tracing::error!(stage, error = %candidate, "fatal engine error; initiating shutdown");
        self.inner.run_shutdown.cancel();
        self.inner.root_shutdown.cancel();
        candidate.into()
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.first.get().is_some()
    }

    pub fn error(&self) -> Option<AnyError> {
        self.inner.first.get().cloned().map(AnyError::new)
    }
}
