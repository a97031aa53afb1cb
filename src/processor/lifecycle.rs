//! Background pieces that live exactly as long as one engine run.

use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry};
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the run-scoped token, the fatal handler bound to it and the metrics reporter.
///
/// The run token is a child of the root token: a fatal error cancels both,
/// finishing the run cancels only the child.
pub(crate) struct RunLifecycle {
    run_token: CancellationToken,
    fatal: FatalErrorHandler,
    metrics: JoinHandle<()>,
}

impl RunLifecycle {
    pub(crate) fn start(
        root: &CancellationToken,
        telemetry: Arc<Telemetry>,
        metrics_interval: Duration,
    ) -> Self {
        let run_token = root.child_token();
        let fatal = FatalErrorHandler::new(root.clone(), run_token.clone());
        let metrics = spawn_metrics_reporter(telemetry, run_token.clone(), metrics_interval);

        Self {
            run_token,
            fatal,
            metrics,
        }
    }

    pub(crate) fn fatal(&self) -> &FatalErrorHandler {
        &self.fatal
    }

    /// Stops the reporter and hands back the fatal error captured during the run, if any.
    pub(crate) async fn finish(self) -> Option<Error> {
        self.run_token.cancel();
        if let Err(err) = self.metrics.await {
            tracing::warn!(error = %err, "metrics reporter task panicked");
        }
        self.fatal.error()
    }
}
