use crate::processor::backoff::cancellable_sleep;
use crate::processor::lifecycle::RunLifecycle;
use crate::processor::scheduler::BatchScheduler;
use crate::processor::worker_pool::{panic_message, WorkerPool};
use crate::proxy::ProxyRotator;
use crate::remote::AccountServiceFactory;
use crate::runtime::config::EngineConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::progress::PassEnd;
use crate::runtime::telemetry::Telemetry;
use crate::source::AccountSource;
use anyhow::{anyhow, bail, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How a run that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Ctrl-C or SIGTERM.
    Interrupted,
    /// The root token was cancelled by the embedding application.
    Cancelled,
}

/// Owns the pass loop and handles OS signals for graceful shutdowns.
pub struct Runner<S: AccountSource, F: AccountServiceFactory> {
    config: EngineConfig,
    source: Arc<S>,
    pool: Arc<WorkerPool<F>>,
    scheduler: BatchScheduler<S, F>,
    telemetry: Arc<Telemetry>,
    proxies: usize,
    shutdown: CancellationToken,
    started: bool,
}

impl<S: AccountSource, F: AccountServiceFactory> Runner<S, F> {
    /// Creates a new runner and wires a root [`CancellationToken`] that propagates
    /// through the pool, the workers and the scheduler.
    pub fn new(config: EngineConfig, source: Arc<S>, factory: Arc<F>, proxies: ProxyRotator) -> Self {
        Self::with_cancellation_token(config, source, factory, proxies, CancellationToken::new())
    }

    pub fn with_cancellation_token(
        config: EngineConfig,
        source: Arc<S>,
        factory: Arc<F>,
        proxies: ProxyRotator,
        shutdown: CancellationToken,
    ) -> Self {
        let telemetry = Arc::new(Telemetry::default());
        let pool = Arc::new(WorkerPool::from_config(
            factory,
            &config,
            telemetry.clone(),
            shutdown.child_token(),
        ));
        let proxy_count = proxies.len();
        let scheduler = BatchScheduler::new(
            source.clone(),
            pool.clone(),
            proxies,
            config.clone(),
            telemetry.clone(),
            shutdown.child_token(),
        );

        Self {
            config,
            source,
            pool,
            scheduler,
            telemetry,
            proxies: proxy_count,
            shutdown,
            started: false,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn pool(&self) -> Arc<WorkerPool<F>> {
        self.pool.clone()
    }

    /// Runs passes until the root token is cancelled, then stops the pool and
    /// releases the data source. Returns the first fatal error, if any.
    pub async fn run(&mut self) -> Result<()> {
        if self.started {
            bail!("runner already started");
        }
        self.started = true;

        let lifecycle = RunLifecycle::start(
            &self.shutdown,
            self.telemetry.clone(),
            self.config.metrics_interval(),
        );

        tracing::info!(
            workers = self.config.worker_count(),
            batch_size = self.config.batch_size(),
            proxies = self.proxies,
            task_timeout_secs = self.config.task_timeout().as_secs(),
            "engine starting"
        );

        let result = self.drive(lifecycle.fatal()).await;

        self.shutdown.cancel();
        self.pool.shutdown().await;
        self.source.close().await;
        let fatal = lifecycle.finish().await;
        tracing::info!("engine stopped");

        match fatal {
            Some(err) => Err(err),
            None => result,
        }
    }

    /// Runs until Ctrl-C / SIGTERM is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_signal(&mut self) -> Result<RunExit> {
        let token = self.shutdown.clone();
        let listener = tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_termination() => {
                    tracing::info!("termination signal received; shutting down");
                    token.cancel();
                    true
                }
                _ = token.cancelled() => false,
            }
        });

        let result = self.run().await;
        self.shutdown.cancel();
        let interrupted = listener.await.unwrap_or(false);

        result.map(|()| {
            if interrupted {
                RunExit::Interrupted
            } else {
                RunExit::Cancelled
            }
        })
    }

    async fn drive(&self, fatal: &FatalErrorHandler) -> Result<()> {
        if !cancellable_sleep(self.config.startup_delay(), &self.shutdown).await {
            return Ok(());
        }

        if let Err(err) = self.pool.initialize(self.config.worker_count()).await {
            return Err(fatal.trigger("worker pool initialization", err));
        }

        let mut pass = 1u64;
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let summary = match AssertUnwindSafe(self.scheduler.run_pass(pass))
                .catch_unwind()
                .await
            {
                Ok(summary) => summary,
                Err(panic_payload) => {
                    let panic_msg = panic_message(panic_payload.as_ref());
                    let err = anyhow!("pass {pass} panicked: {panic_msg}");
                    return Err(fatal.trigger("pass loop", err));
                }
            };

            if summary.end == PassEnd::Cancelled {
                return Ok(());
            }

            tracing::info!(
                pass,
                cooldown_secs = self.config.pass_cooldown().as_secs(),
                live_workers = self.pool.live_workers(),
                "pass complete; cooling down"
            );
            pass += 1;

            if !cancellable_sleep(self.config.pass_cooldown(), &self.shutdown).await {
                return Ok(());
            }
        }
    }
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler; listening for Ctrl-C only");
            }
        }
    }

    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for Ctrl-C");
        futures::future::pending::<()>().await;
    }
}
