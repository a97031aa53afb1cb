//! Pass state machine: snapshot the account count, page through the source in
//! waves no larger than the worker pool, settle every wave before reading the
//! next page, then summarize.

use crate::processor::backoff::cancellable_sleep;
use crate::processor::worker_pool::WorkerPool;
use crate::proxy::ProxyRotator;
use crate::remote::AccountServiceFactory;
use crate::runtime::config::EngineConfig;
use crate::runtime::progress::{PassEnd, PassStats, PassSummary};
use crate::runtime::telemetry::Telemetry;
use crate::source::{count_with_retry, read_page_with_retry, Account, AccountSource, RetryPolicy};
use crate::worker::{Task, TaskError};
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct BatchScheduler<S: AccountSource, F: AccountServiceFactory> {
    source: Arc<S>,
    pool: Arc<WorkerPool<F>>,
    rotator: ProxyRotator,
    config: EngineConfig,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl<S: AccountSource, F: AccountServiceFactory> BatchScheduler<S, F> {
    pub fn new(
        source: Arc<S>,
        pool: Arc<WorkerPool<F>>,
        rotator: ProxyRotator,
        config: EngineConfig,
        telemetry: Arc<Telemetry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            pool,
            rotator,
            config,
            telemetry,
            shutdown,
        }
    }

    /// Runs one full pass and returns its summary. Never fails: per-account
    /// errors are counted and a page that exhausts its retries ends the pass early.
    pub async fn run_pass(&self, pass: u64) -> PassSummary {
        let policy = RetryPolicy::new(
            self.config.page_retry_attempts(),
            self.config.page_retry_delay(),
        );

        let counted = match count_with_retry(self.source.as_ref(), policy, &self.shutdown).await {
            Ok(counted) => counted,
            Err(err) => {
                let end = if self.shutdown.is_cancelled() {
                    PassEnd::Cancelled
                } else {
                    self.telemetry.record_page_failure();
                    tracing::error!(pass, error = %err, "could not count accounts; skipping pass");
                    PassEnd::Aborted
                };
                return self.finish(PassStats::new(pass, 0), end);
            }
        };

        let start = self.config.start_offset();
        let end_offset = self.end_offset(counted);
        let mut stats = PassStats::new(pass, end_offset.saturating_sub(start));
        tracing::info!(
            pass,
            total = counted,
            start_offset = start,
            end_offset,
            "starting pass"
        );

        let mut offset = start;
        let end = loop {
            if self.shutdown.is_cancelled() {
                break PassEnd::Cancelled;
            }
            if offset >= end_offset {
                break PassEnd::Drained;
            }

            let limit = (self.config.batch_size() as u64).min(end_offset - offset);
            let mut page = match read_page_with_retry(
                self.source.as_ref(),
                offset,
                limit,
                policy,
                &self.shutdown,
            )
            .await
            {
                Ok(page) => page,
                Err(_) if self.shutdown.is_cancelled() => break PassEnd::Cancelled,
                Err(err) => {
                    self.telemetry.record_page_failure();
                    tracing::error!(
                        pass,
                        offset,
                        limit,
                        error = %err,
                        "page read failed; ending pass early"
                    );
                    break PassEnd::Aborted;
                }
            };

            if page.is_empty() {
                tracing::info!(pass, offset, "no accounts left at offset");
                break PassEnd::Drained;
            }
            page.truncate(limit as usize);

            let size = page.len();
            let before = stats.processed();
            let tasks = self.build_wave(page, offset, end_offset);
            tracing::debug!(pass, offset, size, "dispatching wave");
            let errors = self.settle_wave(tasks).await;

            stats.record_wave(size, errors);
            offset += size as u64;
            self.log_progress(&stats, before, offset, end_offset);

            if !cancellable_sleep(self.config.wave_delay(), &self.shutdown).await {
                break PassEnd::Cancelled;
            }
        };

        self.finish(stats, end)
    }

    fn end_offset(&self, counted: u64) -> u64 {
        match self.config.max_accounts() {
            Some(limit) => counted.min(self.config.start_offset().saturating_add(limit)),
            None => counted,
        }
    }

    /// Binds each account in a page to a worker slot and a proxy.
    pub(crate) fn build_wave(&self, page: Vec<Account>, offset: u64, total: u64) -> Vec<Task> {
        let workers = self.config.worker_count();
        page.into_iter()
            .enumerate()
            .map(|(i, account)| Task {
                account,
                proxy: self.rotator.assign(i).map(str::to_owned),
                worker_index: i % workers,
                sequence: offset + i as u64 + 1,
                total,
            })
            .collect()
    }

    /// Fans a wave out to the pool and waits for every task to reach a terminal
    /// state. Returns the number of failed tasks.
    async fn settle_wave(&self, tasks: Vec<Task>) -> usize {
        let settled = join_all(tasks.into_iter().map(|task| self.settle_task(task))).await;
        settled.into_iter().filter(|ok| !ok).count()
    }

    async fn settle_task(&self, task: Task) -> bool {
        let started = Instant::now();
        let worker = task.worker_index;
        let sequence = task.sequence;
        let total = task.total;
        let address = task.account.address.clone();

        let result = self
            .pool
            .dispatch(worker, task)
            .await
            .and_then(|outcome| outcome.result);

        let ok = match result {
            Ok(report) => match report.proof {
                Some(proof) => self.persist_proof(&address, &proof).await,
                None => true,
            },
            Err(err) => {
                // Workers log their own remote failures; only pool-level ones are new here.
                if matches!(
                    err,
                    TaskError::WorkerTimeout { .. } | TaskError::WorkerNotFound { .. }
                ) {
                    tracing::error!(
                        worker,
                        sequence,
                        total,
                        address = %address,
                        kind = %err.kind(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %err,
                        "account task failed"
                    );
                }
                if matches!(err, TaskError::WorkerTimeout { .. }) {
                    self.telemetry.record_task_timeout();
                } else {
                    self.telemetry.record_task_failure();
                }
                false
            }
        };

        if ok {
            self.telemetry.record_task_success();
        }

        cancellable_sleep(self.config.task_delay(), &self.shutdown).await;
        ok
    }

    async fn persist_proof(&self, address: &str, proof: &str) -> bool {
        match self.source.update_proof(address, proof).await {
            Ok(changed) => {
                tracing::info!(address, changed, "proof stored");
                true
            }
            Err(err) => {
                self.telemetry.record_task_failure();
                tracing::error!(address, error = %format!("{err:#}"), "failed to store proof");
                false
            }
        }
    }

    fn log_progress(&self, stats: &PassStats, before: u64, offset: u64, total: u64) {
        let interval = self.config.progress_log_interval();
        if stats.processed() / interval == before / interval {
            return;
        }
        let progress_pct = if total == 0 {
            100.0
        } else {
            offset as f64 / total as f64 * 100.0
        };
        tracing::info!(
            processed = stats.processed(),
            errors = stats.errors(),
            offset,
            total,
            progress_pct = format!("{progress_pct:.1}"),
            "pass progress"
        );
    }

    fn finish(&self, stats: PassStats, end: PassEnd) -> PassSummary {
        let summary = stats.finish(end);
        summary.log();
        self.telemetry.record_pass_completed();
        summary
    }
}
