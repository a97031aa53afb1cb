use crate::remote::{AccountService, AccountServiceFactory, RemoteStep};
use crate::runtime::hooks::HookDecision;
use crate::source::Account;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::shared::WorkerState;
use super::types::{Outcome, Task, TaskEnvelope, TaskError, TaskReport, TaskReceiver};

/// Long-lived task executor. Receives one [`Task`] at a time from its mailbox and
/// answers every task with exactly one [`Outcome`].
pub(crate) struct Worker<F: AccountServiceFactory> {
    pub(crate) index: usize,
    factory: Arc<F>,
    mailbox: TaskReceiver,
    shutdown: CancellationToken,
    state: Arc<WorkerState>,
    step_delay: Duration,
}

impl<F: AccountServiceFactory> Worker<F> {
    pub(crate) fn new(
        index: usize,
        factory: Arc<F>,
        mailbox: TaskReceiver,
        shutdown: CancellationToken,
        state: Arc<WorkerState>,
        step_delay: Duration,
    ) -> Self {
        Self {
            index,
            factory,
            mailbox,
            shutdown,
            state,
            step_delay,
        }
    }

    #[tracing::instrument(name = "worker", skip_all, fields(worker = self.index))]
    pub(crate) async fn run(mut self) {
        tracing::info!(worker = self.index, "worker task started");
        let shutdown = self.shutdown.clone();

        loop {
            let envelope = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!(worker = self.index, "shutdown requested; exiting worker loop");
                    break;
                }
                received = self.mailbox.recv() => match received {
                    Some(envelope) => envelope,
                    None => {
                        tracing::info!(worker = self.index, "mailbox closed; exiting worker loop");
                        break;
                    }
                },
            };

            let TaskEnvelope { task, reply } = envelope;
            if reply.is_closed() {
                tracing::warn!(
                    worker = self.index,
                    address = %task.account.address,
                    sequence = task.sequence,
                    "task abandoned while queued; skipping"
                );
                continue;
            }
            let _busy = self.state.enter();

            match self.handle(task).await {
                HookDecision::Finished(outcome) => {
                    if reply.send(outcome).is_err() {
                        tracing::debug!(
                            worker = self.index,
                            "dispatcher stopped waiting; outcome dropped"
                        );
                    }
                }
                HookDecision::Cancelled => {
                    tracing::info!(worker = self.index, "shutdown interrupted in-flight task");
                    break;
                }
            }
        }

        tracing::info!(worker = self.index, "worker task exited");
    }

    async fn handle(&self, task: Task) -> HookDecision<Outcome> {
        let started = Instant::now();
        let Task {
            account,
            proxy,
            worker_index,
            sequence,
            total,
        } = task;
        let address = account.address.clone();

        if let Some(reason) = validation_failure(&account) {
            tracing::warn!(worker = self.index, sequence, total, reason, "rejecting malformed task");
            return HookDecision::Finished(Outcome {
                address,
                worker_index,
                result: Err(TaskError::Validation(reason.to_owned())),
            });
        }

        tracing::info!(
            worker = self.index,
            sequence,
            total,
            address = %address,
            proxy = proxy.as_deref().unwrap_or("none"),
            "processing account"
        );

        let mut service = match self.factory.connect(&account, proxy.as_deref()) {
            Ok(service) => service,
            Err(err) => {
                let error = TaskError::remote(RemoteStep::Connect, &err);
                log_failure(self.index, sequence, total, &address, started, &error);
                return HookDecision::Finished(Outcome {
                    address,
                    worker_index,
                    result: Err(error),
                });
            }
        };

        let decision = {
            let sequence_run = self.run_sequence(&mut service, &account);
            tokio::pin!(sequence_run);
            tokio::select! {
                result = &mut sequence_run => HookDecision::Finished(result),
                _ = self.shutdown.cancelled() => HookDecision::Cancelled,
            }
        };
        service.close().await;

        let HookDecision::Finished(result) = decision else {
            return HookDecision::Cancelled;
        };

        match &result {
            Ok(report) => tracing::info!(
                worker = self.index,
                sequence,
                total,
                address = %address,
                points = report.points.points,
                referral_count = report.points.referral_count,
                was_running = report.was_running,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "account processed"
            ),
            Err(error) => log_failure(self.index, sequence, total, &address, started, error),
        }

        HookDecision::Finished(Outcome {
            address,
            worker_index,
            result,
        })
    }

    async fn run_sequence(
        &self,
        service: &mut F::Service,
        account: &Account,
    ) -> Result<TaskReport, TaskError> {
        self.pause().await;

        service
            .check_in()
            .await
            .map_err(|err| TaskError::remote(RemoteStep::CheckIn, &err))?;

        let was_running = service
            .node_running()
            .await
            .map_err(|err| TaskError::remote(RemoteStep::QueryRunningState, &err))?;

        if was_running {
            service
                .stop_node()
                .await
                .map_err(|err| TaskError::remote(RemoteStep::Stop, &err))?;
            self.pause().await;
        }

        service
            .connect_node()
            .await
            .map_err(|err| TaskError::remote(RemoteStep::Reconnect, &err))?;

        let points = service
            .node_points()
            .await
            .map_err(|err| TaskError::remote(RemoteStep::QueryPoints, &err))?;

        let proof = if account.has_proof() {
            None
        } else {
            service
                .fetch_proof()
                .await
                .map_err(|err| TaskError::remote(RemoteStep::FetchProof, &err))?
        };

        Ok(TaskReport {
            was_running,
            points,
            proof,
        })
    }

    async fn pause(&self) {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
    }
}

fn validation_failure(account: &Account) -> Option<&'static str> {
    if account.address.trim().is_empty() {
        Some("account has no address")
    } else if account.credential.is_empty() {
        Some("account has no credential")
    } else {
        None
    }
}

fn log_failure(
    worker: usize,
    sequence: u64,
    total: u64,
    address: &str,
    started: Instant,
    error: &TaskError,
) {
    tracing::error!(
        worker,
        sequence,
        total,
        address,
        kind = %error.kind(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        error = %error,
        "account task failed"
    );
}
