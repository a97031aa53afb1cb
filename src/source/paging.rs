//! Retrying wrappers around [`AccountSource`] reads. Every failure is treated as
//! transient until the attempt budget runs out.

use super::{Account, AccountSource};
use crate::processor::backoff::{retry_with_backoff, FailedAttempt, RetrySchedule};
use anyhow::Error as AnyError;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fixed-delay retry budget for data-source reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: usize, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

/// A data-source read that kept failing after every retry.
#[derive(Debug)]
pub struct DataSourceError {
    operation: &'static str,
    attempts: usize,
    source: AnyError,
}

impl DataSourceError {
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

impl fmt::Display for DataSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "data source {} failed after {} attempt(s): {:#}",
            self.operation, self.attempts, self.source
        )
    }
}

impl std::error::Error for DataSourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

pub async fn read_page_with_retry<S: AccountSource + ?Sized>(
    source: &S,
    offset: u64,
    limit: u64,
    policy: RetryPolicy,
    cancellation: &CancellationToken,
) -> Result<Vec<Account>, DataSourceError> {
    let mut attempts = 0;
    let result = retry_with_backoff(
        RetrySchedule::fixed(policy.delay, policy.attempts).cancelled_by(cancellation),
        |attempt| {
            attempts = attempt;
            source.read_page(offset, limit)
        },
        |failed: FailedAttempt<'_>| match failed.retry_in {
            Some(delay) => tracing::warn!(
                attempt = failed.attempt,
                offset,
                limit,
                backoff_ms = delay.as_millis() as u64,
                error = %failed.error,
                "page read failed; retrying"
            ),
            None => tracing::error!(
                attempt = failed.attempt,
                offset,
                limit,
                error = %failed.error,
                "page read exhausted retries"
            ),
        },
    )
    .await;

    result.map_err(|source| DataSourceError {
        operation: "read_page",
        attempts,
        source,
    })
}

pub async fn count_with_retry<S: AccountSource + ?Sized>(
    source: &S,
    policy: RetryPolicy,
    cancellation: &CancellationToken,
) -> Result<u64, DataSourceError> {
    let mut attempts = 0;
    let result = retry_with_backoff(
        RetrySchedule::fixed(policy.delay, policy.attempts).cancelled_by(cancellation),
        |attempt| {
            attempts = attempt;
            source.count()
        },
        |failed: FailedAttempt<'_>| match failed.retry_in {
            Some(delay) => tracing::warn!(
                attempt = failed.attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %failed.error,
                "account count failed; retrying"
            ),
            None => tracing::error!(
                attempt = failed.attempt,
                error = %failed.error,
                "account count exhausted retries"
            ),
        },
    )
    .await;

    result.map_err(|source| DataSourceError {
        operation: "count",
        attempts,
        source,
    })
}
