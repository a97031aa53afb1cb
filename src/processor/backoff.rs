use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Fixed-delay retry budget, optionally bound to a cancellation token.
#[derive(Clone, Copy)]
pub(crate) struct RetrySchedule<'a> {
    delay: Duration,
    attempts: usize,
    cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetrySchedule<'a> {
    pub(crate) fn fixed(delay: Duration, attempts: usize) -> Self {
        Self {
            delay,
            attempts: attempts.max(1),
            cancellation: None,
        }
    }

    pub(crate) fn cancelled_by(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// One failed attempt as seen by the failure callback.
pub(crate) struct FailedAttempt<'e> {
    pub attempt: usize,
    /// `None` once the budget is spent and the error is about to be returned.
    pub retry_in: Option<Duration>,
    pub error: &'e anyhow::Error,
}

/// Runs `operation` until it succeeds, the budget runs out or the token fires.
/// The last error is returned unchanged when attempts are exhausted.
pub(crate) async fn retry_with_backoff<T, F, Fut, L>(
    schedule: RetrySchedule<'_>,
    mut operation: F,
    mut on_failure: L,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
    L: FnMut(FailedAttempt<'_>),
{
    for attempt in 1..=schedule.attempts {
        if schedule.cancellation.is_some_and(CancellationToken::is_cancelled) {
            return Err(anyhow!("retry cancelled"));
        }

        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let last = attempt == schedule.attempts;
        on_failure(FailedAttempt {
            attempt,
            retry_in: (!last).then_some(schedule.delay),
            error: &error,
        });
        if last {
            return Err(error);
        }

        if !pause(schedule.delay, schedule.cancellation).await {
            return Err(anyhow!("retry cancelled"));
        }
    }

    Err(anyhow!("retry budget is empty"))
}

/// Sleeps for `delay` unless the token fires first. Returns `false` when cancelled.
pub(crate) async fn cancellable_sleep(delay: Duration, token: &CancellationToken) -> bool {
    pause(delay, Some(token)).await
}

async fn pause(delay: Duration, cancellation: Option<&CancellationToken>) -> bool {
    let Some(token) = cancellation else {
        sleep(delay).await;
        return true;
    };

    if delay.is_zero() {
        yield_now().await;
        return !token.is_cancelled();
    }

    tokio::select! {
        _ = token.cancelled() => false,
        _ = sleep(delay) => true,
    }
}
