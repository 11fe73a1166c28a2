use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Exponential backoff bounds for a retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: usize,
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: usize) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    Abort,
}

/// Runs `operation` until it succeeds, `classify` aborts, attempts run out, or
/// `cancellation` fires. `on_failure` sees every failed attempt and whether
/// another one follows.
pub async fn retry_with_backoff<T, F, Fut, C, L>(
    policy: RetryPolicy,
    cancellation: &CancellationToken,
    mut operation: F,
    mut classify: C,
    mut on_failure: L,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
    C: FnMut(&anyhow::Error) -> RetryDisposition,
    L: FnMut(usize, Duration, &anyhow::Error, bool),
{
    let mut attempt = 0;
    loop {
        if cancellation.is_cancelled() {
            return Err(anyhow!("retry cancelled"));
        }
        attempt += 1;

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let will_retry =
            classify(&err) == RetryDisposition::Retry && attempt < policy.max_attempts;
        let delay = policy.delay_after(attempt);
        on_failure(attempt, delay, &err, will_retry);
        if !will_retry {
            return Err(err);
        }

        if delay.is_zero() {
            yield_now().await;
            continue;
        }
        tokio::select! {
            _ = cancellation.cancelled() => return Err(err.context("retry cancelled")),
            _ = sleep(delay) => {}
        }
    }
}
