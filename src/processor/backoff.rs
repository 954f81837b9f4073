use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;

/// Exponential backoff policy for transient failures.
///
/// The ladder itself is not cancellable; callers that must stop promptly drop the future
/// (see `rpc::chain::CancellableChain`).
#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<usize>,
}

impl RetryBackoff {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: None,
        }
    }

    pub(crate) fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDisposition {
    Retry,
    Abort,
}

/// Runs `operation` until it succeeds, the classifier aborts or attempts run out.
/// `on_retry` sees every failure that is eligible for a retry, with a flag telling whether
/// another attempt follows.
pub(crate) async fn retry_with_backoff<T, F, Fut, L, C>(
    config: RetryBackoff,
    mut operation: F,
    mut on_retry: L,
    mut classify_error: C,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
    L: FnMut(usize, Duration, &anyhow::Error, bool),
    C: FnMut(usize, &anyhow::Error) -> RetryDisposition,
{
    let mut attempt = 0;
    let mut backoff = config.initial_delay;

    loop {
        attempt += 1;

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if classify_error(attempt, &err) == RetryDisposition::Abort {
            return Err(err);
        }

        let exhausted = config.max_attempts.is_some_and(|max| attempt >= max);
        on_retry(attempt, backoff, &err, !exhausted);
        if exhausted {
            return Err(err);
        }

        pause(backoff).await;
        backoff = next_backoff(backoff, config.max_delay);
    }
}

async fn pause(delay: Duration) {
    if delay.is_zero() {
        yield_now().await;
    } else {
        sleep(delay).await;
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }
    current.saturating_mul(2).min(max_backoff)
}
