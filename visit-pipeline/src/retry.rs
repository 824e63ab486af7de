use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::StoreError;
use crate::metrics_consts::SINK_RETRIES;

#[derive(Copy, Clone, Debug)]
/// Bounded exponential backoff used by every sink when talking to its store.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<Duration>,
    /// Total attempts, the first one included.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Option<Duration>,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Retry immediately, used by tests that inject failures.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(1, Duration::ZERO, None, max_attempts)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff to wait after `attempt` failed attempts (starting at 0).
    pub fn time_until_next_retry(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_coefficient
            .checked_pow(attempt)
            .unwrap_or(u32::MAX);
        let candidate = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate, max_interval),
            None => candidate,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. On failure, returns the last error and the number of
    /// attempts made.
    pub async fn retry<T, F, Fut>(
        &self,
        sink: &'static str,
        mut op: F,
    ) -> Result<T, (StoreError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !err.is_retryable() {
                        return Err((err, attempt));
                    }
                    let backoff = self.time_until_next_retry(attempt - 1);
                    warn!(
                        sink,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "store call failed, retrying: {err:#}"
                    );
                    metrics::counter!(SINK_RETRIES, "sink" => sink).increment(1);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(100),
            maximum_interval: Some(Duration::from_secs(5)),
            max_attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy::new(
            2,
            Duration::from_millis(100),
            Some(Duration::from_millis(500)),
            5,
        );

        assert_eq!(policy.time_until_next_retry(0), Duration::from_millis(100));
        assert_eq!(policy.time_until_next_retry(1), Duration::from_millis(200));
        assert_eq!(policy.time_until_next_retry(2), Duration::from_millis(400));
        assert_eq!(policy.time_until_next_retry(3), Duration::from_millis(500));
        assert_eq!(policy.time_until_next_retry(64), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::immediate(3);

        let result = policy
            .retry("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Unavailable("down".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::immediate(4);

        let result: Result<(), _> = policy
            .retry("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Unavailable("down".to_string()))
            })
            .await;

        let (err, attempts) = result.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn does_not_retry_rejections() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::immediate(4);

        let result: Result<(), _> = policy
            .retry("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Corrupt(
                    serde_json::from_str::<u32>("nope").unwrap_err(),
                ))
            })
            .await;

        assert!(matches!(result, Err((StoreError::Corrupt(_), 1))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
