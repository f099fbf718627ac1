//! Bounded retry with exponential backoff for platform calls

use converge_platform::PlatformError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy shared by the prober and the executor.
///
/// Only transient failures are retried; anything else is returned on the
/// first attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    multiplier: f64,
    max_backoff: Duration,
}

/// A value and the number of retries it took
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

/// Final error of a retried call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub error: PlatformError,
    pub retries: u32,
}

impl RetryFailure {
    /// Whether the call gave up on a still-transient error
    pub fn exhausted(&self) -> bool {
        self.error.is_transient()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2), 2.0, Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, multiplier: f64, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            multiplier: multiplier.max(1.0),
            max_backoff,
        }
    }

    /// Retry without waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, 1.0, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before retry number `retry` (1-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * factor)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Run `call` until it succeeds, fails non-transiently, or the attempt
    /// budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<Retried<T>, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let mut retries = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(Retried { value, retries }),
                Err(error) if error.is_transient() && retries + 1 < self.max_attempts => {
                    retries += 1;
                    let backoff = self.backoff_for(retries);
                    warn!(
                        operation,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Transient platform failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => return Err(RetryFailure { error, retries }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2), 2.0, Duration::from_secs(5));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let attempts = &AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("status", move || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(PlatformError::Transient("conflict".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, Retried { value: 7, retries: 1 });
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let attempts = &AtomicU32::new(0);
        let failure = RetryPolicy::immediate(3)
            .run("converge", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PlatformError::rejected("bad values"))
            })
            .await
            .unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(failure.retries, 0);
        assert!(!failure.exhausted());
    }

    #[tokio::test]
    async fn test_attempt_budget_is_bounded() {
        let attempts = &AtomicU32::new(0);
        let failure = RetryPolicy::immediate(3)
            .run("put_secret", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PlatformError::Unreachable("down".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(failure.retries, 2);
        assert!(failure.exhausted());
    }
}
