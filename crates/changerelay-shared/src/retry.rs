//! Retry logic and backoff strategies

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use crate::config::RetryConfig;

/// Retry policy trait
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempt: u32, error: &dyn std::error::Error) -> bool;
    fn delay(&self, attempt: u32) -> Duration;
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff retry policy
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: RetryConfig,
    max_attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig, max_attempts: u32) -> Self {
        Self {
            config,
            max_attempts,
        }
    }

    /// Backoff that never gives up, for loops that must stay alive
    pub fn unbounded(config: RetryConfig) -> Self {
        Self::new(config, u32::MAX)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, _error: &dyn std::error::Error) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base_delay = Duration::from_millis(self.config.initial_delay_ms);
        let factor = self.config.multiplier.powi(attempt.min(63) as i32);
        let delay_ms = (base_delay.as_millis() as f64 * factor)
            .min(self.config.max_delay_ms as f64) as u64;

        let jitter = fastrand::u64(0..=self.config.jitter_ms);
        Duration::from_millis(delay_ms + jitter)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Retry executor
pub struct RetryExecutor<P: RetryPolicy> {
    policy: P,
}

impl<P: RetryPolicy> RetryExecutor<P> {
    pub fn new(policy: P) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Execute an operation, sleeping between failed attempts until the policy gives up
    pub async fn execute<F, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Pin<Box<dyn Future<Output = Result<T, E>> + Send>>,
        E: std::error::Error + Send + 'static,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} attempts", attempt + 1);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !self.policy.should_retry(attempt, &error) {
                        warn!(
                            "Operation failed after {} attempts: {}",
                            attempt + 1,
                            error
                        );
                        return Err(error);
                    }

                    let delay = self.policy.delay(attempt);
                    warn!(
                        "Operation failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        error
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error)]
    #[error("Test error")]
    struct TestError;

    #[tokio::test]
    async fn test_exponential_backoff_success_after_retries() {
        let config = RetryConfig {
            initial_delay_ms: 10,
            max_delay_ms: 1000,
            multiplier: 2.0,
            jitter_ms: 5,
        };

        let executor = RetryExecutor::new(ExponentialBackoff::new(config, 3));
        let attempt_count = Arc::new(AtomicU32::new(0));

        let attempt_count_clone = attempt_count.clone();
        let result = executor
            .execute(move || {
                let attempt_count = attempt_count_clone.clone();
                Box::pin(async move {
                    let current_attempt = attempt_count.fetch_add(1, Ordering::Relaxed);
                    if current_attempt < 2 {
                        Err(TestError)
                    } else {
                        Ok("success")
                    }
                })
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempt_count.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_executor_gives_up_at_max_attempts() {
        let config = RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            jitter_ms: 0,
        };
        let executor = RetryExecutor::new(ExponentialBackoff::new(config, 2));
        let attempt_count = Arc::new(AtomicU32::new(0));

        let attempt_count_clone = attempt_count.clone();
        let result: Result<(), TestError> = executor
            .execute(move || {
                let attempt_count = attempt_count_clone.clone();
                Box::pin(async move {
                    attempt_count.fetch_add(1, Ordering::Relaxed);
                    Err(TestError)
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = ExponentialBackoff::new(
            RetryConfig {
                initial_delay_ms: 100,
                max_delay_ms: 1_000,
                multiplier: 2.0,
                jitter_ms: 0,
            },
            10,
        );

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(9), Duration::from_millis(1_000));
        assert_eq!(policy.delay(500), Duration::from_millis(1_000));
    }

    #[test]
    fn test_unbounded_keeps_retrying() {
        let policy = ExponentialBackoff::unbounded(RetryConfig::default());
        assert!(policy.should_retry(1_000_000, &TestError));
    }
}
