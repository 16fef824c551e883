//! Retry with exponential backoff, jitter and a bounded per-call timeout
//!
//! Every collaborator call goes through [`RetryPolicy::run`]. Each attempt is
//! raced against `call_timeout_ms`; an elapsed attempt becomes
//! [`Error::Timeout`], which is transient and therefore retried.

use crate::config::RetryConfig;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a retried call plus the number of attempts it took
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result
    pub result: Result<T>,
    /// Attempts made, including the first
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    /// Retries beyond the first attempt
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Backoff policy shared by forward steps and compensations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Policy with default settings
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Per-call timeout
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.call_timeout_ms)
    }

    /// Maximum attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries + 1
    }

    /// Delay before the nth retry (0-based)
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let base_delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(retry as i32);

        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Run `operation` with timeout and retry, reporting attempts
    pub async fn run<F, Fut, T>(&self, operation_name: &str, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.call_timeout();
        let mut attempts = 0;
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.calculate_delay(attempt - 1);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_retries = self.config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }

            attempts += 1;
            let result = match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: operation_name.to_string(),
                    timeout_ms: self.config.call_timeout_ms,
                }),
            };

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            operation = operation_name,
                            attempt, "Succeeded on retry"
                        );
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) if !e.is_transient() => {
                    debug!(operation = operation_name, error = %e, "Non-retryable error");
                    return RetryOutcome {
                        result: Err(e),
                        attempts,
                    };
                }
                Err(e) => {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        of = self.config.max_retries + 1,
                        error = %e,
                        "Transient failure"
                    );
                    last_error = Some(e);
                }
            }
        }

        RetryOutcome {
            result: Err(last_error.unwrap_or_else(|| {
                Error::Unavailable(format!("{}: retries exhausted", operation_name))
            })),
            attempts,
        }
    }

    /// Run `operation` with timeout and retry
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation_name, operation).await.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            call_timeout_ms: 50,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(RetryConfig {
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter_factor: 0.0,
            ..RetryConfig::default()
        });

        assert_eq!(policy.calculate_delay(0).as_millis(), 1000);
        assert_eq!(policy.calculate_delay(1).as_millis(), 2000);
        assert_eq!(policy.calculate_delay(2).as_millis(), 4000);
        assert_eq!(policy.calculate_delay(10).as_millis(), 10_000);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let policy = RetryPolicy::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = policy
            .run("flaky", || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Unavailable("down".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.as_ref().ok(), Some(&7));
        assert_eq!(outcome.retries(), 2);
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let policy = RetryPolicy::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));

        let outcome: RetryOutcome<()> = policy
            .run("refused", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::InsufficientReserves("empty".into()))
                }
            })
            .await;

        assert!(matches!(outcome.result, Err(Error::InsufficientReserves(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_exhausts_retries() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 1,
            call_timeout_ms: 10,
            ..fast_config()
        });

        let outcome: RetryOutcome<()> = policy
            .run("hang", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(outcome.result, Err(Error::Timeout { .. })));
        assert_eq!(outcome.attempts, 2);
    }
}
