//! Bounded exponential backoff for upstream calls.
//!
//! Every external service (snapshot index, page fetch, embedding provider,
//! narrative provider) is retried through the same policy. Retries stay
//! inside the component that owns the call; permanent failures are returned
//! on the first attempt.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based), exponential with jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        if exp.is_zero() {
            return exp;
        }
        // up to +50% jitter so coalesced retries don't stampede upstream
        let jitter_ms = rand::rng().random_range(0..=exp.as_millis() as u64 / 2);
        (exp + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is exhausted. `is_transient` decides whether an error is retryable.
    pub async fn run<T, E, Op, Fut>(
        &self,
        label: &str,
        is_transient: impl Fn(&E) -> bool,
        mut op: Op,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    log::debug!("{label}: attempt {attempt} failed ({err}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let policy = RetryPolicy::immediate(3);
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = policy
            .run("test", |_| true, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_until_budget() {
        let policy = RetryPolicy::immediate(3);
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = policy
            .run("test", |_| true, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = RetryPolicy::immediate(5);
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = policy
            .run("test", |_| false, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let policy = RetryPolicy::immediate(4);
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = policy
            .run("test", |_| true, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("flaky".to_string())
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        for attempt in 1..10 {
            assert!(policy.delay_for(attempt) <= Duration::from_millis(500));
        }
    }
}
