//! Retry with exponential backoff
//!
//! Attempts run up to `max_retries + 1` times. Before attempt `n + 1` the handler sleeps
//! `min(base_delay * backoff_factor^n, max_delay)`. Errors the predicate rejects propagate
//! at once without consuming a retry.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the failed attempt with zero-based index `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, Clone)]
pub struct RetryHandler {
    name: String,
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }

    /// Run `operation`, retrying failures for which `is_retryable` returns true.
    pub async fn execute<T, E, F, Fut, P>(&self, mut operation: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            operation = %self.name,
                            attempt = attempt + 1,
                            "Succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if attempt < self.policy.max_retries && is_retryable(&err) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        operation = %self.name,
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
