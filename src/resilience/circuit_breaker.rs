//! Circuit breaker for unreliable upstream operations
//!
//! One [`CircuitBreaker`] guards one protected operation. State transitions are the only
//! place the failure counter changes:
//!
//! ```text
//! Closed --(failures == threshold)--> Open --(recovery timeout, next call)--> HalfOpen
//!   ^                                   ^                                      |
//!   +------------- success -------------|------------- failure ----------------+
//! ```
//!
//! While open, calls fail immediately with [`CircuitOpen`] and the wrapped future is never
//! created. Only a single trial call is let through while half-open. A trial whose future is
//! dropped before it resolves counts as neither outcome: the circuit goes back to open with a
//! fresh timestamp.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Returned instead of running the operation while the breaker refuses calls
#[derive(Debug, Clone, Error)]
#[error("circuit '{operation}' is {state} ({failure_count} consecutive failures)")]
pub struct CircuitOpen {
    pub operation: String,
    pub failure_count: u32,
    pub state: CircuitState,
    pub retry_after: Duration,
}

impl From<CircuitOpen> for GatewayError {
    fn from(open: CircuitOpen) -> Self {
        GatewayError::ServiceUnavailable {
            operation: open.operation,
            failure_count: open.failure_count,
            state: open.state,
            retry_after: open.retry_after.as_secs().max(1),
        }
    }
}

/// Point-in-time view of a breaker, served by the usage endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs(),
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// The error type only needs to absorb [`CircuitOpen`]; both [`GatewayError`] and
    /// `anyhow::Error` do.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpen>,
    {
        let trial = self.acquire().map_err(E::from)?;
        let mut pending = PendingTrial {
            breaker: self,
            armed: trial,
        };

        let result = operation().await;
        pending.armed = false;

        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }

    /// Decide whether a call may proceed, moving Open -> HalfOpen when the timeout has passed.
    ///
    /// `Ok(true)` means the caller holds the half-open trial.
    fn acquire(&self) -> Result<bool, CircuitOpen> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.recovery_timeout);
                if elapsed >= self.config.recovery_timeout {
                    info!(breaker = %self.name, "Circuit half-open, allowing trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(true)
                } else {
                    Err(self.refusal(&inner, self.config.recovery_timeout - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.refusal(&inner, Duration::from_secs(1)))
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit closed after successful trial call");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.trial_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen => {
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "Trial call failed, circuit re-opened"
                );
                inner.state = CircuitState::Open;
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    "Failure threshold reached, circuit opened"
                );
                inner.state = CircuitState::Open;
            }
            _ => {
                debug!(breaker = %self.name, failures = inner.failure_count, "Recorded failure");
            }
        }
    }

    fn on_abandoned_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            warn!(breaker = %self.name, "Trial call dropped before completing, circuit re-opened");
            inner.state = CircuitState::Open;
            inner.trial_in_flight = false;
            inner.last_failure = Some(Instant::now());
        }
    }

    fn refusal(&self, inner: &Inner, retry_after: Duration) -> CircuitOpen {
        CircuitOpen {
            operation: self.name.clone(),
            failure_count: inner.failure_count,
            state: inner.state,
            retry_after,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held across the operation of a half-open trial; re-opens the circuit if dropped armed
struct PendingTrial<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for PendingTrial<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.on_abandoned_trial();
        }
    }
}
