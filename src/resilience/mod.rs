//! Resilience primitives for upstream calls
//!
//! - [`CircuitBreaker`] fails fast once an operation keeps failing and lets a single trial
//!   call through after the recovery timeout.
//! - [`RetryHandler`] re-runs idempotent operations with capped exponential backoff.
//!
//! The usage data sources compose both: the breaker wraps the whole retry sequence, so one
//! exhausted retry sequence counts as one breaker failure.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitOpen, CircuitSnapshot, CircuitState,
};
pub use retry::{RetryHandler, RetryPolicy};
