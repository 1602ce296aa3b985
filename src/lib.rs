//! Claude Usage Gateway
//!
//! A streaming admission gateway that sits in front of a metered upstream (Claude) and
//! decides, from live usage data, whether more expensive work may start.
//!
//! ## Core Features
//!
//! - **Usage tracking**: cached usage snapshot refreshed through a fallback chain
//!   (`ccusage` CLI, remote accounting endpoint, local JSONL logs, degraded)
//! - **Cost-aware admission**: hourly, daily, token-rate, per-request and per-client
//!   ceilings with retry guidance on denial
//! - **Resilience**: circuit breakers and retry with exponential backoff around every
//!   upstream fetch
//! - **Long-lived connections**: server-sent events and WebSockets with heartbeats and a
//!   bounded graceful shutdown
//! - **Streaming responses**: buffered gzip bodies and incrementally emitted JSON arrays
//!
//! ## Architecture Overview
//!
//! - [`models`] - Usage log records, snapshots, limits and client records
//! - [`usage`] - [`UsageTracker`] and its data sources
//! - [`limiter`] - [`CostAwareLimiter`] admission decisions
//! - [`resilience`] - Circuit breaker and retry handler
//! - [`connections`] - Connection registry, heartbeats and the SSE/WebSocket transports
//! - [`encoder`] - Buffered and incremental response encoding
//! - [`server`] - [`Gateway`] state and the axum router
//! - [`pricing`] - Built-in model prices for log entries without a recorded cost
//! - [`config`] - Configuration with TOML file and environment variable support
//! - [`logging`] - Structured logging with JSON and pretty-print formats
//! - [`display`] - Terminal output for the `usage` command
//!
//! ## Main Entry Point
//!
//! ```rust,no_run
//! use claude_usage_gateway::{config::Config, server, Gateway};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let bind = config.server.bind.clone();
//! let gateway = Gateway::new(config)?;
//! server::serve(gateway, &bind).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connections;
pub mod display;
pub mod encoder;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod models;
pub mod pricing;
pub mod resilience;
pub mod server;
pub mod usage;

pub use error::{GatewayError, Result};
pub use limiter::{AdmissionDecision, CostAwareLimiter, DenialReason};
pub use models::*;
pub use server::Gateway;
pub use usage::UsageTracker;
