//! Usage data sources
//!
//! Each source implements [`UsageProvider`]. The tracker never calls a provider directly:
//! every provider is wrapped in a [`GuardedProvider`] that retries transient failures under
//! one overall timeout and keeps a circuit breaker per source, so a dead accounting tool costs
//! one fast refusal instead of a full timeout on every refresh.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::debug;

use crate::error::GatewayError;
use crate::models::{SessionBlock, SessionBlocks, UsageSnapshot, UsageSource};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitOpen, CircuitSnapshot, RetryHandler, RetryPolicy,
};

#[async_trait]
pub trait UsageProvider: Send + Sync {
    fn kind(&self) -> UsageSource;

    async fn fetch(&self) -> Result<UsageSnapshot>;
}

/// A provider behind a circuit breaker and a retry handler.
///
/// The timeout bounds the whole retry sequence, backoff sleeps included.
pub struct GuardedProvider {
    provider: Box<dyn UsageProvider>,
    breaker: CircuitBreaker,
    retry: RetryHandler,
    timeout: Duration,
}

impl GuardedProvider {
    pub fn new(
        provider: Box<dyn UsageProvider>,
        timeout: Duration,
        breaker: CircuitBreakerConfig,
        retry: RetryPolicy,
    ) -> Self {
        let name = format!("usage:{}", provider.kind());
        Self {
            breaker: CircuitBreaker::new(name.clone(), breaker),
            retry: RetryHandler::new(name, retry),
            provider,
            timeout,
        }
    }

    pub fn kind(&self) -> UsageSource {
        self.provider.kind()
    }

    pub fn breaker(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    pub async fn fetch(&self) -> Result<UsageSnapshot> {
        self.breaker.call(|| self.fetch_with_retries()).await
    }

    async fn fetch_with_retries(&self) -> Result<UsageSnapshot> {
        let attempts = self.retry.execute(|| self.provider.fetch(), is_transient);
        match tokio::time::timeout(self.timeout, attempts).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::UpstreamTimeout {
                source_name: self.provider.kind().to_string(),
                timeout: self.timeout,
            }
            .into()),
        }
    }
}

/// Timeouts and I/O hiccups are worth another attempt; malformed output and missing
/// executables are not.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<CircuitOpen>().is_some() {
        return false;
    }
    if let Some(gateway) = err.downcast_ref::<GatewayError>() {
        return gateway.is_transient();
    }
    if err.downcast_ref::<serde_json::Error>().is_some() {
        return false;
    }
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        return io.kind() != std::io::ErrorKind::NotFound;
    }
    true
}

/// Reads the active billing block from the `ccusage` CLI
pub struct CcusageProvider {
    command: String,
    args: Vec<String>,
}

impl CcusageProvider {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Convert `ccusage blocks --json` output into a snapshot
    pub fn parse_output(stdout: &[u8], now: DateTime<Utc>) -> Result<UsageSnapshot> {
        let blocks: SessionBlocks =
            serde_json::from_slice(stdout).context("Failed to parse ccusage blocks output")?;

        match blocks.blocks.into_iter().find(|block| block.is_active) {
            Some(block) => Ok(snapshot_from_block(&block, now)),
            None => {
                debug!("ccusage reported no active block");
                let mut snapshot = UsageSnapshot::empty(UsageSource::Ccusage);
                snapshot.fetched_at = now;
                Ok(snapshot)
            }
        }
    }
}

#[async_trait]
impl UsageProvider for CcusageProvider {
    fn kind(&self) -> UsageSource {
        UsageSource::Ccusage
    }

    async fn fetch(&self) -> Result<UsageSnapshot> {
        let output = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run usage command: {}", self.command))?;

        if !output.status.success() {
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Self::parse_output(&output.stdout, Utc::now())
    }
}

fn snapshot_from_block(block: &SessionBlock, now: DateTime<Utc>) -> UsageSnapshot {
    let elapsed = (now - block.start_time).num_seconds().max(0) as u64;
    let elapsed_minutes = (elapsed as f64 / 60.0).max(1.0);
    let total_tokens = block.token_counts.total();

    let (tokens_per_minute, cost_per_hour) = match &block.burn_rate {
        Some(rate) => (rate.tokens_per_minute, rate.cost_per_hour),
        None => (
            total_tokens as f64 / elapsed_minutes,
            block.cost_usd / (elapsed_minutes / 60.0),
        ),
    };

    UsageSnapshot {
        source: UsageSource::Ccusage,
        input_tokens: block.token_counts.input_tokens,
        output_tokens: block.token_counts.output_tokens,
        cache_creation_tokens: block.token_counts.cache_creation_input_tokens,
        cache_read_tokens: block.token_counts.cache_read_input_tokens,
        session_cost: block.cost_usd,
        rolling_cost: block.cost_usd,
        session_requests: block.entries,
        session_messages: block.entries,
        lifetime_requests: block.entries,
        lifetime_messages: block.entries,
        burn_rate_per_hour: cost_per_hour,
        burn_rate_per_day: cost_per_hour * 24.0,
        tokens_per_minute,
        session_started_at: Some(block.start_time),
        session_duration_secs: elapsed,
        fetched_at: now,
        warnings: Vec::new(),
    }
}

/// Fetches a snapshot from another gateway or an accounting service over HTTP
#[cfg(feature = "remote")]
pub struct RemoteProvider {
    url: String,
    client: reqwest::Client,
}

#[cfg(feature = "remote")]
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum RemotePayload {
    Wrapped { usage: UsageSnapshot },
    Bare(UsageSnapshot),
}

#[cfg(feature = "remote")]
impl RemoteProvider {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for remote usage source")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[cfg(feature = "remote")]
#[async_trait]
impl UsageProvider for RemoteProvider {
    fn kind(&self) -> UsageSource {
        UsageSource::Remote
    }

    async fn fetch(&self) -> Result<UsageSnapshot> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Failed to reach remote usage source: {}", self.url))?
            .error_for_status()
            .context("Remote usage source returned an error status")?;

        let bytes = response
            .bytes()
            .await
            .context("Failed to read remote usage response")?;
        let payload: RemotePayload =
            serde_json::from_slice(&bytes).context("Failed to parse remote usage response")?;

        let mut snapshot = match payload {
            RemotePayload::Wrapped { usage } => usage,
            RemotePayload::Bare(usage) => usage,
        };
        snapshot.source = UsageSource::Remote;
        snapshot.fetched_at = Utc::now();
        Ok(snapshot)
    }
}

/// Last link of the chain; never fails
pub struct DegradedProvider;

impl DegradedProvider {
    pub fn snapshot(reasons: &[String]) -> UsageSnapshot {
        let mut snapshot = UsageSnapshot::empty(UsageSource::Degraded);
        snapshot.warnings.push(
            "Usage data unavailable from every source; admission is running on degraded data"
                .to_string(),
        );
        snapshot.warnings.extend(reasons.iter().cloned());
        snapshot
    }
}

#[async_trait]
impl UsageProvider for DegradedProvider {
    fn kind(&self) -> UsageSource {
        UsageSource::Degraded
    }

    async fn fetch(&self) -> Result<UsageSnapshot> {
        Ok(Self::snapshot(&[]))
    }
}
