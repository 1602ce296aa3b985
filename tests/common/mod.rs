#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use claude_usage_gateway::config::Config;
use claude_usage_gateway::resilience::{CircuitBreakerConfig, RetryPolicy};
use claude_usage_gateway::usage::UsageProvider;
use claude_usage_gateway::{Gateway, UsageSnapshot, UsageSource, UsageTracker};

/// Provider that always returns the same snapshot, or always fails
pub struct StaticProvider {
    pub kind: UsageSource,
    pub snapshot: Option<UsageSnapshot>,
    pub calls: Arc<AtomicU32>,
}

impl StaticProvider {
    pub fn ok(snapshot: UsageSnapshot) -> Self {
        Self {
            kind: snapshot.source,
            snapshot: Some(snapshot),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn failing(kind: UsageSource) -> Self {
        Self {
            kind,
            snapshot: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl UsageProvider for StaticProvider {
    fn kind(&self) -> UsageSource {
        self.kind
    }

    async fn fetch(&self) -> Result<UsageSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.snapshot
            .clone()
            .ok_or_else(|| anyhow!("{} is not reachable", self.kind))
    }
}

pub fn no_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        ..RetryPolicy::default()
    }
}

pub fn tracker_with(providers: Vec<Box<dyn UsageProvider>>) -> UsageTracker {
    UsageTracker::new(
        providers,
        Duration::from_secs(60),
        Duration::from_secs(5),
        CircuitBreakerConfig::default(),
        no_retry(),
    )
}

/// Snapshot with the given hourly burn rate and nothing else set
pub fn snapshot_burning(per_hour: f64) -> UsageSnapshot {
    let mut snapshot = UsageSnapshot::empty(UsageSource::Ccusage);
    snapshot.burn_rate_per_hour = per_hour;
    snapshot.burn_rate_per_day = per_hour * 24.0;
    snapshot
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.connections.shutdown_deadline_ms = 200;
    config
}

pub fn gateway_with(snapshot: UsageSnapshot) -> Arc<Gateway> {
    let tracker = tracker_with(vec![Box::new(StaticProvider::ok(snapshot))]);
    Gateway::with_tracker(test_config(), tracker)
}

pub fn create_test_jsonl(dir: &Path, filename: &str, content: &str) -> Result<()> {
    let file_path = dir.join(filename);
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&file_path, content)?;
    Ok(())
}

/// One assistant log line in the shape Claude writes to `projects/**/*.jsonl`
pub fn log_line(timestamp: &str, message_id: &str, request_id: &str, cost: Option<f64>) -> String {
    let cost = cost
        .map(|c| format!(r#","costUSD":{}"#, c))
        .unwrap_or_default();
    format!(
        r#"{{"timestamp":"{}","requestId":"{}","message":{{"id":"{}","model":"claude-3-5-sonnet-20241022","usage":{{"input_tokens":1000,"output_tokens":500,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}}}{}}}"#,
        timestamp, request_id, message_id, cost
    )
}
