//! Core Data Models
//!
//! This module defines the data structures shared by the usage tracker, the cost-aware
//! limiter and the HTTP surface.
//!
//! ## Data Flow
//!
//! 1. **Raw Data**: [`UsageEntry`] lines from Claude JSONL logs and [`SessionBlock`] records
//!    from the `ccusage` CLI
//! 2. **Snapshot**: [`UsageSnapshot`] - the cached, source-tagged view of metered usage
//! 3. **Admission**: [`CostLimits`] and [`ClientUsageRecord`] - thresholds and per-client
//!    spend consulted before work is admitted
//!
//! ## Core Types
//!
//! ### Upstream Usage Records
//! - [`UsageEntry`] - Top-level wrapper for a single usage log line
//! - [`MessageData`] - The message the usage belongs to
//! - [`UsageData`] - Token consumption details (input, output, cache operations)
//! - [`SessionBlock`] - Active billing block as reported by `ccusage blocks --json`
//!
//! ### Tracking
//! - [`UsageSnapshot`] - Token counts, costs, counters and burn rates
//! - [`ApiCallUsage`] - One upstream call's usage, recorded between refreshes
//! - [`UsageLimitCheck`] - Result of comparing burn rates against limits
//!
//! ### Admission
//! - [`CostLimits`] - Immutable cost and rate ceilings
//! - [`ClientUsageRecord`] - Per-client hourly window
//!
//! ## Features
//!
//! - **Serde Integration**: Every public type serializes for the usage endpoint
//! - **Derived Metrics**: Cache efficiency, tokens per dollar and average request cost are
//!   computed on demand and never stored

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEntry {
    pub timestamp: String,
    pub message: MessageData,
    #[serde(rename = "costUSD", alias = "cost_usd", default)]
    pub cost_usd: Option<f64>,
    #[serde(rename = "requestId", alias = "request_id", default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageData {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageData {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl UsageEntry {
    /// Deduplication key in `messageId:requestId` form
    pub fn unique_hash(&self) -> Option<String> {
        let message_id = self.message.id.as_deref().filter(|id| !id.is_empty())?;
        let request_id = self.request_id.as_deref().filter(|id| !id.is_empty())?;
        Some(format!("{}:{}", message_id, request_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBlocks {
    pub blocks: Vec<SessionBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBlock {
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "endTime")]
    pub end_time: DateTime<Utc>,
    #[serde(rename = "isActive", default)]
    pub is_active: bool,
    #[serde(default)]
    pub entries: u64,
    #[serde(rename = "tokenCounts")]
    pub token_counts: TokenCounts,
    #[serde(rename = "costUSD")]
    pub cost_usd: f64,
    #[serde(rename = "burnRate", default)]
    pub burn_rate: Option<BurnRate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenCounts {
    #[serde(rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(rename = "outputTokens")]
    pub output_tokens: u64,
    #[serde(rename = "cacheCreationInputTokens")]
    pub cache_creation_input_tokens: u64,
    #[serde(rename = "cacheReadInputTokens")]
    pub cache_read_input_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BurnRate {
    #[serde(rename = "tokensPerMinute")]
    pub tokens_per_minute: f64,
    #[serde(rename = "costPerHour")]
    pub cost_per_hour: f64,
}

impl TokenCounts {
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

/// Where a snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    Ccusage,
    Remote,
    LocalLogs,
    Degraded,
}

impl UsageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageSource::Ccusage => "ccusage",
            UsageSource::Remote => "remote",
            UsageSource::LocalLogs => "local_logs",
            UsageSource::Degraded => "degraded",
        }
    }

    /// Degraded snapshots are synthetic and must not be trusted for accounting
    pub fn is_authoritative(&self) -> bool {
        !matches!(self, UsageSource::Degraded)
    }
}

impl fmt::Display for UsageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub source: UsageSource,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub session_cost: f64,
    pub rolling_cost: f64,
    pub session_requests: u64,
    pub session_messages: u64,
    pub lifetime_requests: u64,
    pub lifetime_messages: u64,
    pub burn_rate_per_hour: f64,
    pub burn_rate_per_day: f64,
    pub tokens_per_minute: f64,
    pub session_started_at: Option<DateTime<Utc>>,
    pub session_duration_secs: u64,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl UsageSnapshot {
    /// Empty snapshot tagged with `source`
    pub fn empty(source: UsageSource) -> Self {
        Self {
            source,
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            session_cost: 0.0,
            rolling_cost: 0.0,
            session_requests: 0,
            session_messages: 0,
            lifetime_requests: 0,
            lifetime_messages: 0,
            burn_rate_per_hour: 0.0,
            burn_rate_per_day: 0.0,
            tokens_per_minute: 0.0,
            session_started_at: None,
            session_duration_secs: 0,
            fetched_at: Utc::now(),
            warnings: Vec::new(),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    /// cache-read / (cache-read + cache-created), 0 when nothing was cacheable
    pub fn cache_efficiency(&self) -> f64 {
        let cacheable = self.cache_read_tokens + self.cache_creation_tokens;
        if cacheable == 0 {
            0.0
        } else {
            self.cache_read_tokens as f64 / cacheable as f64
        }
    }

    pub fn tokens_per_dollar(&self) -> f64 {
        if self.session_cost > 0.0 {
            self.total_tokens() as f64 / self.session_cost
        } else {
            0.0
        }
    }

    pub fn average_cost_per_request(&self) -> f64 {
        if self.session_requests > 0 {
            self.session_cost / self.session_requests as f64
        } else {
            0.0
        }
    }

    /// Fold one recorded call into the session and lifetime counters
    pub fn apply(&mut self, call: &ApiCallUsage) {
        self.input_tokens += call.input_tokens;
        self.output_tokens += call.output_tokens;
        self.cache_creation_tokens += call.cache_creation_tokens;
        self.cache_read_tokens += call.cache_read_tokens;

        let cost = call.sanitized_cost();
        self.session_cost += cost;
        self.rolling_cost += cost;

        self.session_requests += 1;
        self.lifetime_requests += 1;
        self.session_messages += call.message_count;
        self.lifetime_messages += call.message_count;
    }

    /// Compare burn rates with the given limits, warning above 80% of either
    pub fn check_limits(&self, hourly_limit: f64, daily_limit: f64) -> UsageLimitCheck {
        let mut warnings = Vec::new();

        let rates = [
            ("Hourly", "hourly", self.burn_rate_per_hour, hourly_limit),
            ("Daily", "daily", self.burn_rate_per_day, daily_limit),
        ];
        for (label, window, rate, limit) in rates {
            if limit <= 0.0 {
                continue;
            }
            if rate > limit {
                warnings.push(format!(
                    "{} burn rate ${:.2} exceeds the {} limit of ${:.2}",
                    label, rate, window, limit
                ));
            } else if rate > limit * 0.8 {
                warnings.push(format!(
                    "{} burn rate ${:.2} is above 80% of the {} limit of ${:.2}",
                    label, rate, window, limit
                ));
            }
        }

        UsageLimitCheck {
            within_limits: self.burn_rate_per_hour <= hourly_limit
                && self.burn_rate_per_day <= daily_limit,
            warnings,
        }
    }

    pub fn brief(&self) -> UsageBrief {
        UsageBrief {
            source: self.source,
            session_cost: self.session_cost,
            burn_rate_per_hour: self.burn_rate_per_hour,
            total_tokens: self.total_tokens(),
        }
    }
}

/// Usage attached to every few heartbeats
#[derive(Debug, Clone, Serialize)]
pub struct UsageBrief {
    pub source: UsageSource,
    pub session_cost: f64,
    pub burn_rate_per_hour: f64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLimitCheck {
    pub within_limits: bool,
    pub warnings: Vec<String>,
}

/// Usage of a single upstream call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiCallUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    pub cost: f64,
    #[serde(default = "default_message_count")]
    pub message_count: u64,
}

fn default_message_count() -> u64 {
    1
}

impl ApiCallUsage {
    pub fn new(input_tokens: u64, output_tokens: u64, cost: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            cost,
            message_count: 1,
        }
    }

    pub fn with_cache(mut self, created: u64, read: u64) -> Self {
        self.cache_creation_tokens = created;
        self.cache_read_tokens = read;
        self
    }

    pub fn with_messages(mut self, message_count: u64) -> Self {
        self.message_count = message_count;
        self
    }

    /// Negative or non-finite costs are recorded as zero so totals never go backwards
    pub fn sanitized_cost(&self) -> f64 {
        if self.cost.is_finite() && self.cost > 0.0 {
            self.cost
        } else {
            0.0
        }
    }
}

/// Cost and rate ceilings enforced by the limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostLimits {
    pub hourly_limit: f64,
    pub daily_limit: f64,
    pub monthly_limit: f64,
    pub per_request_limit: f64,
    /// Share of `hourly_limit` a single client may spend per hour
    pub client_hourly_fraction: f64,
    pub max_tokens_per_minute: f64,
    pub warning_threshold_pct: f64,
    pub critical_threshold_pct: f64,
}

impl Default for CostLimits {
    fn default() -> Self {
        Self {
            hourly_limit: 10.0,
            daily_limit: 100.0,
            monthly_limit: 2000.0,
            per_request_limit: 1.0,
            client_hourly_fraction: 0.1,
            max_tokens_per_minute: 100_000.0,
            warning_threshold_pct: 80.0,
            critical_threshold_pct: 95.0,
        }
    }
}

impl CostLimits {
    pub fn client_hourly_limit(&self) -> f64 {
        self.hourly_limit * self.client_hourly_fraction
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientUsageRecord {
    pub client_id: String,
    pub hour_requests: u64,
    pub hour_cost: f64,
    pub last_request_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
}

impl ClientUsageRecord {
    pub fn new(client_id: String, window_start: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            client_id,
            hour_requests: 0,
            hour_cost: 0.0,
            last_request_at: now,
            window_start,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingData {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
    pub cache_creation_input_token_cost: Option<f64>,
    pub cache_read_input_token_cost: Option<f64>,
}
