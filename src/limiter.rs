//! Cost-aware admission
//!
//! [`CostAwareLimiter`] reads the tracker's snapshot and decides whether a client may start
//! more metered work. Rules are evaluated in a fixed order and the first violated rule wins:
//!
//! | Rule | Compared value | Retry after |
//! |------|----------------|-------------|
//! | hourly cost ceiling | hourly burn rate | 3600s |
//! | daily cost ceiling | daily burn rate | 86400s |
//! | token-rate ceiling | tokens per minute | 60s |
//! | per-request ceiling | average cost per request | 300s |
//! | per-client hourly ceiling | client's spend this hour | rest of the client's hour |
//!
//! Checking and recording are separate steps: two requests from one client can both pass
//! the per-client rule before either reports its cost through
//! [`CostAwareLimiter::record_client_cost`].

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, DurationRound, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::models::{ClientUsageRecord, CostLimits, UsageSnapshot, UsageSource};
use crate::usage::UsageTracker;

const MAX_CLIENT_ID_LEN: usize = 128;
const DAYS_PER_MONTH: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    HourlyCostLimit,
    DailyCostLimit,
    TokenRateLimit,
    PerRequestCostLimit,
    ClientHourlyLimit,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::HourlyCostLimit => "hourly_cost_limit",
            DenialReason::DailyCostLimit => "daily_cost_limit",
            DenialReason::TokenRateLimit => "token_rate_limit",
            DenialReason::PerRequestCostLimit => "per_request_cost_limit",
            DenialReason::ClientHourlyLimit => "client_hourly_limit",
        }
    }

    /// Fixed reset window; the per-client window depends on the client's record
    fn reset_window_secs(&self) -> Option<u64> {
        match self {
            DenialReason::HourlyCostLimit => Some(3600),
            DenialReason::DailyCostLimit => Some(86_400),
            DenialReason::TokenRateLimit => Some(60),
            DenialReason::PerRequestCostLimit => Some(300),
            DenialReason::ClientHourlyLimit => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    pub warnings: Vec<String>,
    pub usage_source: UsageSource,
}

impl AdmissionDecision {
    fn allow(warnings: Vec<String>, usage_source: UsageSource) -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
            retry_after_seconds: None,
            warnings,
            usage_source,
        }
    }

    fn deny(
        reason: DenialReason,
        message: String,
        retry_after: u64,
        usage_source: UsageSource,
    ) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            message: Some(message),
            retry_after_seconds: Some(retry_after),
            warnings: Vec::new(),
            usage_source,
        }
    }

    /// Turn a denial into the error the HTTP layer answers with
    pub fn into_result(self) -> Result<Self> {
        match self.reason {
            Some(reason) if !self.allowed => Err(GatewayError::RateLimitExceeded {
                reason: reason.as_str().to_string(),
                message: self.message.unwrap_or_default(),
                retry_after: self.retry_after_seconds.unwrap_or(60),
            }),
            _ => Ok(self),
        }
    }
}

pub struct CostAwareLimiter {
    tracker: Arc<UsageTracker>,
    limits: CostLimits,
    clients: DashMap<String, ClientUsageRecord>,
    retention: Duration,
}

impl CostAwareLimiter {
    pub fn new(tracker: Arc<UsageTracker>, limits: CostLimits, retention_hours: i64) -> Self {
        Self {
            tracker,
            limits,
            clients: DashMap::new(),
            retention: Duration::hours(retention_hours),
        }
    }

    pub fn limits(&self) -> &CostLimits {
        &self.limits
    }

    /// Decide whether `client_id` may proceed, updating its record when admitted
    pub async fn check_limits(&self, client_id: &str) -> Result<AdmissionDecision> {
        validate_client_id(client_id)?;
        let snapshot = self.tracker.get_current_usage(false).await;
        Ok(self.check_limits_at(client_id, &snapshot, Utc::now()))
    }

    /// Same as [`check_limits`](Self::check_limits) but fails with
    /// [`GatewayError::RateLimitExceeded`] on denial
    pub async fn enforce_limits(&self, client_id: &str) -> Result<AdmissionDecision> {
        self.check_limits(client_id).await?.into_result()
    }

    /// Rule evaluation against an explicit snapshot and clock
    pub fn check_limits_at(
        &self,
        client_id: &str,
        snapshot: &UsageSnapshot,
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        let limits = &self.limits;
        let source = snapshot.source;

        let global_rules = [
            (
                DenialReason::HourlyCostLimit,
                snapshot.burn_rate_per_hour,
                limits.hourly_limit,
                "Hourly burn rate",
            ),
            (
                DenialReason::DailyCostLimit,
                snapshot.burn_rate_per_day,
                limits.daily_limit,
                "Daily burn rate",
            ),
            (
                DenialReason::TokenRateLimit,
                snapshot.tokens_per_minute,
                limits.max_tokens_per_minute,
                "Token rate",
            ),
            (
                DenialReason::PerRequestCostLimit,
                snapshot.average_cost_per_request(),
                limits.per_request_limit,
                "Estimated cost per request",
            ),
        ];

        for (reason, value, limit, label) in global_rules {
            if value > limit {
                let message = if reason == DenialReason::TokenRateLimit {
                    format!("{} {:.0}/min exceeds limit {:.0}/min", label, value, limit)
                } else {
                    format!("{} ${:.2} exceeds limit ${:.2}", label, value, limit)
                };
                let retry_after = reason.reset_window_secs().unwrap_or(60);
                info!(
                    client_id = %client_id,
                    reason = reason.as_str(),
                    retry_after,
                    "Admission denied"
                );
                return AdmissionDecision::deny(reason, message, retry_after, source);
            }
        }

        let window_start = hour_window_start(now);
        let client_limit = limits.client_hourly_limit();

        let mut record = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientUsageRecord::new(client_id.to_string(), window_start, now));
        roll_window(&mut record, window_start);

        if record.hour_cost >= client_limit {
            let window_end = record.window_start + Duration::hours(1);
            let retry_after = (window_end - now).num_seconds().max(1) as u64;
            let message = format!(
                "Client hourly spend ${:.2} reached limit ${:.2}",
                record.hour_cost, client_limit
            );
            info!(
                client_id = %client_id,
                reason = DenialReason::ClientHourlyLimit.as_str(),
                retry_after,
                "Admission denied"
            );
            return AdmissionDecision::deny(
                DenialReason::ClientHourlyLimit,
                message,
                retry_after,
                source,
            );
        }

        record.hour_requests += 1;
        record.last_request_at = now;
        let client_spend = record.hour_cost;
        drop(record);

        let mut warnings = self.threshold_warnings(snapshot, client_spend);
        if !source.is_authoritative() {
            warnings.push(
                "Usage data is degraded; limits were checked against partial data".to_string(),
            );
        }

        debug!(client_id = %client_id, warnings = warnings.len(), "Admission allowed");
        AdmissionDecision::allow(warnings, source)
    }

    fn threshold_warnings(&self, snapshot: &UsageSnapshot, client_spend: f64) -> Vec<String> {
        let limits = &self.limits;
        let checks = [
            ("Hourly burn rate", snapshot.burn_rate_per_hour, limits.hourly_limit),
            ("Daily burn rate", snapshot.burn_rate_per_day, limits.daily_limit),
            (
                "Projected monthly spend",
                snapshot.burn_rate_per_day * DAYS_PER_MONTH,
                limits.monthly_limit,
            ),
            ("Client hourly spend", client_spend, limits.client_hourly_limit()),
        ];

        checks
            .into_iter()
            .filter(|(_, _, limit)| *limit > 0.0)
            .filter_map(|(label, value, limit)| {
                let pct = value / limit * 100.0;
                let level = if pct >= limits.critical_threshold_pct {
                    "Critical"
                } else if pct >= limits.warning_threshold_pct {
                    "Warning"
                } else {
                    return None;
                };
                Some(format!(
                    "{}: {} ${:.2} is {:.0}% of the ${:.2} limit",
                    level, label, value, pct, limit
                ))
            })
            .collect()
    }

    /// Add the actual cost of an admitted request to the client's hour
    pub fn record_client_cost(&self, client_id: &str, cost: f64) -> Result<()> {
        validate_client_id(client_id)?;
        self.record_client_cost_at(client_id, cost, Utc::now());
        Ok(())
    }

    pub fn record_client_cost_at(&self, client_id: &str, cost: f64, now: DateTime<Utc>) {
        let cost = if cost.is_finite() && cost > 0.0 { cost } else { 0.0 };
        let window_start = hour_window_start(now);

        let mut record = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientUsageRecord::new(client_id.to_string(), window_start, now));
        roll_window(&mut record, window_start);
        record.hour_cost += cost;
        record.last_request_at = now;
    }

    /// Drop records idle for longer than the retention window
    pub fn sweep_stale(&self) -> usize {
        self.sweep_stale_at(Utc::now())
    }

    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.clients.len();
        self.clients
            .retain(|_, record| now - record.last_request_at < self.retention);
        let removed = before.saturating_sub(self.clients.len());
        if removed > 0 {
            info!(removed, remaining = self.clients.len(), "Swept stale client records");
        }
        removed
    }

    /// Run [`sweep_stale`](Self::sweep_stale) every `interval` until `cancel` fires
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: StdDuration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_stale();
                    }
                }
            }
            debug!("Client sweeper stopped");
        })
    }

    pub fn client(&self, client_id: &str) -> Option<ClientUsageRecord> {
        self.clients.get(client_id).map(|record| record.clone())
    }

    /// Snapshot of every client record, ordered by id
    pub fn clients(&self) -> Vec<ClientUsageRecord> {
        let mut records: Vec<_> = self
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        records
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

fn roll_window(record: &mut ClientUsageRecord, window_start: DateTime<Utc>) {
    if record.window_start < window_start {
        record.window_start = window_start;
        record.hour_requests = 0;
        record.hour_cost = 0.0;
    }
}

/// Start of the wall-clock hour containing `now`
pub fn hour_window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::hours(1)).unwrap_or_else(|err| {
        warn!(error = %err, "Failed to truncate timestamp to the hour");
        now
    })
}

/// 1-128 characters of `[A-Za-z0-9_.:@-]`
pub fn validate_client_id(client_id: &str) -> Result<()> {
    if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(GatewayError::Validation(format!(
            "client id must be 1-{} characters",
            MAX_CLIENT_ID_LEN
        )));
    }
    if let Some(bad) = client_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '@' | '-')))
    {
        return Err(GatewayError::Validation(format!(
            "client id contains invalid character {:?}",
            bad
        )));
    }
    Ok(())
}
