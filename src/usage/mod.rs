//! Usage Tracker
//!
//! Keeps one cached [`UsageSnapshot`] of metered consumption and refreshes it through an
//! ordered fallback chain of [`UsageProvider`]s once the cache TTL has elapsed:
//!
//! 1. `ccusage` CLI (active billing block)
//! 2. Remote accounting endpoint (optional)
//! 3. Local JSONL logs
//! 4. Degraded snapshot, which never fails
//!
//! Source failures are logged and absorbed here; callers always receive a snapshot and read
//! [`UsageSnapshot::source`] to tell authoritative data from degraded data.

pub mod local_logs;
pub mod sources;

use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{ApiCallUsage, UsageLimitCheck, UsageSnapshot, UsageSource};
use crate::resilience::{CircuitBreakerConfig, CircuitSnapshot, RetryPolicy};

pub use local_logs::LocalLogProvider;
pub use sources::{CcusageProvider, DegradedProvider, GuardedProvider, UsageProvider};
#[cfg(feature = "remote")]
pub use sources::RemoteProvider;

struct CachedSnapshot {
    snapshot: UsageSnapshot,
    fetched: Instant,
}

pub struct UsageTracker {
    providers: Vec<GuardedProvider>,
    cache_ttl: Duration,
    cached: RwLock<Option<CachedSnapshot>>,
    refresh: Mutex<()>,
}

impl UsageTracker {
    /// Build the standard provider chain from configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let usage = &config.usage;
        let mut providers: Vec<Box<dyn UsageProvider>> = Vec::new();

        if usage.ccusage_enabled {
            providers.push(Box::new(CcusageProvider::new(
                usage.ccusage_command.clone(),
                usage.ccusage_args.clone(),
            )));
        }

        if let Some(url) = &usage.remote_url {
            #[cfg(feature = "remote")]
            providers.push(Box::new(RemoteProvider::new(
                url.clone(),
                usage.source_timeout(),
            )?));

            #[cfg(not(feature = "remote"))]
            warn!(url = %url, "Remote usage URL configured but the `remote` feature is disabled");
        }

        providers.push(Box::new(LocalLogProvider::new(
            usage.claude_home.clone(),
            usage.session_window_hours,
        )));

        Ok(Self::new(
            providers,
            usage.cache_ttl(),
            usage.source_timeout(),
            config.resilience.breaker(),
            config.resilience.retry(),
        ))
    }

    /// Providers are tried in the given order; the degraded fallback is implicit
    pub fn new(
        providers: Vec<Box<dyn UsageProvider>>,
        cache_ttl: Duration,
        source_timeout: Duration,
        breaker: CircuitBreakerConfig,
        retry: RetryPolicy,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|provider| GuardedProvider::new(provider, source_timeout, breaker, retry))
            .collect();

        Self {
            providers,
            cache_ttl,
            cached: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Cached snapshot if younger than the TTL, otherwise a fresh one
    pub async fn get_current_usage(&self, force_refresh: bool) -> UsageSnapshot {
        if !force_refresh {
            if let Some(snapshot) = self.fresh_snapshot().await {
                return snapshot;
            }
        }

        // Single flight: concurrent callers wait here and reuse the winner's result
        let _refresh = self.refresh.lock().await;
        if !force_refresh {
            if let Some(snapshot) = self.fresh_snapshot().await {
                return snapshot;
            }
        }

        let mut snapshot = self.fetch_from_sources().await;

        let mut cached = self.cached.write().await;
        if let Some(previous) = cached.as_ref() {
            if previous.snapshot.source != snapshot.source {
                info!(
                    from = %previous.snapshot.source,
                    to = %snapshot.source,
                    "Usage source changed"
                );
            }
            snapshot.lifetime_requests = snapshot
                .lifetime_requests
                .max(previous.snapshot.lifetime_requests);
            snapshot.lifetime_messages = snapshot
                .lifetime_messages
                .max(previous.snapshot.lifetime_messages);
        }

        *cached = Some(CachedSnapshot {
            snapshot: snapshot.clone(),
            fetched: Instant::now(),
        });
        snapshot
    }

    async fn fresh_snapshot(&self) -> Option<UsageSnapshot> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|entry| entry.fetched.elapsed() < self.cache_ttl)
            .map(|entry| entry.snapshot.clone())
    }

    async fn fetch_from_sources(&self) -> UsageSnapshot {
        let mut failures = Vec::new();

        for provider in &self.providers {
            match provider.fetch().await {
                Ok(snapshot) => {
                    debug!(source = %provider.kind(), "Usage snapshot refreshed");
                    return snapshot;
                }
                Err(err) => {
                    warn!(source = %provider.kind(), error = %err, "Usage source failed");
                    failures.push(format!("{}: {}", provider.kind(), err));
                }
            }
        }

        warn!(
            failures = failures.len(),
            "All usage sources failed, serving degraded snapshot"
        );
        DegradedProvider::snapshot(&failures)
    }

    /// Fold one upstream call into the cached snapshot.
    ///
    /// Returns `false` without recording anything when no snapshot has been fetched yet;
    /// call [`get_current_usage`](Self::get_current_usage) first.
    pub async fn track_api_call(&self, call: &ApiCallUsage) -> bool {
        let mut cached = self.cached.write().await;
        match cached.as_mut() {
            Some(entry) => {
                entry.snapshot.apply(call);
                true
            }
            None => {
                debug!("Usage recorded before the first snapshot, ignoring");
                false
            }
        }
    }

    pub async fn check_usage_limits(&self, hourly_limit: f64, daily_limit: f64) -> UsageLimitCheck {
        self.get_current_usage(false)
            .await
            .check_limits(hourly_limit, daily_limit)
    }

    /// Cached snapshot without triggering a refresh
    pub async fn peek(&self) -> Option<UsageSnapshot> {
        self.cached
            .read()
            .await
            .as_ref()
            .map(|entry| entry.snapshot.clone())
    }

    pub fn sources(&self) -> Vec<UsageSource> {
        self.providers.iter().map(GuardedProvider::kind).collect()
    }

    pub fn breaker_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.providers.iter().map(GuardedProvider::breaker).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingProvider {
        kind: UsageSource,
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl UsageProvider for CountingProvider {
        fn kind(&self) -> UsageSource {
            self.kind
        }

        async fn fetch(&self) -> anyhow::Result<UsageSnapshot> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(anyhow!("{} unavailable", self.kind));
            }
            let mut snapshot = UsageSnapshot::empty(self.kind);
            snapshot.lifetime_requests = 100 / call as u64;
            Ok(snapshot)
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl UsageProvider for SlowProvider {
        fn kind(&self) -> UsageSource {
            UsageSource::Ccusage
        }

        async fn fetch(&self) -> anyhow::Result<UsageSnapshot> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(UsageSnapshot::empty(UsageSource::Ccusage))
        }
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        }
    }

    fn tracker(providers: Vec<Box<dyn UsageProvider>>) -> UsageTracker {
        UsageTracker::new(
            providers,
            Duration::from_secs(10),
            Duration::from_secs(5),
            CircuitBreakerConfig::default(),
            no_retry(),
        )
    }

    fn counting(kind: UsageSource, fail: bool) -> (Box<dyn UsageProvider>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = CountingProvider {
            kind,
            calls: calls.clone(),
            fail,
        };
        (Box::new(provider), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_respects_ttl() {
        let (provider, calls) = counting(UsageSource::Ccusage, false);
        let tracker = tracker(vec![provider]);

        tracker.get_current_usage(false).await;
        tracker.get_current_usage(false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        tracker.get_current_usage(false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tracker.get_current_usage(true).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_falls_back_in_order() {
        let (first, first_calls) = counting(UsageSource::Ccusage, true);
        let (second, _) = counting(UsageSource::LocalLogs, false);
        let tracker = tracker(vec![first, second]);

        let snapshot = tracker.get_current_usage(false).await;
        assert_eq!(snapshot.source, UsageSource::LocalLogs);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_sources_failing_degrades() {
        let (first, _) = counting(UsageSource::Ccusage, true);
        let (second, _) = counting(UsageSource::LocalLogs, true);
        let tracker = tracker(vec![first, second]);

        let snapshot = tracker.get_current_usage(false).await;
        assert_eq!(snapshot.source, UsageSource::Degraded);
        assert!(snapshot.warnings.iter().any(|w| w.contains("ccusage")));
        assert!(snapshot.warnings.iter().any(|w| w.contains("local_logs")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out() {
        let (fallback, _) = counting(UsageSource::LocalLogs, false);
        let tracker = tracker(vec![Box::new(SlowProvider), fallback]);

        let started = Instant::now();
        let snapshot = tracker.get_current_usage(false).await;
        assert_eq!(snapshot.source, UsageSource::LocalLogs);
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_all_retries() {
        let (fallback, _) = counting(UsageSource::LocalLogs, false);
        let tracker = UsageTracker::new(
            vec![Box::new(SlowProvider), fallback],
            Duration::from_secs(10),
            Duration::from_secs(5),
            CircuitBreakerConfig::default(),
            RetryPolicy::default(),
        );

        let started = Instant::now();
        let snapshot = tracker.get_current_usage(false).await;
        assert_eq!(snapshot.source, UsageSource::LocalLogs);
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(tracker.breaker_snapshots()[0].failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_within_timeout() {
        let (flaky, calls) = counting(UsageSource::Ccusage, true);
        let (fallback, _) = counting(UsageSource::LocalLogs, false);
        let tracker = UsageTracker::new(
            vec![flaky, fallback],
            Duration::from_secs(10),
            Duration::from_secs(5),
            CircuitBreakerConfig::default(),
            RetryPolicy::default(),
        );

        let snapshot = tracker.get_current_usage(false).await;
        assert_eq!(snapshot.source, UsageSource::LocalLogs);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_breaker_opens_for_failing_source() {
        let (failing, calls) = counting(UsageSource::Ccusage, true);
        let tracker = tracker(vec![failing]);

        for _ in 0..7 {
            tracker.get_current_usage(true).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(tracker.breaker_snapshots()[0].state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_track_requires_snapshot() {
        let (provider, _) = counting(UsageSource::Ccusage, false);
        let tracker = tracker(vec![provider]);

        assert!(!tracker.track_api_call(&ApiCallUsage::new(1, 1, 0.1)).await);
        assert!(tracker.peek().await.is_none());

        tracker.get_current_usage(false).await;
        assert!(tracker.track_api_call(&ApiCallUsage::new(1, 1, 0.1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_counters_never_decrease() {
        let (provider, _) = counting(UsageSource::Ccusage, false);
        let tracker = tracker(vec![provider]);

        // Provider reports 100 then 50 lifetime requests
        let first = tracker.get_current_usage(false).await;
        assert_eq!(first.lifetime_requests, 100);

        let second = tracker.get_current_usage(true).await;
        assert_eq!(second.lifetime_requests, 100);
    }

    #[tokio::test]
    async fn test_check_usage_limits_uses_snapshot() {
        let (provider, _) = counting(UsageSource::Ccusage, false);
        let tracker = tracker(vec![provider]);

        let check = tracker.check_usage_limits(10.0, 100.0).await;
        assert!(check.within_limits);
        assert!(check.warnings.is_empty());
    }
}
