//! Usage aggregated straight from Claude's JSONL conversation logs
//!
//! Used when neither `ccusage` nor a remote accounting endpoint answers. Only files touched
//! within the rolling window are opened, entries are de-duplicated by
//! `message_id:request_id` (the same response is logged once per resumed session), and
//! entries written without `costUSD` are priced with the built-in [`PricingTable`].

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use glob::glob;
use tracing::{debug, warn};

use super::sources::UsageProvider;
use crate::models::{UsageEntry, UsageSnapshot, UsageSource};
use crate::pricing::PricingTable;

const ROLLING_WINDOW_HOURS: i64 = 24;

#[derive(Clone)]
pub struct LocalLogProvider {
    claude_home: PathBuf,
    session_window: Duration,
    pricing: PricingTable,
}

impl LocalLogProvider {
    pub fn new(claude_home: impl Into<PathBuf>, session_window_hours: i64) -> Self {
        Self {
            claude_home: claude_home.into(),
            session_window: Duration::hours(session_window_hours),
            pricing: PricingTable::builtin(),
        }
    }

    /// Main install plus any VM installs under `<claude_home>/vms/*`
    fn claude_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if self.claude_home.join("projects").is_dir() {
            paths.push(self.claude_home.clone());
        }

        if let Ok(entries) = fs::read_dir(self.claude_home.join("vms")) {
            for entry in entries.flatten() {
                let vm_path = entry.path();
                if vm_path.join("projects").is_dir() {
                    paths.push(vm_path);
                }
            }
        }

        paths
    }

    fn find_log_files(&self, since: DateTime<Utc>) -> Vec<PathBuf> {
        let mut files = Vec::new();

        for claude_path in self.claude_paths() {
            let pattern = claude_path.join("projects").join("**").join("*.jsonl");
            let Ok(entries) = glob(&pattern.to_string_lossy()) else {
                warn!(pattern = %pattern.display(), "Invalid log glob pattern");
                continue;
            };

            for path in entries.flatten() {
                if modified_since(&path, since) {
                    files.push(path);
                }
            }
        }

        files.sort();
        files
    }

    /// Blocking scan; run it off the async runtime
    pub fn scan(&self, now: DateTime<Utc>) -> Result<UsageSnapshot> {
        let rolling_start = now - Duration::hours(ROLLING_WINDOW_HOURS);
        let files = self.find_log_files(rolling_start);

        if files.is_empty() && self.claude_paths().is_empty() {
            anyhow::bail!(
                "No Claude projects directory under {}",
                self.claude_home.display()
            );
        }

        let mut aggregate = LogAggregate::new(now, self.session_window);
        let mut seen = HashSet::new();

        for path in &files {
            let file = File::open(path)
                .with_context(|| format!("Failed to open usage log: {}", path.display()))?;

            let mut reader = BufReader::new(file);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let read = reader
                    .read_until(b'\n', &mut buf)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                if read == 0 {
                    break;
                }
                let Ok(line) = std::str::from_utf8(&buf) else {
                    debug!(path = %path.display(), "Skipping log line that is not valid UTF-8");
                    continue;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                // Logs interleave non-usage records; skip anything that isn't one
                let Ok(entry) = serde_json::from_str::<UsageEntry>(line) else {
                    continue;
                };
                if let Some(hash) = entry.unique_hash() {
                    if !seen.insert(hash) {
                        continue;
                    }
                }
                aggregate.add(&entry, &self.pricing);
            }
        }

        debug!(
            files = files.len(),
            entries = aggregate.rolling_entries,
            "Aggregated local usage logs"
        );
        Ok(aggregate.into_snapshot())
    }
}

#[async_trait]
impl UsageProvider for LocalLogProvider {
    fn kind(&self) -> UsageSource {
        UsageSource::LocalLogs
    }

    async fn fetch(&self) -> Result<UsageSnapshot> {
        let provider = self.clone();
        tokio::task::spawn_blocking(move || provider.scan(Utc::now()))
            .await
            .context("Local log scan task failed")?
    }
}

fn modified_since(path: &Path, since: DateTime<Utc>) -> bool {
    match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified) >= since,
        // Unknown mtime: read it rather than silently dropping usage
        Err(_) => true,
    }
}

/// Parse log timestamps with or without an offset; naive values are taken as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// Running totals for the session, trailing-hour and rolling windows
pub struct LogAggregate {
    now: DateTime<Utc>,
    session_start: DateTime<Utc>,
    hour_start: DateTime<Utc>,
    rolling_start: DateTime<Utc>,
    snapshot: UsageSnapshot,
    first_session_entry: Option<DateTime<Utc>>,
    hour_cost: f64,
    hour_tokens: u64,
    rolling_entries: u64,
}

impl LogAggregate {
    pub fn new(now: DateTime<Utc>, session_window: Duration) -> Self {
        let mut snapshot = UsageSnapshot::empty(UsageSource::LocalLogs);
        snapshot.fetched_at = now;
        Self {
            now,
            session_start: now - session_window,
            hour_start: now - Duration::hours(1),
            rolling_start: now - Duration::hours(ROLLING_WINDOW_HOURS),
            snapshot,
            first_session_entry: None,
            hour_cost: 0.0,
            hour_tokens: 0,
            rolling_entries: 0,
        }
    }

    pub fn add(&mut self, entry: &UsageEntry, pricing: &PricingTable) {
        let Some(usage) = entry.message.usage.as_ref() else {
            return;
        };
        let Some(at) = parse_timestamp(&entry.timestamp) else {
            debug!(timestamp = %entry.timestamp, "Skipping entry with unparseable timestamp");
            return;
        };
        if at < self.rolling_start || at > self.now {
            return;
        }

        let cost = entry.cost_usd.unwrap_or_else(|| {
            pricing.cost_for(entry.message.model.as_deref().unwrap_or_default(), usage)
        });
        let tokens = usage.input_tokens
            + usage.output_tokens
            + usage.cache_creation_input_tokens
            + usage.cache_read_input_tokens;

        self.rolling_entries += 1;
        self.snapshot.rolling_cost += cost;
        self.snapshot.lifetime_requests += 1;
        self.snapshot.lifetime_messages += 1;

        if at >= self.hour_start {
            self.hour_cost += cost;
            self.hour_tokens += tokens;
        }

        if at >= self.session_start {
            let snapshot = &mut self.snapshot;
            snapshot.input_tokens += usage.input_tokens;
            snapshot.output_tokens += usage.output_tokens;
            snapshot.cache_creation_tokens += usage.cache_creation_input_tokens;
            snapshot.cache_read_tokens += usage.cache_read_input_tokens;
            snapshot.session_cost += cost;
            snapshot.session_requests += 1;
            snapshot.session_messages += 1;

            self.first_session_entry = Some(match self.first_session_entry {
                Some(first) => first.min(at),
                None => at,
            });
        }
    }

    pub fn into_snapshot(mut self) -> UsageSnapshot {
        self.snapshot.burn_rate_per_hour = self.hour_cost;
        self.snapshot.burn_rate_per_day = self.snapshot.rolling_cost;
        self.snapshot.tokens_per_minute = self.hour_tokens as f64 / 60.0;
        self.snapshot.session_started_at = self.first_session_entry;
        self.snapshot.session_duration_secs = self
            .first_session_entry
            .map(|first| (self.now - first).num_seconds().max(0) as u64)
            .unwrap_or(0);
        self.snapshot
    }
}
