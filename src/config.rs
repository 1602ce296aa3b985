//! Production configuration system
//!
//! Provides centralized configuration management with:
//! - Environment variable support
//! - Config file loading (optional, `basic` feature)
//! - Runtime defaults
//! - Validation and type safety
//!
//! The loaded [`Config`] is handed to [`crate::server::Gateway::new`]; nothing reads
//! configuration from a global.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::CostLimits;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// HTTP listener and response encoding
    pub server: ServerConfig,

    /// Usage tracker cache and data sources
    pub usage: UsageConfig,

    /// Cost and rate ceilings
    pub limits: CostLimits,

    /// Per-client bookkeeping
    pub admission: AdmissionConfig,

    /// Long-lived connection lifecycle
    pub connections: ConnectionConfig,

    /// Circuit breaker and retry settings for upstream calls
    pub resilience: ResilienceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub compression_threshold_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub cache_ttl_secs: u64,
    pub source_timeout_secs: u64,
    pub ccusage_enabled: bool,
    pub ccusage_command: String,
    pub ccusage_args: Vec<String>,
    pub remote_url: Option<String>,
    pub claude_home: PathBuf,
    pub session_window_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub client_retention_hours: i64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub heartbeats_enabled: bool,
    pub event_stream_heartbeat_secs: u64,
    pub bidirectional_heartbeat_secs: u64,
    pub usage_every_n_heartbeats: u64,
    pub shutdown_deadline_ms: u64,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            format: "pretty".to_string(),
            output: "console".to_string(),
            directory: PathBuf::from("logs"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            compression_threshold_bytes: 1024,
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 10,
            source_timeout_secs: 5,
            ccusage_enabled: true,
            ccusage_command: "ccusage".to_string(),
            ccusage_args: vec![
                "blocks".to_string(),
                "--active".to_string(),
                "--json".to_string(),
            ],
            remote_url: None,
            claude_home: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".claude"),
            session_window_hours: 5,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            client_retention_hours: 24,
            sweep_interval_secs: 300,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeats_enabled: true,
            event_stream_heartbeat_secs: 10,
            bidirectional_heartbeat_secs: 30,
            usage_every_n_heartbeats: 3,
            shutdown_deadline_ms: 2000,
            channel_capacity: 64,
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 30,
            max_retries: 2,
            base_delay_ms: 250,
            max_delay_ms: 5000,
            backoff_factor: 2.0,
        }
    }
}

impl UsageConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }
}

impl ConnectionConfig {
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }
}

impl ResilienceConfig {
    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
        }
    }
}

impl Config {
    /// Load configuration from file, environment and defaults
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        let config_paths = [
            PathBuf::from("claude-usage-gateway.toml"),
            PathBuf::from(".claude-usage-gateway.toml"),
            dirs::config_dir()
                .map(|d| d.join("claude-usage-gateway").join("config.toml"))
                .unwrap_or_default(),
        ];

        for path in &config_paths {
            if path.is_file() {
                info!(config_file = %path.display(), "Loading configuration from file");
                config = Self::load_from_file(path)?;
                break;
            }
        }

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    #[cfg(feature = "basic")]
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    #[cfg(not(feature = "basic"))]
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        anyhow::bail!(
            "Config file {} found but TOML support is disabled (enable the `basic` feature)",
            path.display()
        )
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = env::var("LOG_FORMAT") {
            self.logging.format = val;
        }
        if let Ok(val) = env::var("LOG_OUTPUT") {
            self.logging.output = val;
        }
        if let Ok(val) = env::var("CLAUDE_LOG_DIR") {
            self.logging.directory = PathBuf::from(val);
        }

        if let Ok(val) = env::var("GATEWAY_BIND") {
            self.server.bind = val;
        }

        if let Ok(val) = env::var("GATEWAY_CACHE_TTL_SECS") {
            self.usage.cache_ttl_secs = val.parse().context("Invalid GATEWAY_CACHE_TTL_SECS")?;
        }
        if let Ok(val) = env::var("GATEWAY_REMOTE_USAGE_URL") {
            self.usage.remote_url = Some(val).filter(|url| !url.is_empty());
        }
        if let Ok(val) = env::var("CLAUDE_HOME") {
            self.usage.claude_home = PathBuf::from(val);
        }

        if let Ok(val) = env::var("GATEWAY_HOURLY_LIMIT") {
            self.limits.hourly_limit = val.parse().context("Invalid GATEWAY_HOURLY_LIMIT")?;
        }
        if let Ok(val) = env::var("GATEWAY_DAILY_LIMIT") {
            self.limits.daily_limit = val.parse().context("Invalid GATEWAY_DAILY_LIMIT")?;
        }
        if let Ok(val) = env::var("GATEWAY_MONTHLY_LIMIT") {
            self.limits.monthly_limit = val.parse().context("Invalid GATEWAY_MONTHLY_LIMIT")?;
        }

        if let Ok(val) = env::var("GATEWAY_HEARTBEATS_ENABLED") {
            self.connections.heartbeats_enabled =
                val.parse().context("Invalid GATEWAY_HEARTBEATS_ENABLED")?;
        }
        if let Ok(val) = env::var("GATEWAY_SHUTDOWN_DEADLINE_MS") {
            self.connections.shutdown_deadline_ms =
                val.parse().context("Invalid GATEWAY_SHUTDOWN_DEADLINE_MS")?;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        for (name, value) in [
            ("hourly_limit", limits.hourly_limit),
            ("daily_limit", limits.daily_limit),
            ("monthly_limit", limits.monthly_limit),
            ("per_request_limit", limits.per_request_limit),
            ("max_tokens_per_minute", limits.max_tokens_per_minute),
        ] {
            if !value.is_finite() || value <= 0.0 {
                anyhow::bail!("limits.{} must be a positive number, got {}", name, value);
            }
        }

        let fraction = limits.client_hourly_fraction;
        if !(0.0..=1.0).contains(&fraction) || fraction == 0.0 {
            anyhow::bail!(
                "limits.client_hourly_fraction must be in (0, 1], got {}",
                fraction
            );
        }

        if limits.warning_threshold_pct >= limits.critical_threshold_pct {
            anyhow::bail!(
                "Warning threshold ({}%) must be below critical threshold ({}%)",
                limits.warning_threshold_pct,
                limits.critical_threshold_pct
            );
        }

        if limits.daily_limit < limits.hourly_limit {
            warn!(
                hourly = limits.hourly_limit,
                daily = limits.daily_limit,
                "Daily limit is lower than the hourly limit"
            );
        }

        if self.usage.cache_ttl_secs == 0 {
            warn!("Usage cache TTL is zero, every admission check will refetch usage");
        }
        if self.usage.source_timeout_secs == 0 {
            anyhow::bail!("usage.source_timeout_secs must be greater than 0");
        }
        if self.usage.session_window_hours <= 0 {
            anyhow::bail!("usage.session_window_hours must be greater than 0");
        }

        if self.admission.client_retention_hours <= 0 {
            anyhow::bail!("admission.client_retention_hours must be greater than 0");
        }
        if self.admission.sweep_interval_secs == 0 {
            anyhow::bail!("admission.sweep_interval_secs must be greater than 0");
        }

        let connections = &self.connections;
        if connections.event_stream_heartbeat_secs == 0
            || connections.bidirectional_heartbeat_secs == 0
        {
            anyhow::bail!("Heartbeat intervals must be greater than 0");
        }
        if connections.channel_capacity == 0 {
            anyhow::bail!("connections.channel_capacity must be greater than 0");
        }

        if self.resilience.failure_threshold == 0 {
            anyhow::bail!("resilience.failure_threshold must be greater than 0");
        }
        if self.resilience.backoff_factor < 1.0 {
            anyhow::bail!(
                "resilience.backoff_factor must be at least 1.0, got {}",
                self.resilience.backoff_factor
            );
        }

        Ok(())
    }

    /// Render the configuration the way it would be written to a config file
    #[cfg(feature = "basic")]
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.usage.cache_ttl_secs, 10);
        assert_eq!(config.connections.event_stream_heartbeat_secs, 10);
        assert_eq!(config.connections.bidirectional_heartbeat_secs, 30);
        assert_eq!(config.connections.shutdown_deadline_ms, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.limits.hourly_limit = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.warning_threshold_pct = 99.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.resilience.backoff_factor = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resilience_conversion() {
        let config = ResilienceConfig::default();
        assert_eq!(config.retry().base_delay, Duration::from_millis(250));
        assert_eq!(config.breaker().recovery_timeout, Duration::from_secs(30));
    }
}
