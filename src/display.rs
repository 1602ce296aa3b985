//! Terminal output for the `usage` command
//!
//! Renders a [`UsageSnapshot`] either as colored text for a human at a terminal or as
//! pretty-printed JSON for scripts.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use claude_usage_gateway::display::DisplayManager;
//! use claude_usage_gateway::models::{CostLimits, UsageSnapshot, UsageSource};
//!
//! let display_manager = DisplayManager::new();
//! let snapshot = UsageSnapshot::empty(UsageSource::LocalLogs);
//! display_manager.display_usage(&snapshot, &CostLimits::default(), &[], false);
//! ```

use crate::models::*;
use crate::resilience::{CircuitSnapshot, CircuitState};
use colored::Colorize;
use serde_json::json;

pub struct DisplayManager;

impl Default for DisplayManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayManager {
    pub fn new() -> Self {
        Self
    }

    pub fn display_usage(
        &self,
        snapshot: &UsageSnapshot,
        limits: &CostLimits,
        breakers: &[CircuitSnapshot],
        json_output: bool,
    ) {
        let check = snapshot.check_limits(limits.hourly_limit, limits.daily_limit);

        if json_output {
            let output = usage_json(snapshot, limits, &check, breakers);
            match serde_json::to_string_pretty(&output) {
                Ok(json_str) => println!("{}", json_str),
                Err(e) => eprintln!("Error serializing usage to JSON: {}", e),
            }
            return;
        }

        println!("\n{}", "=".repeat(80).bright_cyan());
        println!(
            "{}",
            "Claude Usage Gateway - Current Session".bright_white().bold()
        );
        println!("{}", "=".repeat(80).bright_cyan());

        let source = match snapshot.source {
            UsageSource::Degraded => snapshot.source.as_str().bright_red().bold(),
            UsageSource::LocalLogs => snapshot.source.as_str().bright_yellow().bold(),
            _ => snapshot.source.as_str().bright_green().bold(),
        };
        println!(
            "\n{} Source: {} • fetched {}",
            "📡".bright_blue(),
            source,
            snapshot.fetched_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().bright_white()
        );

        println!("\n{} Session:", "📊".bright_yellow());
        println!(
            "   Cost: {}",
            format!("${:.2}", snapshot.session_cost).bright_green().bold()
        );
        println!(
            "   Requests: {} • Messages: {}",
            snapshot.session_requests.to_string().bright_white().bold(),
            snapshot.session_messages.to_string().bright_white().bold()
        );
        println!(
            "   Tokens: {} (in {} / out {} / cache {} + {})",
            format_tokens(snapshot.total_tokens()).bright_white().bold(),
            format_tokens(snapshot.input_tokens),
            format_tokens(snapshot.output_tokens),
            format_tokens(snapshot.cache_creation_tokens),
            format_tokens(snapshot.cache_read_tokens)
        );
        if snapshot.session_duration_secs > 0 {
            println!(
                "   Duration: {}",
                format_duration(snapshot.session_duration_secs).bright_white()
            );
        }
        println!(
            "   Cache efficiency: {} • Avg cost/request: {}",
            format!("{:.0}%", snapshot.cache_efficiency() * 100.0).bright_yellow(),
            format!("${:.4}", snapshot.average_cost_per_request()).bright_green()
        );

        println!("\n{} Burn rate:", "🔥".bright_red());
        println!(
            "   Hourly: {} of {}",
            colored_rate(snapshot.burn_rate_per_hour, limits.hourly_limit),
            format!("${:.2}", limits.hourly_limit).bright_white()
        );
        println!(
            "   Daily: {} of {}",
            colored_rate(snapshot.burn_rate_per_day, limits.daily_limit),
            format!("${:.2}", limits.daily_limit).bright_white()
        );
        println!(
            "   Tokens/min: {}",
            format!("{:.0}", snapshot.tokens_per_minute).bright_white()
        );

        let open: Vec<_> = breakers
            .iter()
            .filter(|breaker| breaker.state != CircuitState::Closed)
            .collect();
        if !open.is_empty() {
            println!("\n{} Sources:", "⚡".bright_yellow());
            for breaker in open {
                println!(
                    "   {}: {} ({} failures)",
                    breaker.name.bright_cyan(),
                    breaker.state.to_string().bright_red(),
                    breaker.failure_count
                );
            }
        }

        let warnings = snapshot.warnings.iter().chain(check.warnings.iter());
        let mut printed_header = false;
        for warning in warnings {
            if !printed_header {
                println!();
                printed_header = true;
            }
            println!("{} {}", "⚠️".bright_yellow(), warning.yellow());
        }

        let status = if check.within_limits {
            "Within limits".bright_green().bold()
        } else {
            "Over limits".bright_red().bold()
        };
        println!("\n{}\n", status);
    }
}

fn usage_json(
    snapshot: &UsageSnapshot,
    limits: &CostLimits,
    check: &UsageLimitCheck,
    breakers: &[CircuitSnapshot],
) -> serde_json::Value {
    json!({
        "usage": snapshot,
        "derived": {
            "total_tokens": snapshot.total_tokens(),
            "cache_efficiency": snapshot.cache_efficiency(),
            "tokens_per_dollar": snapshot.tokens_per_dollar(),
            "average_cost_per_request": snapshot.average_cost_per_request(),
        },
        "limits": limits,
        "within_limits": check.within_limits,
        "warnings": check.warnings,
        "breakers": breakers,
    })
}

fn colored_rate(rate: f64, limit: f64) -> colored::ColoredString {
    let text = format!("${:.2}", rate);
    if limit > 0.0 && rate > limit {
        text.bright_red().bold()
    } else if limit > 0.0 && rate > limit * 0.8 {
        text.bright_yellow().bold()
    } else {
        text.bright_green().bold()
    }
}

pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, secs % 60)
    }
}
