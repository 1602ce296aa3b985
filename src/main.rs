use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;
use tracing::info;

use claude_usage_gateway::config::Config;
use claude_usage_gateway::display::DisplayManager;
use claude_usage_gateway::logging::init_logging;
use claude_usage_gateway::{server, Gateway, UsageTracker};

#[derive(Parser)]
#[command(name = "claude-usage-gateway")]
#[command(about = "Streaming admission gateway with live Claude usage tracking and cost limits")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway (SSE, WebSocket and usage endpoints)
    Serve {
        /// Address to listen on, overrides the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Show the current usage snapshot
    Usage {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
        /// Skip the cache and fetch from the sources
        #[arg(long)]
        refresh: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Serve { bind } => match run_server(bind).await {
            Ok(()) => Ok(()),
            Err(e) => handle_error(e, false),
        },
        Commands::Usage { json, refresh } => match show_usage(json, refresh).await {
            Ok(()) => Ok(()),
            Err(e) => handle_error(e, json),
        },
        Commands::Config => match print_config() {
            Ok(()) => Ok(()),
            Err(e) => handle_error(e, false),
        },
    }
}

async fn run_server(bind: Option<String>) -> Result<()> {
    let config = Config::load()?;
    let _log_guard = init_logging(&config.logging);

    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    info!(version = env!("CARGO_PKG_VERSION"), bind = %bind, "Starting gateway");

    let gateway = Gateway::new(config)?;
    server::serve(gateway, &bind).await
}

async fn show_usage(json: bool, refresh: bool) -> Result<()> {
    let config = Config::load()?;
    let tracker = UsageTracker::from_config(&config)?;

    let snapshot = tracker.get_current_usage(refresh).await;
    DisplayManager::new().display_usage(
        &snapshot,
        &config.limits,
        &tracker.breaker_snapshots(),
        json,
    );
    Ok(())
}

#[cfg(feature = "basic")]
fn print_config() -> Result<()> {
    let config = Config::load()?;
    print!("{}", config.to_toml()?);
    Ok(())
}

#[cfg(not(feature = "basic"))]
fn print_config() -> Result<()> {
    let config = Config::load()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn handle_error(e: anyhow::Error, json: bool) -> Result<(), anyhow::Error> {
    if json {
        println!("{}", serde_json::json!({ "error": format!("{:#}", e) }));
    } else {
        eprintln!("Error: {:#}", e);
    }
    process::exit(1);
}
