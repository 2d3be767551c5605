//! Quarry: data fetching and caching engine demo host
//!
//! Subcommands:
//! - `counter`: shared subscriptions and tag invalidation against an in-memory server
//! - `posts`: optimistic update rolled back when the server rejects the write
//! - `fetch`: the HTTP transport against a real endpoint

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use quarry_core::{EngineConfig, Refetch};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod scenarios;
mod server;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

/// Parse a refetch policy: a boolean or a number of seconds.
fn parse_refetch(s: &str) -> Result<Refetch, String> {
    if let Ok(flag) = parse_bool_env(s) {
        return Ok(flag.into());
    }
    s.parse::<f64>()
        .map(Refetch::IfOlderThan)
        .map_err(|_| format!("invalid refetch policy '{}', expected a boolean or seconds", s))
}

#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "Data fetching and caching engine demo", long_about = None)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Engine configuration shared by every subcommand.
#[derive(Args)]
struct EngineArgs {
    /// Seconds an unused cache entry is kept before eviction
    #[arg(long, global = true, env = "QUARRY_KEEP_UNUSED_DATA_FOR", default_value = "60")]
    keep_unused_data_for: f64,

    /// Refetch on mount: true, false, or a maximum age in seconds
    #[arg(long, global = true, env = "QUARRY_REFETCH_ON_MOUNT_OR_ARG_CHANGE", value_parser = parse_refetch, default_value = "false")]
    refetch_on_mount_or_arg_change: Refetch,

    /// Refetch subscribed queries when the host regains focus
    #[arg(long, global = true, env = "QUARRY_REFETCH_ON_FOCUS", value_parser = parse_bool_env, default_value = "false")]
    refetch_on_focus: bool,

    /// Refetch subscribed queries when the host comes back online
    #[arg(long, global = true, env = "QUARRY_REFETCH_ON_RECONNECT", value_parser = parse_bool_env, default_value = "false")]
    refetch_on_reconnect: bool,
}

impl EngineArgs {
    fn config(&self) -> Result<EngineConfig> {
        EngineConfig::builder()
            .keep_unused_data_for(self.keep_unused_data_for)
            .refetch_on_mount_or_arg_change(self.refetch_on_mount_or_arg_change)
            .refetch_on_focus(self.refetch_on_focus)
            .refetch_on_reconnect(self.refetch_on_reconnect)
            .build()
            .map_err(|e| miette::miette!("{}", e))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Two subscribers share a count; increments invalidate and refetch it
    Counter {
        /// Simulated server latency in milliseconds
        #[arg(long, env = "QUARRY_LATENCY_MS", default_value = "50")]
        latency_ms: u64,

        /// Number of increments to run
        #[arg(long, default_value = "3")]
        increments: u32,
    },

    /// Rename a post optimistically against a server that rejects writes
    Posts {
        /// Simulated server latency in milliseconds
        #[arg(long, env = "QUARRY_LATENCY_MS", default_value = "50")]
        latency_ms: u64,

        /// New title for post 1
        #[arg(long, default_value = "Renamed")]
        title: String,
    },

    /// Fetch a path through the HTTP transport
    Fetch {
        /// Path (or absolute URL) to fetch
        #[arg(value_name = "PATH")]
        path: String,

        /// Base URL requests are resolved against
        #[arg(long, env = "QUARRY_BASE_URL", default_value = "https://jsonplaceholder.typicode.com")]
        base_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "quarry=info,quarry_core=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.engine.config()?;
    info!(?config, "engine configured");

    let snapshot = match cli.command {
        Commands::Counter {
            latency_ms,
            increments,
        } => scenarios::counter(config, Duration::from_millis(latency_ms), increments).await?,

        Commands::Posts { latency_ms, title } => {
            scenarios::posts(config, Duration::from_millis(latency_ms), title).await?
        }

        Commands::Fetch { path, base_url } => scenarios::fetch(config, base_url, path).await?,
    };

    let rendered = serde_json::to_string_pretty(&snapshot).map_err(|e| miette::miette!("{}", e))?;
    println!("{rendered}");
    Ok(())
}
