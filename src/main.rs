//! Layercast CLI
//!
//! Opens a cache from a configuration file and runs one maintenance command
//! against it.
//!
//! ```text
//! layercast --config cache.yaml sync      # one full sync, result as JSON
//! layercast --config cache.yaml stats     # analytics as JSON
//! layercast stats --prometheus            # analytics as Prometheus text
//! layercast --config cache.yaml serve     # background loops until Ctrl-C
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use layercast::cache::metrics::render_prometheus;
use layercast::sync::{FullSyncOptions, ResolutionStrategy};
use layercast::{CacheConfig, CacheManager, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Layercast - multi-layer asset cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML or JSON); in-memory defaults when absent
    #[arg(long, short, env = "LAYERCAST_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile every key across every layer once
    Sync {
        /// Strategy for every conflict instead of the per-type defaults
        #[arg(long)]
        strategy: Option<String>,

        /// Overall budget in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Print cache analytics
    Stats {
        /// Prometheus text format instead of JSON
        #[arg(long)]
        prometheus: bool,
    },

    /// Run the background sync and optimization loops until Ctrl-C
    Serve,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            CacheConfig::from_file(path)?
        }
        None => CacheConfig::in_memory(),
    };

    let cache = match CacheManager::open(config).await {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            error!("Failed to open cache: {}", e);
            return Err(e);
        }
    };

    let outcome = run(&cache, args.command).await;
    cache.dispose().await;
    outcome
}

async fn run(cache: &Arc<CacheManager>, command: Command) -> Result<()> {
    match command {
        Command::Sync { strategy, timeout_secs } => {
            let strategy = strategy.map(|s| s.parse::<ResolutionStrategy>()).transpose()?;
            let options = FullSyncOptions {
                strategy,
                timeout: timeout_secs.map(Duration::from_secs),
                cancel: None,
            };
            let result = cache.full_sync(options).await?;
            info!(
                keys = result.keys_examined,
                writes = result.writes_applied,
                conflicts = result.conflicts.len(),
                success = result.success,
                "Full sync finished"
            );
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Stats { prometheus } => {
            let analytics = cache.get_analytics();
            if prometheus {
                print!("{}", render_prometheus(&analytics)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&analytics)?);
            }
        }
        Command::Serve => {
            cache.start_background();
            info!("Serving; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
        }
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
