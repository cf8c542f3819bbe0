//! Kadmap command-line interface

use clap::{Parser, Subcommand};
use kadmap::config::load_config_with_hash;
use kadmap::storage::SqliteStorage;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Kadmap: a Kademlia DHT topology crawler
#[derive(Parser, Debug)]
#[command(name = "kadmap")]
#[command(version)]
#[command(about = "Crawl and monitor the topology of a DHT network", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one crawl of the network
    Crawl {
        /// Crawl without persisting anything
        #[arg(long)]
        dry_run: bool,

        /// Stop after this many visited peers (overrides the config)
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Probe known peers for liveness in rounds until interrupted
    Monitor,

    /// Show statistics of the latest crawl and exit
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (mut config, config_hash) = load_config_with_hash(&cli.config)?;
    tracing::info!(hash = %config_hash, "Configuration loaded");

    if let Err(err) = kadmap::metrics::init_metrics() {
        tracing::warn!(error = %err, "Metrics registration failed, continuing without");
    }

    match cli.command {
        Command::Crawl { dry_run, limit } => {
            if let Some(limit) = limit {
                config.crawl.crawl_limit = limit;
            }
            let cancel = cancel_on_ctrl_c();
            let summary = kadmap::crawl::crawl(&config, dry_run, cancel).await?;
            tracing::info!(
                state = summary.state.to_db_string(),
                crawled = summary.crawled_peers,
                "Crawl finished"
            );
        }
        Command::Monitor => {
            let cancel = cancel_on_ctrl_c();
            kadmap::monitor::monitor(&config, cancel).await?;
        }
        Command::Stats => {
            let mut storage =
                SqliteStorage::new(std::path::Path::new(&config.output.database_path))?;
            match kadmap::output::load_statistics(&mut storage)? {
                Some(stats) => kadmap::output::print_statistics(&stats),
                None => println!("No crawl runs recorded yet."),
            }
        }
    }

    Ok(())
}

/// Sets up the tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("kadmap=info,warn"),
            1 => EnvFilter::new("kadmap=debug,info"),
            2 => EnvFilter::new("kadmap=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Returns a token that fires on the first interrupt signal
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received interrupt signal - stopping...");
            token.cancel();
        }
    });
    cancel
}
