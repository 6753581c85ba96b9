//! openbell - Automated intraday equities momentum trading engine
//!
//! # WARNING
//! - This engine trades with real money when pointed at a live account.
//! - Low-price momentum names gap hard; stops are best-effort, not
//!   guaranteed fills.
//! - Past win rates do not predict future ones; the learning layer adapts
//!   to history, not to tomorrow.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use openbell::cli;
use openbell::config::Config;

/// Automated intraday equities momentum trading engine
#[derive(Parser)]
#[command(name = "openbell")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "openbell.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading engine
    Run,

    /// Run one screener pass and print the watchlist
    Screen,

    /// Show journal counts and recent decisions
    Status,

    /// Force a full learning cycle
    Learn,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Run => cli::run(config).await,
        Commands::Screen => cli::screen(config).await,
        Commands::Status => cli::status(config).await,
        Commands::Learn => cli::learn(config).await,
    }
}
