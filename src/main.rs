//! blockjobd CLI entry point.

use blockjobd::config::{DaemonConfig, DEFAULT_LOG_FILTER};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;

/// blockjobd - block job engine for running guests
#[derive(Parser, Debug)]
#[command(name = "blockjobd")]
#[command(about = "Block job engine for running guests")]
#[command(version)]
struct Cli {
    /// Configuration file (default: <config dir>/blockjobd/blockjobd.toml)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the guest's monitor and serve the HTTP API.
    Serve(cli::serve::ServeCmd),

    /// Validate the configuration and print the backing chains.
    Check(cli::check::CheckCmd),
}

fn main() {
    let cli = Cli::parse();

    let config = DaemonConfig::load(cli.config.as_deref());
    let default_filter = config
        .as_ref()
        .map(|c| c.log_filter())
        .unwrap_or(DEFAULT_LOG_FILTER);
    init_logging(default_filter, cli.log_json);

    tracing::debug!(version = blockjobd::VERSION, "starting blockjobd");

    let result = config.and_then(|config| match cli.command {
        Commands::Serve(cmd) => cmd.run(&config),
        Commands::Check(cmd) => cmd.run(&config),
    });

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over the configured filter.
fn init_logging(default_filter: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
