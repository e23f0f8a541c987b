//! Depot - caching proxy registry
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use depot::cli::{Cli, Commands};
use depot::config::{Config, ConfigManager};
use depot::error::DepotResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> DepotResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config);
    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::Fetch(args) => depot::cli::commands::fetch(args, &config).await,
        Commands::Browse(args) => depot::cli::commands::browse(args, &config).await,
        Commands::Rebuild(args) => depot::cli::commands::rebuild(args, &config).await,
        Commands::Invalidate(args) => depot::cli::commands::invalidate(args, &config).await,
        Commands::Delete(args) => depot::cli::commands::delete(args, &config).await,
        Commands::Gc(args) => depot::cli::commands::gc(args, &config).await,
        Commands::Repos(args) => depot::cli::commands::repos(args, &config).await,
        Commands::Config(args) => {
            depot::cli::commands::config(args, &config, &config_manager).await
        }
    }
}

/// 0 = warn, 1 = info, 2+ = debug; `RUST_LOG` wins when set
fn init_logging(verbose: u8, config: &Config) {
    let level = match verbose {
        0 => "depot=warn",
        1 => "depot=info",
        _ => "depot=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
