//! Tether - multi-tenant messaging session gateway
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tether::cli::{Cli, Commands};
use tether::config::{Config, ConfigManager};
use tether::error::TetherResult;
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

async fn run() -> TetherResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    let serving = matches!(cli.command, Commands::Serve(_));
    init_tracing(cli.verbose, serving, &config);

    match cli.command {
        Commands::Serve(args) => tether::cli::commands::serve(args, &config).await,
        Commands::List(args) => tether::cli::commands::list(args, &config).await,
        Commands::Config(args) => {
            tether::cli::commands::config(args, &config_manager, &config).await
        }
    }
}

/// 0 = warn (info while serving), 1 = info, 2+ = debug; RUST_LOG wins when
/// no -v flag is given
fn init_tracing(verbose: u8, serving: bool, config: &Config) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if serving { "tether=info" } else { "tether=warn" })
        }),
        1 => EnvFilter::new("tether=info"),
        _ => EnvFilter::new("tether=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
