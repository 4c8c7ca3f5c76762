mod args;
mod commands;

use std::path::Path;

use anyhow::{Context, Result};
use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use relayd::runenv;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Run(serve) => serve.log_file.clone(),
        _ => None,
    };
    init_tracing(cli.verbose, log_file.as_deref())?;

    match cli.command {
        Commands::Run(serve) => commands::cmd_run(serve).await?,
        Commands::Start(serve) => commands::cmd_start(serve).await?,
        Commands::Stop => commands::cmd_stop()?,
        Commands::Status => commands::cmd_status()?,
    }

    Ok(())
}

fn init_tracing(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_env(runenv::ENV_LOG).unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    });

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}
