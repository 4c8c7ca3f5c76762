use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "relayd")]
#[command(version)]
#[command(about = "Ephemeral encrypted remote-execution daemon", long_about = None)]
pub(crate) struct Cli {
    /// Log verbosity (-v debug, -vv trace). RELAYD_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Serve in the foreground (the detached daemon body)
    Run(ServeArgs),

    /// Detach into the background and report once the daemon is listening
    Start(ServeArgs),

    /// Force-kill the daemon recorded in the PID marker
    Stop,

    /// Report whether a daemon instance is alive
    Status,
}

#[derive(Args, Clone)]
pub(crate) struct ServeArgs {
    /// TCP port to bind
    #[arg(short, long, default_value_t = 5099)]
    pub port: u16,

    /// Bind the wildcard IPv6 address instead of IPv4
    #[arg(long)]
    pub ipv6: bool,

    /// Per-connection idle seconds before the connection is closed
    #[arg(short, long, default_value_t = 300)]
    pub timeout: u64,

    /// Total lifetime in minutes before hard self-termination
    #[arg(short, long, default_value_t = 30)]
    pub minutes: u64,

    /// Base64-encoded 32-byte pre-shared key (falls back to $RELAYD_KEY)
    #[arg(short, long)]
    pub key: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}
