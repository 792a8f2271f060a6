use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// The courier message-broker daemon.
#[derive(Parser, Debug)]
#[command(name = "courier", version, about)]
pub struct Cli {
    /// Path to the broker config file (YAML).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the broker: accept block-transfer connections, authorize and
    /// route messages between peers.
    Serve {
        /// Override the configured listen address, e.g. `0.0.0.0:9632`.
        #[arg(long)]
        listen: Option<String>,
    },

    /// Print the effective configuration as YAML and exit.
    ShowConfig,
}
