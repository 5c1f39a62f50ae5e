use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fwdkeeper")]
#[command(version)]
#[command(about = "Keeps Kubernetes port-forwards alive for a project", long_about = None)]
pub(crate) struct Cli {
    /// Configuration file (default: ./.fwdkeeper.toml). Can also be set via FWDKEEPER_CONFIG.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the daemon in the foreground
    Run,

    /// Start the daemon, or enable one profile in a running daemon
    Start {
        /// Profile to enable (all profiles when omitted)
        profile: Option<String>,
    },

    /// Stop the daemon, or disable one profile
    Stop {
        /// Profile to disable (stops the daemon when omitted)
        profile: Option<String>,
    },

    /// Show engine, namespace and service status
    Status,

    /// Re-read the configuration file
    Reload,

    /// Show recent daemon and engine log lines
    Logs {
        /// Number of recent lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: u32,
    },

    /// Check that the daemon answers
    Ping,
}
