use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "hushbox",
    about = "Encrypted vault for anonymous reports",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Answer JSON requests read line by line from stdin, one response per line on stdout.
    Serve {
        /// Count every line under this identity and read lines as bare requests.
        /// Without it each line is an `{"identity": .., "request": ..}` envelope
        /// written by the fronting proxy.
        #[arg(long)]
        identity: Option<String>,
    },
    /// Dispatch a single JSON request and print the response.
    Request {
        json: String,
        #[arg(long)]
        identity: Option<String>,
    },
    /// Remove expired artifacts now.
    Sweep,
    /// Inspect the audit trail.
    #[command(subcommand)]
    Audit(AuditCommand),
    /// Run a save/resume/delete check against the configured store.
    Health,
    /// Manage configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version and exit.
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum AuditCommand {
    /// Check the hash chain of the audit log.
    Verify {
        /// Log to check; defaults to the configured audit log.
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
