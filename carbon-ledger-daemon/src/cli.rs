use clap::{Args, Parser, Subcommand};

/// Command-line interface for the carbon-ledger daemon.
#[derive(Debug, Parser)]
#[command(name = "carbon-ledger-daemon", version, about = "Mirrors the on-chain token ledger into a local store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Runs the ledger mirror synchronizer.
    Run(RunCmd),
}

#[derive(Debug, Args)]
pub struct RunCmd {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    pub config: Option<String>,
}
