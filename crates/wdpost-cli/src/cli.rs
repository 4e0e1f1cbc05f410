use std::path::PathBuf;

use clap::Parser;

/// Window PoSt proving and submission pipeline.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub subcommand: SubCommand,
}

#[derive(Debug, clap::Subcommand, Clone)]
pub(crate) enum SubCommand {
    /// Run scheduler, task engine and outbox against a simulated chain
    Run(RunCommand),
    /// Load and validate a config file, then print the effective settings
    CheckConfig(CheckConfigCommand),
    /// Summarize a verified-registry state snapshot (JSON) for a provider
    Verifreg(VerifregCommand),
}

#[derive(Debug, clap::Args, Clone)]
pub(crate) struct RunCommand {
    /// Provider config (TOML). Defaults apply when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Epochs to advance the simulated chain before shutting down.
    #[arg(long, default_value_t = 90)]
    pub epochs: i64,

    /// Wall-clock time per simulated epoch.
    #[arg(long, default_value_t = 500)]
    pub epoch_ms: u64,

    /// Sectors the simulated storage reports unreachable.
    #[arg(long, value_delimiter = ',')]
    pub unreachable: Vec<u64>,

    /// Store tasks, messages and cursors in PostgreSQL instead of memory.
    #[cfg(feature = "postgres")]
    #[arg(long, env = "WDPOST_DATABASE_URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, clap::Args, Clone)]
pub(crate) struct CheckConfigCommand {
    #[arg(long)]
    pub config: PathBuf,
}

#[derive(Debug, clap::Args, Clone)]
pub(crate) struct VerifregCommand {
    /// Actors version the snapshot was taken under (8, 9 or 10).
    #[arg(long)]
    pub actors_version: u32,

    /// Registry state snapshot (JSON).
    #[arg(long)]
    pub state: PathBuf,

    #[arg(long, default_value = "f01000")]
    pub provider: String,
}
