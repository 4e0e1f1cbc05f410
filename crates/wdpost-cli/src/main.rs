//! wdpost: Window PoSt pipeline の起動とコンフィグ検査

mod cli;
mod run;
mod verifreg;

use clap::Parser;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use wdpost_core::config::ProviderConfig;

use crate::cli::{CheckConfigCommand, Cli, SubCommand};

fn check_config(cmd: CheckConfigCommand) -> anyhow::Result<()> {
    let config = ProviderConfig::load(&cmd.config)?;
    info!(path = %cmd.config.display(), "config is valid");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logger initialization.
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .init();

    match Cli::parse().subcommand {
        SubCommand::Run(cmd) => run::run(cmd).await,
        SubCommand::CheckConfig(cmd) => check_config(cmd),
        SubCommand::Verifreg(cmd) => verifreg::inspect(cmd),
    }
}
