//! vboxbuild command-line host.

mod cli;
mod commands;

use clap::Parser;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = cli.global.init_logging()?;

    match cli.command {
        Commands::Build(args) => commands::build::execute(args).await,
        Commands::Validate(args) => commands::validate::execute(args),
        Commands::Version => commands::version::execute().await,
    }
}
