use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;

use crate::commands::build::BuildArgs;
use crate::commands::validate::ValidateArgs;

const LOG_FILE: &str = "vboxbuild.log";

#[derive(Parser, Debug)]
#[command(author, version, about = "Provision VirtualBox machines")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a build
    Build(BuildArgs),
    /// Load and validate a configuration file
    Validate(ValidateArgs),
    /// Show the installed VirtualBox version
    Version,
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Write logs to a daily rotated file in this directory instead of stderr
    #[arg(long, global = true, env = "VBOXBUILD_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl GlobalFlags {
    /// Install the tracing subscriber. The returned guard flushes buffered
    /// log lines when dropped.
    pub fn init_logging(&self) -> anyhow::Result<WorkerGuard> {
        let env_filter = vboxbuild::util::env_filter_or("info");

        let (non_blocking, guard) = match &self.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE))
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };
        vboxbuild::util::register_to_tracing(non_blocking, env_filter);

        Ok(guard)
    }
}
