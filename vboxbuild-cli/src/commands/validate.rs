use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Build configuration (JSON or YAML)
    #[arg(short, long)]
    pub config: PathBuf,
}

pub fn execute(args: ValidateArgs) -> anyhow::Result<()> {
    let config = super::load_config(&args.config)?;
    println!("Configuration is valid (vm: {}).", config.vm_name);
    Ok(())
}
