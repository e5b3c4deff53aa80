use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use vboxbuild::{BuildConfig, Builder, ConsoleUi, Driver, FakeDriver, MediaInputs};

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Build configuration (JSON or YAML)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Boot ISO (or VHD) attached to the VM
    #[arg(long)]
    pub iso: Option<PathBuf>,

    /// ISO with extra files for the guest
    #[arg(long)]
    pub cd: Option<PathBuf>,

    /// Guest additions ISO; defaults to the one shipped with VirtualBox
    #[arg(long)]
    pub guest_additions: Option<PathBuf>,

    /// Floppy image to remove before export
    #[arg(long)]
    pub floppy: Option<PathBuf>,

    /// Record the commands a build would run instead of running them
    #[arg(long)]
    pub dry_run: bool,
}

/// Driver for dry runs. Reports a settings file below the output directory
/// so disk creation can plan paths.
fn dry_run_driver(config: &BuildConfig) -> FakeDriver {
    let cfg_file = config
        .export
        .output_directory
        .join(&config.vm_name)
        .join(format!("{}.vbox", config.vm_name));
    FakeDriver::new().with_output(
        "showvminfo",
        format!("name=\"{}\"\nCfgFile=\"{}\"\n", config.vm_name, cfg_file.display()),
    )
}

pub async fn execute(args: BuildArgs) -> anyhow::Result<()> {
    let config = super::load_config(&args.config)?;

    let recorder = args.dry_run.then(|| Arc::new(dry_run_driver(&config)));
    let driver: Arc<dyn Driver> = match &recorder {
        Some(fake) => fake.clone(),
        None => Arc::new(vboxbuild::new_driver(config.command_timeout()).await?),
    };

    let ui = Arc::new(ConsoleUi::with_prefix("vboxbuild"));
    let builder = Builder::new(config, driver, ui)?.with_media(MediaInputs {
        iso_path: args.iso,
        cd_path: args.cd,
        guest_additions_path: args.guest_additions,
        floppy_path: args.floppy,
    });

    let cancel = builder.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling build");
            cancel.cancel();
        }
    });

    let result = builder.run().await;

    if let Some(fake) = &recorder {
        println!("Recorded commands:");
        for call in fake.calls() {
            println!("  {}", call);
        }
    }

    let artifact = result?;
    match &artifact.exported_path {
        Some(path) => println!("Build finished: {} exported to {}", artifact.vm_name, path.display()),
        None => println!("Build finished: {}", artifact.vm_name),
    }
    if artifact.kept_registered {
        println!("VM {} is still registered.", artifact.vm_name);
    }
    Ok(())
}
