use vboxbuild::Driver;
use vboxbuild::version::{CanonicalVersion, audio_driver_flag};

pub async fn execute() -> anyhow::Result<()> {
    let driver = vboxbuild::new_driver(None).await?;
    let raw = driver.version().await?;
    let canonical = CanonicalVersion::parse(&raw)?;

    println!("VirtualBox:  {}", raw);
    println!("Canonical:   {}", canonical);
    println!("Audio flag:  {}", audio_driver_flag(&raw));
    Ok(())
}
