pub mod build;
pub mod validate;
pub mod version;

use std::path::Path;

use anyhow::Context;
use vboxbuild::BuildConfig;

/// Load `path` and apply defaults; every validation problem is reported.
pub fn load_config(path: &Path) -> anyhow::Result<BuildConfig> {
    let mut config = BuildConfig::from_path(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config.prepare()?;
    Ok(config)
}
