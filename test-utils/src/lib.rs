//! Fixtures for vboxbuild integration tests.
//!
//! Everything a build touches on disk (media, port locks, output
//! directory) lives inside one [`TempDir`] per test.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use vboxbuild::{
    BufferUi, BuildConfig, BuildError, BuildResult, BuildState, Builder, FakeDriver, MediaInputs,
    Step,
};

/// Name every fixture VM gets.
pub const TEST_VM: &str = "vboxbuild-test";

// ============================================================================
// MEDIA
// ============================================================================

/// Placeholder media files.
pub struct MediaFixture {
    dir: TempDir,
}

impl MediaFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        for name in ["boot.iso", "cd.iso", "additions.iso", "boot.vhd"] {
            std::fs::write(dir.path().join(name), name).expect("Failed to write medium");
        }
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn medium(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Boot ISO and cd_files ISO.
    pub fn inputs(&self) -> MediaInputs {
        MediaInputs {
            iso_path: Some(self.medium("boot.iso")),
            cd_path: Some(self.medium("cd.iso")),
            ..Default::default()
        }
    }
}

impl Default for MediaFixture {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// CONFIG AND DRIVER
// ============================================================================

/// Configuration whose locks and output stay inside `dir`, with a port
/// range unlikely to collide with other tests.
pub fn test_config(dir: &Path) -> BuildConfig {
    BuildConfig {
        vm_name: TEST_VM.to_string(),
        host_port_min: 43000,
        host_port_max: 43999,
        port_lock_dir: dir.join("locks"),
        export: vboxbuild::config::ExportConfig {
            output_directory: dir.join("output"),
            ..Default::default()
        },
        ..BuildConfig::default()
    }
}

/// Machine-readable VM info pointing the settings file into `dir`.
pub fn vm_info(dir: &Path) -> String {
    let cfg = dir.join("vms").join(TEST_VM).join(format!("{TEST_VM}.vbox"));
    format!("name=\"{TEST_VM}\"\nCfgFile=\"{}\"\ngraphicscontroller=\"vmsvga\"\n", cfg.display())
}

pub fn fake_driver(dir: &Path) -> FakeDriver {
    FakeDriver::new().with_output("showvminfo", vm_info(dir))
}

/// A build against a [`FakeDriver`] with every fixture in place.
pub struct BuildContext {
    pub driver: Arc<FakeDriver>,
    pub ui: Arc<BufferUi>,
    pub media: MediaFixture,
    pub config: BuildConfig,
    pub work: TempDir, // Dropped after test
}

impl BuildContext {
    pub fn new() -> Self {
        let work = TempDir::new().expect("Failed to create temp dir");
        Self {
            driver: Arc::new(fake_driver(work.path())),
            ui: Arc::new(BufferUi::new()),
            media: MediaFixture::new(),
            config: test_config(work.path()),
            work,
        }
    }

    pub fn with_driver(mut self, driver: FakeDriver) -> Self {
        self.driver = Arc::new(driver.with_output("showvminfo", vm_info(self.work.path())));
        self
    }

    pub fn builder(&self) -> Builder {
        Builder::new(self.config.clone(), self.driver.clone(), self.ui.clone())
            .expect("Fixture config must be valid")
            .with_media(self.media.inputs())
    }

    /// Raw management commands whose first argument is `subcommand`.
    pub fn commands(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.driver
            .vboxmanage_calls()
            .into_iter()
            .filter(|c| c.first().is_some_and(|s| s == subcommand))
            .collect()
    }
}

impl Default for BuildContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// HOST STEPS
// ============================================================================

/// Shared record of host step events.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// What a [`HostStep`] does when run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOutcome {
    Succeed,
    Fail,
    /// Wait until the build is cancelled.
    WaitForCancel,
    /// Sleep for the given time, then succeed.
    Sleep(Duration),
}

/// Stand-in for a provisioner, recording `run` and `cleanup` in a journal.
pub struct HostStep {
    name: &'static str,
    outcome: HostOutcome,
    journal: Journal,
}

impl HostStep {
    pub fn new(name: &'static str, outcome: HostOutcome, journal: &Journal) -> Self {
        Self {
            name,
            outcome,
            journal: journal.clone(),
        }
    }
}

#[async_trait]
impl Step for HostStep {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        self.journal.lock().push(format!("run:{}", self.name));
        match self.outcome {
            HostOutcome::Succeed => Ok(()),
            HostOutcome::Fail => Err(BuildError::Internal(format!("{} failed", self.name))),
            HostOutcome::WaitForCancel => {
                state.cancel.cancelled().await;
                Err(BuildError::Cancelled)
            }
            HostOutcome::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }

    async fn cleanup(&mut self, _state: &mut BuildState) -> BuildResult<()> {
        self.journal.lock().push(format!("cleanup:{}", self.name));
        Ok(())
    }
}
