//! Capability interface over the hypervisor management tool.
//!
//! Some operations look overly specific; they exist to keep version
//! differences of `VBoxManage` out of the build steps.
//!
//! Implementations:
//! - [`VBoxDriver`]: runs the real `VBoxManage` binary
//! - [`FakeDriver`]: records invocations and returns canned results

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use vboxbuild_shared::errors::BuildResult;

mod fake;
mod snapshot;
mod vbox;
mod vminfo;

pub use fake::{DriverCall, FakeDriver};
pub use snapshot::{Snapshot, SnapshotTree};
pub use vbox::VBoxDriver;
pub use vminfo::parse_machine_readable;

#[async_trait]
pub trait Driver: Send + Sync {
    /// Create a SATA controller.
    async fn create_sata_controller(&self, vm: &str, controller: &str, port_count: u32) -> BuildResult<()>;

    /// Create a SCSI controller.
    async fn create_scsi_controller(&self, vm: &str, controller: &str) -> BuildResult<()>;

    /// Create a VirtIO-SCSI controller.
    async fn create_virtio_controller(&self, vm: &str, controller: &str) -> BuildResult<()>;

    /// Create an NVMe controller.
    async fn create_nvme_controller(&self, vm: &str, controller: &str, port_count: u32) -> BuildResult<()>;

    /// Delete every floppy controller of the VM.
    async fn remove_floppy_controllers(&self, vm: &str) -> BuildResult<()>;

    /// Unregister a VM and delete its files.
    async fn delete(&self, vm: &str) -> BuildResult<()>;

    /// Import an appliance as a new VM.
    async fn import(&self, name: &str, path: &Path, flags: &[String]) -> BuildResult<()>;

    /// Path of the guest additions ISO shipped with the hypervisor.
    async fn iso(&self) -> BuildResult<PathBuf>;

    async fn is_running(&self, vm: &str) -> BuildResult<bool>;

    /// Power the VM off forcefully.
    async fn stop(&self, vm: &str) -> BuildResult<()>;

    /// Press the virtual ACPI power button.
    async fn stop_via_acpi(&self, vm: &str) -> BuildResult<()>;

    /// Silence first-run popups of the hypervisor GUI.
    async fn suppress_messages(&self) -> BuildResult<()>;

    /// Run one management command.
    async fn vboxmanage(&self, args: &[String]) -> BuildResult<()>;

    /// Run one management command and return its trimmed stdout.
    async fn vboxmanage_with_output(&self, args: &[String]) -> BuildResult<String>;

    /// Check that the tool can be used at all.
    async fn verify(&self) -> BuildResult<()>;

    /// Installed version, e.g. `7.0.10`. Callers normalize before comparing.
    async fn version(&self) -> BuildResult<String>;

    /// `None` when the VM has no snapshots.
    async fn load_snapshots(&self, vm: &str) -> BuildResult<Option<SnapshotTree>>;

    async fn create_snapshot(&self, vm: &str, name: &str) -> BuildResult<()>;

    async fn set_snapshot(&self, vm: &str, snapshot: &Snapshot) -> BuildResult<()>;

    async fn delete_snapshot(&self, vm: &str, snapshot: &Snapshot) -> BuildResult<()>;

    async fn has_snapshots(&self, vm: &str) -> BuildResult<bool> {
        Ok(self
            .load_snapshots(vm)
            .await?
            .is_some_and(|tree| !tree.is_empty()))
    }

    async fn current_snapshot(&self, vm: &str) -> BuildResult<Option<Snapshot>> {
        Ok(self
            .load_snapshots(vm)
            .await?
            .and_then(|tree| tree.current().cloned()))
    }
}

/// Locate `VBoxManage`, verify it and return a ready driver.
///
/// Verification failure is fatal: no build can start without a usable tool.
pub async fn new_driver(command_timeout: Option<Duration>) -> BuildResult<VBoxDriver> {
    let tool_path = crate::util::find_tool()?;
    tracing::info!(path = %tool_path.display(), "Using VBoxManage");
    VBoxDriver::new(tool_path, command_timeout).await
}
