//! Creates the hard disks and the storage controllers they and the media
//! attach to.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use vboxbuild_shared::constants::controllers;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use crate::config::{BuildConfig, DiskInterface, GuestAdditionsMode, MediaInterface};
use crate::driver::{Driver, parse_machine_readable};
use crate::media::check_interface_supported;
use crate::pipeline::Step;
use crate::state::BuildState;
use crate::vbox_args;

/// Media on SATA use ports 13 to 15, so the controller needs at least 16.
const SATA_PORTS_WITH_MEDIA: u32 = 16;

/// Disks are created inside the VM folder and deleted together with the VM.
#[derive(Debug, Default)]
pub struct StepCreateDisks;

impl StepCreateDisks {
    pub fn new() -> Self {
        Self
    }
}

/// A disk to create, in attachment order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiskPlan {
    pub path: PathBuf,
    pub size_mb: u64,
    pub port: u32,
}

pub(crate) fn plan_disks(config: &BuildConfig, folder: &Path) -> Vec<DiskPlan> {
    let extension = config.disk.format.to_lowercase();
    let vm = &config.vm_name;

    std::iter::once(config.disk.size_mb)
        .chain(config.disk.additional_sizes_mb.iter().copied())
        .enumerate()
        .map(|(index, size_mb)| {
            let file = if index == 0 {
                format!("{}.{}", vm, extension)
            } else {
                format!("{}-{}.{}", vm, index, extension)
            };
            DiskPlan {
                path: folder.join(file),
                size_mb,
                port: index as u32,
            }
        })
        .collect()
}

/// Media interfaces the attach step will need controllers for.
fn media_interfaces(config: &BuildConfig) -> Vec<MediaInterface> {
    let mut interfaces = vec![config.iso_interface];
    if config.guest_additions_mode == GuestAdditionsMode::Attach {
        interfaces.push(config.guest_additions_interface);
    }
    interfaces
}

fn disk_controller(interface: DiskInterface) -> &'static str {
    match interface {
        DiskInterface::Ide => controllers::IDE,
        DiskInterface::Sata => controllers::SATA,
        DiskInterface::Scsi => controllers::SCSI,
        DiskInterface::Pcie => controllers::NVME,
        DiskInterface::Virtio => controllers::VIRTIO,
    }
}

/// Folder holding the VM's settings file.
async fn vm_folder(driver: &dyn Driver, vm: &str) -> BuildResult<PathBuf> {
    let output = driver
        .vboxmanage_with_output(&vbox_args!["showvminfo", vm, "--machinereadable"])
        .await?;
    let info = parse_machine_readable(&output)?;
    info.get("CfgFile")
        .and_then(|cfg| Path::new(cfg).parent())
        .map(Path::to_path_buf)
        .ok_or_else(|| BuildError::Parse(format!("no settings file reported for VM {}", vm)))
}

async fn create_controllers(state: &BuildState, vm: &str) -> BuildResult<()> {
    let config = &state.config;
    let driver = state.driver.as_ref();
    let media = media_interfaces(config);
    let disk = config.disk.interface;

    let needs_virtio = disk == DiskInterface::Virtio || media.contains(&MediaInterface::Virtio);
    if needs_virtio {
        let version = driver.version().await?;
        check_interface_supported(MediaInterface::Virtio, &version)?;
    }

    if disk == DiskInterface::Ide || media.contains(&MediaInterface::Ide) {
        driver
            .vboxmanage(&vbox_args!["storagectl", vm, "--name", controllers::IDE, "--add", "ide"])
            .await?;
    }

    let media_on_sata = media.contains(&MediaInterface::Sata);
    if disk == DiskInterface::Sata || media_on_sata {
        let mut ports = config.disk.sata_port_count;
        if media_on_sata {
            ports = ports.max(SATA_PORTS_WITH_MEDIA);
        }
        driver.create_sata_controller(vm, controllers::SATA, ports).await?;
    }

    match disk {
        DiskInterface::Scsi => driver.create_scsi_controller(vm, controllers::SCSI).await?,
        DiskInterface::Pcie => {
            driver
                .create_nvme_controller(vm, controllers::NVME, config.disk.nvme_port_count)
                .await?
        }
        _ => {}
    }

    if needs_virtio {
        driver.create_virtio_controller(vm, controllers::VIRTIO).await?;
    }
    Ok(())
}

/// Close and delete media that were created but never attached.
async fn discard_media(driver: &dyn Driver, paths: &[PathBuf]) {
    for path in paths {
        let close = vbox_args!["closemedium", "disk", path.display(), "--delete"];
        if let Err(e) = driver.vboxmanage(&close).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to discard disk");
        }
    }
}

#[async_trait]
impl Step for StepCreateDisks {
    fn name(&self) -> &'static str {
        "create_disks"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let vm = state.vm_name()?.to_string();
        let driver = state.driver.clone();
        let config = state.config.clone();

        let folder = vm_folder(driver.as_ref(), &vm)
            .await
            .map_err(|e| e.context("error locating VM folder"))?;
        let disks = plan_disks(&config, &folder);

        state.ui.say("Creating hard drive...");
        let mut unattached = Vec::new();
        for disk in &disks {
            let create = vbox_args![
                "createmedium", "disk", "--filename", disk.path.display(), "--size", disk.size_mb,
                "--format", config.disk.format,
            ];
            if let Err(e) = driver.vboxmanage(&create).await {
                discard_media(driver.as_ref(), &unattached).await;
                return Err(e.context("error creating hard drive"));
            }
            unattached.push(disk.path.clone());
        }

        if let Err(e) = create_controllers(state, &vm).await {
            discard_media(driver.as_ref(), &unattached).await;
            return Err(e.context("error creating disk controller"));
        }

        let controller = disk_controller(config.disk.interface);
        for disk in &disks {
            let attach = vbox_args![
                "storageattach", vm, "--storagectl", controller, "--port", disk.port, "--device", "0",
                "--type", "hdd", "--medium", disk.path.display(),
            ];
            if let Err(e) = driver.vboxmanage(&attach).await {
                discard_media(driver.as_ref(), &unattached).await;
                return Err(e.context("error attaching hard drive"));
            }
            unattached.retain(|path| path != &disk.path);
            tracing::debug!(path = %disk.path.display(), port = disk.port, "Attached disk");
        }

        tracing::info!(vm = %vm, count = disks.len(), "Created disks");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, FakeDriver};
    use crate::steps::testing::{Harness, harness_with};

    const VM_INFO: &str = "name=\"foo\"\nCfgFile=\"/vms/foo/foo.vbox\"\n";

    fn run_harness(config: BuildConfig) -> Harness {
        harness_with(config, FakeDriver::new().with_output("showvminfo", VM_INFO))
    }

    fn config() -> BuildConfig {
        BuildConfig {
            vm_name: "foo".into(),
            ..BuildConfig::default()
        }
    }

    #[test]
    fn test_plan_disks_names_and_ports() {
        let mut config = config();
        config.disk.additional_sizes_mb = vec![1000, 2000];
        let disks = plan_disks(&config, Path::new("/vms/foo"));

        assert_eq!(disks.len(), 3);
        assert_eq!(disks[0].path, Path::new("/vms/foo/foo.vdi"));
        assert_eq!(disks[0].size_mb, 40000);
        assert_eq!(disks[2].path, Path::new("/vms/foo/foo-2.vdi"));
        assert_eq!(disks[2].port, 2);
    }

    #[tokio::test]
    async fn test_ide_disk_and_media() {
        let mut h = run_harness(config());
        StepCreateDisks::new().run(&mut h.state).await.unwrap();

        let calls = h.driver.vboxmanage_calls();
        assert!(calls[0].starts_with(&vbox_args!["showvminfo", "foo"]));
        assert_eq!(
            calls[1],
            vbox_args![
                "createmedium", "disk", "--filename", "/vms/foo/foo.vdi", "--size", 40000, "--format", "VDI"
            ]
        );
        assert_eq!(calls[2], vbox_args!["storagectl", "foo", "--name", "IDE Controller", "--add", "ide"]);
        assert_eq!(
            calls[3],
            vbox_args![
                "storageattach", "foo", "--storagectl", "IDE Controller", "--port", 0, "--device", 0,
                "--type", "hdd", "--medium", "/vms/foo/foo.vdi"
            ]
        );
    }

    #[tokio::test]
    async fn test_sata_media_raise_port_count() {
        let mut config = config();
        config.disk.interface = DiskInterface::Sata;
        config.iso_interface = MediaInterface::Sata;
        let mut h = run_harness(config);

        StepCreateDisks::new().run(&mut h.state).await.unwrap();

        assert!(h.driver.calls().contains(&DriverCall::CreateSataController {
            vm: "foo".into(),
            controller: "SATA Controller".into(),
            port_count: 16,
        }));
        assert!(!h.driver.calls().iter().any(|c| c.has_arg("ide")));
    }

    #[tokio::test]
    async fn test_nvme_disks_with_ide_media() {
        let mut config = config();
        config.disk.interface = DiskInterface::Pcie;
        config.disk.nvme_port_count = 2;
        config.disk.additional_sizes_mb = vec![500];
        let mut h = run_harness(config);

        StepCreateDisks::new().run(&mut h.state).await.unwrap();

        let calls = h.driver.calls();
        assert!(calls.contains(&DriverCall::CreateNvmeController {
            vm: "foo".into(),
            controller: "NVMe Controller".into(),
            port_count: 2,
        }));
        assert!(calls.iter().any(|c| c.has_arg("ide")));
        let attaches: Vec<_> = calls.iter().filter(|c| c.is_subcommand("storageattach")).collect();
        assert_eq!(attaches.len(), 2);
        assert!(attaches[1].has_arg("NVMe Controller") && attaches[1].has_arg("1"));
    }

    #[tokio::test]
    async fn test_virtio_requires_recent_hypervisor() {
        let mut config = config();
        config.disk.interface = DiskInterface::Virtio;
        let mut h = harness_with(
            config,
            FakeDriver::new().with_output("showvminfo", VM_INFO).with_version("5.2.44"),
        );

        let err = StepCreateDisks::new().run(&mut h.state).await.unwrap_err();
        assert!(err.to_string().contains("virtio"));
        assert!(
            h.driver
                .vboxmanage_calls()
                .iter()
                .any(|c| c.starts_with(&vbox_args!["closemedium", "disk", "/vms/foo/foo.vdi"]))
        );
    }

    #[tokio::test]
    async fn test_attach_failure_discards_unattached_media() {
        let mut config = config();
        config.disk.interface = DiskInterface::Sata;
        config.disk.sata_port_count = 2;
        config.disk.additional_sizes_mb = vec![500];
        let mut h = run_harness(config);
        h.driver
            .fail_when(1, "port busy", |c| c.is_subcommand("storageattach") && c.has_arg("1"));

        assert!(StepCreateDisks::new().run(&mut h.state).await.is_err());

        let closed: Vec<_> = h
            .driver
            .vboxmanage_calls()
            .into_iter()
            .filter(|c| c[0] == "closemedium")
            .collect();
        assert_eq!(closed, vec![vbox_args!["closemedium", "disk", "/vms/foo/foo-1.vdi", "--delete"]]);
    }

    #[tokio::test]
    async fn test_missing_vm_folder_is_error() {
        let mut h = harness_with(config(), FakeDriver::new().with_output("showvminfo", "name=\"foo\"\n"));
        let err = StepCreateDisks::new().run(&mut h.state).await.unwrap_err();
        assert!(err.to_string().contains("error locating VM folder"));
    }
}
