//! Optical media placement.
//!
//! Each attachment category owns a fixed controller slot so that the boot
//! ISO, the guest additions ISO and the cd_files ISO never collide. Every
//! optical attachment has an exact inverse command (same slot, medium
//! `none`) which is recorded for later detachment.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vboxbuild_shared::constants::controllers;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use crate::config::MediaInterface;
use crate::vbox_args;
use crate::version::{CanonicalVersion, VIRTIO_CONTROLLER_MIN};

/// One of the three optional media a build may mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentCategory {
    BootIso,
    GuestAdditions,
    CdFiles,
}

impl AttachmentCategory {
    pub const ALL: [AttachmentCategory; 3] = [
        AttachmentCategory::BootIso,
        AttachmentCategory::GuestAdditions,
        AttachmentCategory::CdFiles,
    ];

    /// Human-readable name for progress output.
    pub fn label(self) -> &'static str {
        match self {
            AttachmentCategory::BootIso => "boot ISO",
            AttachmentCategory::GuestAdditions => "guest additions ISO",
            AttachmentCategory::CdFiles => "cd_files ISO",
        }
    }
}

impl fmt::Display for AttachmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttachmentCategory::BootIso => "boot_iso",
            AttachmentCategory::GuestAdditions => "guest_additions",
            AttachmentCategory::CdFiles => "cd_files",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediumType {
    DvdDrive,
    Hdd,
}

impl MediumType {
    pub fn as_str(self) -> &'static str {
        match self {
            MediumType::DvdDrive => "dvddrive",
            MediumType::Hdd => "hdd",
        }
    }
}

/// Controller position of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub controller: &'static str,
    pub port: u32,
    pub device: u32,
}

/// Slot for `category` on `interface`.
///
/// IDE encodes the categories as port/device pairs on the shared
/// controller; SATA and VirtIO use dedicated high ports with device 0.
pub fn plan_slot(category: AttachmentCategory, interface: MediaInterface) -> Slot {
    let (ide_port, ide_device, high_port) = match category {
        AttachmentCategory::BootIso => (0, 1, 13),
        AttachmentCategory::GuestAdditions => (1, 0, 14),
        AttachmentCategory::CdFiles => (1, 1, 15),
    };

    match interface {
        MediaInterface::Ide => Slot {
            controller: controllers::IDE,
            port: ide_port,
            device: ide_device,
        },
        MediaInterface::Sata => Slot {
            controller: controllers::SATA,
            port: high_port,
            device: 0,
        },
        MediaInterface::Virtio => Slot {
            controller: controllers::VIRTIO,
            port: high_port,
            device: 0,
        },
    }
}

/// Reject interfaces the installed hypervisor cannot provide.
pub fn check_interface_supported(interface: MediaInterface, version: &str) -> BuildResult<()> {
    if interface != MediaInterface::Virtio {
        return Ok(());
    }

    let supported = CanonicalVersion::parse(version)
        .map(|v| v.at_least(&VIRTIO_CONTROLLER_MIN))
        .unwrap_or(false);
    if supported {
        Ok(())
    } else {
        Err(BuildError::Config(format!(
            "the virtio interface requires VirtualBox {} or newer (found {})",
            VIRTIO_CONTROLLER_MIN, version
        )))
    }
}

/// A planned attachment of one medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttachment {
    pub category: AttachmentCategory,
    pub slot: Slot,
    pub medium_type: MediumType,
    pub medium: PathBuf,
}

impl MediaAttachment {
    pub fn new(
        category: AttachmentCategory,
        interface: MediaInterface,
        medium_type: MediumType,
        medium: impl Into<PathBuf>,
    ) -> Self {
        Self {
            category,
            slot: plan_slot(category, interface),
            medium_type,
            medium: medium.into(),
        }
    }

    pub fn attach_command(&self, vm: &str) -> Vec<String> {
        self.storage_command(vm, &self.medium.display().to_string())
    }

    /// Inverse of [`Self::attach_command`]. Hard disks stay with the VM and
    /// have none.
    pub fn detach_command(&self, vm: &str) -> Option<Vec<String>> {
        match self.medium_type {
            MediumType::Hdd => None,
            MediumType::DvdDrive => Some(self.storage_command(vm, "none")),
        }
    }

    fn storage_command(&self, vm: &str, medium: &str) -> Vec<String> {
        vbox_args![
            "storageattach",
            vm,
            "--storagectl",
            self.slot.controller,
            "--port",
            self.slot.port,
            "--device",
            self.slot.device,
            "--type",
            self.medium_type.as_str(),
            "--medium",
            medium,
        ]
    }
}

pub fn is_vhd(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("vhd"))
}

/// Copy a VHD into a fresh temporary directory with world read/write
/// permissions. The directory outlives the build: the copy becomes part of
/// the VM.
pub async fn stage_vhd(source: &Path) -> BuildResult<PathBuf> {
    let file_name = source
        .file_name()
        .ok_or_else(|| BuildError::Storage(format!("{} has no file name", source.display())))?;

    let dir = tempfile::Builder::new()
        .prefix("vboxbuild")
        .tempdir()
        .map_err(|e| BuildError::Storage(format!("failed to create temp dir: {}", e)))?
        .keep();
    let target = dir.join(file_name);

    tokio::fs::copy(source, &target).await.map_err(|e| {
        BuildError::Storage(format!(
            "failed to copy {} to {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o666)).await?;
    }

    tracing::debug!(source = %source.display(), target = %target.display(), "Staged VHD");
    Ok(target)
}
