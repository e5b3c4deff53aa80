//! Mounts the boot ISO, the cd_files ISO and the guest additions ISO.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use crate::config::{BuildConfig, GuestAdditionsMode, MediaInterface};
use crate::media::{
    AttachmentCategory, MediaAttachment, MediumType, check_interface_supported, is_vhd, stage_vhd,
};
use crate::pipeline::Step;
use crate::state::BuildState;

/// Produces `disk_unmount_commands`. Cleanup replays them unless the media
/// were already detached.
#[derive(Debug, Default)]
pub struct StepAttachMedia {
    unmount_commands: BTreeMap<AttachmentCategory, Vec<String>>,
}

impl StepAttachMedia {
    pub fn new() -> Self {
        Self::default()
    }
}

fn interface_for(config: &BuildConfig, category: AttachmentCategory) -> MediaInterface {
    match category {
        AttachmentCategory::GuestAdditions => config.guest_additions_interface,
        AttachmentCategory::BootIso | AttachmentCategory::CdFiles => config.iso_interface,
    }
}

/// Which media this build mounts, and from where.
async fn collect_sources(state: &BuildState) -> BuildResult<BTreeMap<AttachmentCategory, PathBuf>> {
    let config = &state.config;
    let mut sources = BTreeMap::new();

    if config.attach_boot_iso {
        sources.insert(AttachmentCategory::BootIso, state.iso_path()?.to_path_buf());
    }

    if let Some(cd_path) = &state.cd_path {
        sources.insert(AttachmentCategory::CdFiles, cd_path.clone());
    }

    if config.guest_additions_mode == GuestAdditionsMode::Attach {
        let path = match &state.guest_additions_path {
            Some(path) => path.clone(),
            None => state.driver.iso().await?,
        };
        sources.insert(AttachmentCategory::GuestAdditions, path);
    } else {
        tracing::debug!(mode = ?config.guest_additions_mode, "Not attaching guest additions");
    }

    Ok(sources)
}

impl StepAttachMedia {
    async fn attach_all(
        &mut self,
        state: &BuildState,
        vm: &str,
        sources: BTreeMap<AttachmentCategory, PathBuf>,
    ) -> BuildResult<()> {
        let driver = state.driver.clone();

        let needs_virtio = sources
            .keys()
            .any(|c| interface_for(&state.config, *c) == MediaInterface::Virtio);
        if needs_virtio {
            let version = driver.version().await?;
            check_interface_supported(MediaInterface::Virtio, &version)?;
        }

        for (category, source) in sources {
            let resolved = tokio::fs::canonicalize(&source).await.map_err(|e| {
                BuildError::Storage(format!(
                    "error resolving symlink for ISO {}: {}",
                    source.display(),
                    e
                ))
            })?;

            let (medium, medium_type) = if category == AttachmentCategory::BootIso && is_vhd(&resolved) {
                state.ui.say("Copying boot VHD...");
                let staged = stage_vhd(&resolved)
                    .await
                    .map_err(|e| e.context("error copying VHD file"))?;
                (staged, MediumType::Hdd)
            } else {
                (resolved, MediumType::DvdDrive)
            };

            let attachment = MediaAttachment::new(
                category,
                interface_for(&state.config, category),
                medium_type,
                medium,
            );
            state.ui.message(&format!("Mounting {}...", category.label()));
            tracing::debug!(
                %category,
                controller = attachment.slot.controller,
                port = attachment.slot.port,
                device = attachment.slot.device,
                medium = %attachment.medium.display(),
                "Attaching medium"
            );

            driver
                .vboxmanage(&attachment.attach_command(vm))
                .await
                .map_err(|e| e.context("error attaching ISO"))?;

            if let Some(detach) = attachment.detach_command(vm) {
                self.unmount_commands.insert(category, detach);
            }
        }
        Ok(())
    }

    async fn detach_all(&mut self, state: &BuildState) {
        for (category, command) in std::mem::take(&mut self.unmount_commands) {
            if let Err(e) = state.driver.vboxmanage(&command).await {
                tracing::warn!(%category, error = %e, "Error detaching ISO");
            }
        }
    }
}

#[async_trait]
impl Step for StepAttachMedia {
    fn name(&self) -> &'static str {
        "attach_media"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        state.ui.say("Mounting ISOs...");
        self.unmount_commands.clear();

        let sources = collect_sources(state).await?;
        if sources.is_empty() {
            state.ui.message("No ISOs to mount; continuing...");
            return Ok(());
        }

        let vm = state.vm_name()?.to_string();
        if let Err(e) = self.attach_all(state, &vm, sources).await {
            self.detach_all(state).await;
            return Err(e);
        }

        state.disk_unmount_commands = self.unmount_commands.clone();
        Ok(())
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> BuildResult<()> {
        if self.unmount_commands.is_empty() {
            return Ok(());
        }
        if state.detached_isos {
            self.unmount_commands.clear();
            return Ok(());
        }
        self.detach_all(state).await;
        Ok(())
    }
}
