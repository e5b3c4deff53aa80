//! Creates and configures the VM.

use async_trait::async_trait;
use vboxbuild_shared::errors::BuildResult;

use crate::config::{BuildConfig, RtcTimeBase};
use crate::pipeline::Step;
use crate::state::BuildState;
use crate::vbox_args;
use crate::version::audio_driver_flag;

const FALLBACK_GFX_CONTROLLER: &str = "vboxvga";

/// Produces `vm_name`. Cleanup deletes the VM unless it should stay
/// registered after a successful build.
#[derive(Debug, Default)]
pub struct StepCreateVm {
    vm_name: Option<String>,
}

impl StepCreateVm {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Ordered configuration commands for a new VM.
pub(crate) fn create_commands(
    config: &BuildConfig,
    audio_flag: &str,
    gfx_controller: &str,
) -> Vec<Vec<String>> {
    let name = config.vm_name.as_str();
    let hw = &config.hardware;
    let on_off = |flag: bool| if flag { "on" } else { "off" };

    let mut commands = vec![
        vbox_args!["createvm", "--name", name, "--ostype", config.guest_os_type, "--register"],
        vbox_args![
            "modifyvm", name, "--boot1", "disk", "--boot2", "dvd", "--boot3", "none", "--boot4", "none",
        ],
        vbox_args!["modifyvm", name, "--cpus", hw.cpus],
    ];
    if hw.cpus > 1 {
        commands.push(vbox_args!["modifyvm", name, "--ioapic", "on"]);
    }
    commands.push(vbox_args!["modifyvm", name, "--memory", hw.memory]);
    commands.push(vbox_args!["modifyvm", name, "--usb", on_off(hw.usb)]);

    let mut audio = vbox_args!["modifyvm", name, audio_flag, hw.sound];
    if !hw.sound.eq_ignore_ascii_case("none") {
        audio.extend(vbox_args!["--audioin", "on", "--audioout", "on"]);
    }
    audio.extend(vbox_args!["--audiocontroller", config.audio_controller]);
    commands.push(audio);

    commands.push(vbox_args!["modifyvm", name, "--chipset", config.chipset]);
    commands.push(vbox_args!["modifyvm", name, "--firmware", config.firmware]);

    let mut nics = vbox_args!["modifyvm", name];
    for index in 1..=8 {
        nics.push(format!("--nictype{index}"));
        nics.push(config.nic_type.clone());
    }
    commands.push(nics);

    commands.push(vbox_args![
        "modifyvm", name, "--graphicscontroller", gfx_controller, "--vram", config.gfx_vram_size,
    ]);
    commands.push(vbox_args![
        "modifyvm",
        name,
        "--rtcuseutc",
        on_off(config.rtc_time_base == RtcTimeBase::Utc),
    ]);
    if let Some(nested) = config.nested_virt {
        commands.push(vbox_args!["modifyvm", name, "--nested-hw-virt", on_off(nested)]);
    }
    commands.push(vbox_args!["modifyvm", name, "--accelerate3d", on_off(config.gfx_accelerate_3d)]);
    if let Some(resolution) = config.gfx_efi_resolution.as_deref().filter(|r| !r.is_empty()) {
        commands.push(vbox_args![
            "setextradata", name, "VBoxInternal2/EfiGraphicsResolution", resolution,
        ]);
    }

    commands
}

#[async_trait]
impl Step for StepCreateVm {
    fn name(&self) -> &'static str {
        "create_vm"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let driver = state.driver.clone();
        let config = state.config.clone();

        let version = driver.version().await?;
        let gfx_controller = config
            .gfx_controller
            .clone()
            .or_else(|| state.vm_default("graphicscontroller").map(str::to_string))
            .unwrap_or_else(|| FALLBACK_GFX_CONTROLLER.to_string());

        state.ui.say("Creating virtual machine...");
        for command in create_commands(&config, audio_driver_flag(&version), &gfx_controller) {
            if let Err(e) = driver.vboxmanage(&command).await {
                if let Some(name) = self.vm_name.take() {
                    tracing::warn!(vm = %name, "Deleting partially configured VM");
                    if let Err(delete_err) = driver.delete(&name).await {
                        tracing::warn!(vm = %name, error = %delete_err, "Failed to delete partial VM");
                    }
                }
                return Err(e.context("error creating VM"));
            }

            if self.vm_name.is_none() {
                self.vm_name = Some(config.vm_name.clone());
            }
        }

        tracing::info!(vm = %config.vm_name, "Created VM");
        // Published only once fully configured; a partial VM is deleted above.
        state.vm_name = self.vm_name.clone();
        Ok(())
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let Some(name) = self.vm_name.take() else {
            return Ok(());
        };

        if state.config.keep_registered && state.succeeded() {
            state
                .ui
                .say("Keeping virtual machine registered with VirtualBox host (keep_registered = true)");
            return Ok(());
        }

        state.ui.say("Deregistering and deleting VM...");
        if let Err(e) = state.driver.delete(&name).await {
            state.ui.error(&format!("Error deleting VM: {}", e));
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::driver::DriverCall;
    use crate::steps::testing::{harness, harness_with};
    use crate::driver::FakeDriver;

    fn config() -> BuildConfig {
        let mut config = BuildConfig {
            vm_name: "ubuntu".into(),
            guest_os_type: "Ubuntu_64".into(),
            ..BuildConfig::default()
        };
        config.prepare().unwrap();
        config
    }

    #[test]
    fn test_command_order_and_defaults() {
        let commands = create_commands(&config(), "--audio-driver", "vmsvga");

        assert_eq!(
            commands[0],
            vec!["createvm", "--name", "ubuntu", "--ostype", "Ubuntu_64", "--register"]
        );
        assert_eq!(commands[2], vec!["modifyvm", "ubuntu", "--cpus", "1"]);
        assert!(!commands.iter().any(|c| c.contains(&"--ioapic".to_string())));
        assert!(commands.contains(&vbox_args![
            "modifyvm", "ubuntu", "--audio-driver", "none", "--audiocontroller", "ac97"
        ]));
        assert!(!commands.iter().any(|c| c.contains(&"--nested-hw-virt".to_string())));
        assert!(!commands.iter().any(|c| c[0] == "setextradata"));

        let nics = commands.iter().find(|c| c.contains(&"--nictype1".to_string())).unwrap();
        assert!(nics.contains(&"--nictype8".to_string()));
    }

    #[test]
    fn test_optional_commands() {
        let mut config = config();
        config.hardware.cpus = 4;
        config.hardware.sound = "pulse".into();
        config.nested_virt = Some(false);
        config.rtc_time_base = RtcTimeBase::Utc;
        config.gfx_efi_resolution = Some("1920x1080".into());

        let commands = create_commands(&config, "--audio", "vboxsvga");

        assert!(commands.contains(&vbox_args!["modifyvm", "ubuntu", "--ioapic", "on"]));
        assert!(commands.contains(&vbox_args![
            "modifyvm", "ubuntu", "--audio", "pulse", "--audioin", "on", "--audioout", "on",
            "--audiocontroller", "ac97"
        ]));
        assert!(commands.contains(&vbox_args!["modifyvm", "ubuntu", "--nested-hw-virt", "off"]));
        assert!(commands.contains(&vbox_args!["modifyvm", "ubuntu", "--rtcuseutc", "on"]));
        assert_eq!(
            commands.last().unwrap(),
            &vbox_args!["setextradata", "ubuntu", "VBoxInternal2/EfiGraphicsResolution", "1920x1080"]
        );
    }

    #[tokio::test]
    async fn test_run_uses_probed_graphics_default() {
        let mut h = harness(config());
        h.state.vm_name = None;
        h.state.vm_defaults = Some(HashMap::from([(
            "graphicscontroller".to_string(),
            "vmsvga".to_string(),
        )]));

        let mut step = StepCreateVm::new();
        step.run(&mut h.state).await.unwrap();

        assert_eq!(h.state.vm_name.as_deref(), Some("ubuntu"));
        assert!(h.driver.vboxmanage_calls().iter().any(|c| c.contains(&"vmsvga".to_string())));
    }

    #[tokio::test]
    async fn test_old_version_uses_old_audio_flag() {
        let mut h = harness_with(config(), FakeDriver::new().with_version("6.1.42"));
        StepCreateVm::new().run(&mut h.state).await.unwrap();

        assert!(h.driver.vboxmanage_calls().iter().any(|c| c[2] == "--audio"));
    }

    #[tokio::test]
    async fn test_partial_failure_deletes_vm() {
        let mut h = harness(config());
        h.driver.fail_when(1, "bad chipset", |call| call.has_arg("--chipset"));

        let mut step = StepCreateVm::new();
        let err = step.run(&mut h.state).await.unwrap_err();

        assert_eq!(err.stderr(), Some("bad chipset"));
        assert!(h.driver.calls().contains(&DriverCall::Delete { vm: "ubuntu".into() }));
        assert!(step.cleanup(&mut h.state).await.is_ok());
        assert_eq!(
            h.driver.calls().iter().filter(|c| matches!(c, DriverCall::Delete { .. })).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_cleanup_keeps_registered_vm_after_success() {
        let mut config = config();
        config.keep_registered = true;
        let mut h = harness(config);

        let mut step = StepCreateVm::new();
        step.run(&mut h.state).await.unwrap();
        step.cleanup(&mut h.state).await.unwrap();

        assert!(!h.driver.calls().iter().any(|c| matches!(c, DriverCall::Delete { .. })));
        assert!(h.ui.contains("keep_registered = true"));
    }

    #[tokio::test]
    async fn test_cleanup_deletes_when_halted_despite_keep_registered() {
        let mut config = config();
        config.keep_registered = true;
        let mut h = harness(config);

        let mut step = StepCreateVm::new();
        step.run(&mut h.state).await.unwrap();
        h.state.halted = true;
        step.cleanup(&mut h.state).await.unwrap();

        assert!(h.driver.calls().contains(&DriverCall::Delete { vm: "ubuntu".into() }));
    }
}
