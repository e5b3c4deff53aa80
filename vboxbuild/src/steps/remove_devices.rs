//! Detaches recorded media and floppy devices before the VM is exported.

use async_trait::async_trait;
use vboxbuild_shared::constants::controllers;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use crate::pipeline::Step;
use crate::state::BuildState;
use crate::vbox_args;

/// Every removal is attempted even when an earlier one fails; all failures
/// are reported together.
#[derive(Debug, Default)]
pub struct StepRemoveDevices;

impl StepRemoveDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Step for StepRemoveDevices {
    fn name(&self) -> &'static str {
        "remove_devices"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let driver = state.driver.clone();
        let vm = state.vm_name()?.to_string();
        let mut failures = Vec::new();

        if state.floppy_path.is_some() {
            state.ui.say("Removing floppy drive...");
            let detach = vbox_args![
                "storageattach", vm, "--storagectl", controllers::FLOPPY, "--port", "0", "--device", "0",
                "--medium", "none",
            ];
            match driver.vboxmanage(&detach).await {
                Ok(()) => {
                    if let Err(e) = driver.remove_floppy_controllers(&vm).await {
                        failures.push(e.context("error removing floppy controller"));
                    }
                }
                Err(e) => failures.push(e.context("error removing floppy")),
            }
        }

        if !state.disk_unmount_commands.is_empty() {
            state.ui.say("Detaching ISOs...");
            let mut all_detached = true;
            for (category, command) in &state.disk_unmount_commands {
                tracing::debug!(%category, "Detaching medium");
                if let Err(e) = driver.vboxmanage(command).await {
                    all_detached = false;
                    failures.push(e.context(format!("error detaching {}", category.label())));
                }
            }
            if all_detached {
                state.detached_isos = true;
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Multiple(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::BuildConfig;
    use crate::driver::DriverCall;
    use crate::media::AttachmentCategory;
    use crate::steps::testing::harness;

    fn unmount(controller: &str, port: &str) -> Vec<String> {
        vbox_args![
            "storageattach", "myvm", "--storagectl", controller, "--port", port, "--device", "1",
            "--type", "dvddrive", "--medium", "none"
        ]
    }

    #[tokio::test]
    async fn test_nothing_recorded_means_no_calls() {
        let mut h = harness(BuildConfig::default());
        StepRemoveDevices::new().run(&mut h.state).await.unwrap();

        assert!(h.driver.calls().is_empty());
        assert!(!h.state.detached_isos);
    }

    #[tokio::test]
    async fn test_attached_iso_detached() {
        let mut h = harness(BuildConfig::default());
        h.state.disk_unmount_commands =
            BTreeMap::from([(AttachmentCategory::BootIso, unmount("SATA Controller", "13"))]);

        StepRemoveDevices::new().run(&mut h.state).await.unwrap();

        let calls = h.driver.vboxmanage_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][3], "SATA Controller");
        assert!(h.state.detached_isos);
    }

    #[tokio::test]
    async fn test_floppy_removed() {
        let mut h = harness(BuildConfig::default());
        h.state.floppy_path = Some("floppy.img".into());

        StepRemoveDevices::new().run(&mut h.state).await.unwrap();

        let calls = h.driver.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args().unwrap()[3], "Floppy Controller");
        assert_eq!(calls[1], DriverCall::RemoveFloppyControllers { vm: "foo".into() });
    }

    #[tokio::test]
    async fn test_failures_collected_and_removal_continues() {
        let mut h = harness(BuildConfig::default());
        h.state.disk_unmount_commands = BTreeMap::from([
            (AttachmentCategory::BootIso, unmount("IDE Controller", "0")),
            (AttachmentCategory::CdFiles, unmount("IDE Controller", "1")),
        ]);
        h.driver.fail_when(1, "medium locked", |call| call.has_arg("0"));

        let err = StepRemoveDevices::new().run(&mut h.state).await.unwrap_err();

        assert_eq!(h.driver.vboxmanage_calls().len(), 2);
        match err {
            BuildError::Multiple(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].to_string().contains("boot ISO"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!h.state.detached_isos);
    }
}
