//! Probes the hypervisor's defaults for the guest OS type.
//!
//! A throw-away VM is created with `--default`, inspected and deleted
//! again. Nothing here can halt the build: on any failure the defaults
//! stay empty.

use std::collections::HashMap;

use async_trait::async_trait;
use vboxbuild_shared::constants::tool;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use crate::driver::{Driver, parse_machine_readable};
use crate::pipeline::Step;
use crate::state::BuildState;
use crate::vbox_args;

#[derive(Debug, Default)]
pub struct StepGetVmDefaults;

impl StepGetVmDefaults {
    pub fn new() -> Self {
        Self
    }
}

async fn probe(driver: &dyn Driver, guest_os_type: &str) -> BuildResult<HashMap<String, String>> {
    let base_folder = tempfile::Builder::new()
        .prefix("vboxbuild-defaults")
        .tempdir()
        .map_err(|e| BuildError::Storage(format!("failed to create temp dir: {}", e)))?;
    let vm_name = format!("{}_{}", tool::TEMP_VM_PREFIX, chrono::Utc::now().timestamp());

    driver
        .vboxmanage(&vbox_args![
            "createvm",
            "--name",
            vm_name,
            "--ostype",
            guest_os_type,
            "--register",
            "--default",
            "--basefolder",
            base_folder.path().display(),
        ])
        .await
        .map_err(|e| e.context("failed to obtain VM defaults"))?;

    let info = driver
        .vboxmanage_with_output(&vbox_args!["showvminfo", vm_name, "--machinereadable"])
        .await
        .map_err(|e| e.context("failed to obtain VM defaults"));

    if let Err(e) = driver
        .vboxmanage(&vbox_args!["unregistervm", vm_name, "--delete"])
        .await
    {
        tracing::warn!(vm = %vm_name, error = %e, "Error deleting temp VM");
    }

    parse_machine_readable(&info?).map_err(|e| e.context("error parsing VM defaults"))
}

#[async_trait]
impl Step for StepGetVmDefaults {
    fn name(&self) -> &'static str {
        "get_vm_defaults"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        state.vm_defaults = Some(HashMap::new());

        let probed = probe(state.driver.as_ref(), &state.config.guest_os_type).await;
        match probed {
            Ok(defaults) => {
                tracing::debug!(count = defaults.len(), "VM defaults retrieved");
                state.vm_defaults = Some(defaults);
            }
            Err(e) => tracing::warn!(error = %e, "Continuing without VM defaults"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::driver::FakeDriver;
    use crate::steps::testing::harness_with;

    #[tokio::test]
    async fn test_defaults_parsed_and_temp_vm_deleted() {
        let driver = FakeDriver::new()
            .with_output("showvminfo", "graphicscontroller=\"vmsvga\"\nmemory=2048\n");
        let mut h = harness_with(BuildConfig::default(), driver);

        StepGetVmDefaults::new().run(&mut h.state).await.unwrap();

        assert_eq!(h.state.vm_default("graphicscontroller"), Some("vmsvga"));
        let calls = h.driver.vboxmanage_calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0][0], "createvm");
        assert!(calls[0][2].starts_with("vboxbuild_temp_vm_"));
        assert!(calls[0].contains(&"--default".to_string()));
        assert_eq!(calls[2][0], "unregistervm");
        assert_eq!(calls[2][1], calls[0][2]);
    }

    #[tokio::test]
    async fn test_unparseable_output_still_deletes_and_continues() {
        let mut h = harness_with(BuildConfig::default(), FakeDriver::new());

        StepGetVmDefaults::new().run(&mut h.state).await.unwrap();

        assert_eq!(h.state.vm_defaults, Some(HashMap::new()));
        assert_eq!(h.driver.vboxmanage_calls().last().unwrap()[0], "unregistervm");
    }

    #[tokio::test]
    async fn test_create_failure_is_not_fatal() {
        let mut h = harness_with(BuildConfig::default(), FakeDriver::new());
        h.driver.fail_when(1, "unknown OS type", |call| call.is_subcommand("createvm"));

        StepGetVmDefaults::new().run(&mut h.state).await.unwrap();

        assert_eq!(h.state.vm_defaults, Some(HashMap::new()));
        assert_eq!(h.driver.vboxmanage_calls().len(), 1);
    }
}
