//! Boots the VM.

use async_trait::async_trait;
use vboxbuild_shared::errors::BuildResult;

use crate::pipeline::Step;
use crate::state::BuildState;
use crate::vbox_args;

/// Starts the VM headless or with a GUI. Cleanup powers it off when it is
/// still running, so a halted build never leaves a live VM behind.
#[derive(Debug, Default)]
pub struct StepRun {
    vm_name: Option<String>,
}

impl StepRun {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Step for StepRun {
    fn name(&self) -> &'static str {
        "run"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let vm = state.vm_name()?.to_string();
        let headless = state.config.headless;

        state.ui.say("Starting the virtual machine...");
        let ui_type = if headless {
            state.ui.message(
                "The VM will be run headless, without a GUI. If you want to\n\
                 view the screen of the VM, connect via VRDP without a password.",
            );
            "headless"
        } else {
            "gui"
        };

        state
            .driver
            .vboxmanage(&vbox_args!["startvm", vm, "--type", ui_type])
            .await
            .map_err(|e| e.context("error starting VM"))?;

        tracing::info!(vm = %vm, ui_type, "VM started");
        self.vm_name = Some(vm);
        Ok(())
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let Some(vm) = self.vm_name.take() else {
            return Ok(());
        };

        if state.driver.is_running(&vm).await? {
            tracing::debug!(vm = %vm, "VM still running, powering off");
            if let Err(e) = state.driver.stop(&vm).await {
                state.ui.error(&format!("Error shutting down VM: {}", e));
                return Err(e);
            }
        }
        Ok(())
    }
}
