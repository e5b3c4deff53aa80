//! Stops the VM once provisioning is done.

use std::time::Duration;

use async_trait::async_trait;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use crate::config::ShutdownMode;
use crate::pipeline::Step;
use crate::state::BuildState;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct StepShutdown;

impl StepShutdown {
    pub fn new() -> Self {
        Self
    }
}

/// Poll until the VM stops. A timeout too large to represent as an instant
/// means no deadline.
async fn wait_until_stopped(state: &BuildState, vm: &str, timeout: Duration) -> BuildResult<()> {
    let deadline = tokio::time::Instant::now().checked_add(timeout);

    loop {
        if !state.driver.is_running(vm).await? {
            return Ok(());
        }
        if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
            return Err(BuildError::Timeout(format!(
                "{} did not shut down within {}s",
                vm,
                timeout.as_secs()
            )));
        }

        tokio::select! {
            _ = state.cancel.cancelled() => return Err(BuildError::Cancelled),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

#[async_trait]
impl Step for StepShutdown {
    fn name(&self) -> &'static str {
        "shutdown"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let vm = state.vm_name()?.to_string();
        let shutdown = state.config.shutdown.clone();

        match shutdown.mode {
            ShutdownMode::Force => {
                state.ui.say("Halting the virtual machine...");
                state
                    .driver
                    .stop(&vm)
                    .await
                    .map_err(|e| e.context("error stopping VM"))?;
            }
            ShutdownMode::Acpi => {
                state.ui.say("Gracefully halting virtual machine...");
                state
                    .driver
                    .stop_via_acpi(&vm)
                    .await
                    .map_err(|e| e.context("error sending ACPI shutdown"))?;
                state.ui.message("Waiting for VM to shut down...");
                wait_until_stopped(state, &vm, shutdown.timeout()).await?;
            }
        }

        let delay = shutdown.post_shutdown_delay();
        if !delay.is_zero() {
            tracing::debug!(delay_secs = delay.as_secs(), "Post-shutdown delay");
            tokio::time::sleep(delay).await;
        }

        tracing::info!(vm = %vm, "VM shut down");
        Ok(())
    }
}
