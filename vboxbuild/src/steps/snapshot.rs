//! Snapshot handling for builds that start from an existing VM.

use async_trait::async_trait;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use crate::driver::Snapshot;
use crate::pipeline::Step;
use crate::state::BuildState;

/// Adopts the configured VM and restores `attach_snapshot`.
///
/// Produces `vm_name`. Cleanup restores the snapshot that was current
/// before, unless the build succeeded and the VM stays registered.
#[derive(Debug, Default)]
pub struct StepSetSnapshot {
    revert_to: Option<Snapshot>,
}

impl StepSetSnapshot {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Step for StepSetSnapshot {
    fn name(&self) -> &'static str {
        "set_snapshot"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let vm = state.config.vm_name.clone();
        state.vm_name = Some(vm.clone());

        let Some(wanted) = state.config.attach_snapshot.clone() else {
            return Ok(());
        };

        let tree = state
            .driver
            .load_snapshots(&vm)
            .await?
            .ok_or_else(|| BuildError::Config(format!("VM {} has no snapshots", vm)))?;

        let matches = tree.find_by_name(&wanted);
        let target = match matches.as_slice() {
            [single] => (*single).clone(),
            [] => {
                return Err(BuildError::Config(format!(
                    "snapshot {:?} not found on VM {}",
                    wanted, vm
                )));
            }
            _ => {
                return Err(BuildError::Config(format!(
                    "snapshot name {:?} is ambiguous on VM {}",
                    wanted, vm
                )));
            }
        };

        let previous = tree.current().cloned();
        if previous.as_ref() == Some(&target) {
            tracing::debug!(snapshot = %wanted, "Snapshot already current");
            return Ok(());
        }

        state.ui.say(&format!("Attaching snapshot {}...", wanted));
        state
            .driver
            .set_snapshot(&vm, &target)
            .await
            .map_err(|e| e.context(format!("error attaching snapshot {}", wanted)))?;
        self.revert_to = previous;
        Ok(())
    }

    async fn cleanup(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let Some(previous) = self.revert_to.take() else {
            return Ok(());
        };
        if state.config.keep_registered && state.succeeded() {
            return Ok(());
        }

        let vm = state.vm_name()?.to_string();
        state.ui.say(&format!("Reverting to snapshot {}...", previous.name));
        state
            .driver
            .set_snapshot(&vm, &previous)
            .await
            .map_err(|e| e.context("error reverting snapshot"))
    }
}

/// Takes `target_snapshot` at the end of the build.
#[derive(Debug, Default)]
pub struct StepCreateSnapshot;

impl StepCreateSnapshot {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Step for StepCreateSnapshot {
    fn name(&self) -> &'static str {
        "create_snapshot"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let Some(target) = state.config.target_snapshot.clone() else {
            return Ok(());
        };
        let vm = state.vm_name()?.to_string();
        let driver = state.driver.clone();

        if let Some(tree) = driver.load_snapshots(&vm).await? {
            let existing: Vec<Snapshot> = tree.find_by_name(&target).into_iter().cloned().collect();
            if !existing.is_empty() {
                if !state.config.delete_target_snapshot {
                    return Err(BuildError::Conflict(format!(
                        "snapshot {:?} already exists on VM {} (set delete_target_snapshot to replace it)",
                        target, vm
                    )));
                }
                for snapshot in &existing {
                    state.ui.say(&format!("Deleting existing snapshot {}...", snapshot.name));
                    driver
                        .delete_snapshot(&vm, snapshot)
                        .await
                        .map_err(|e| e.context("error deleting snapshot"))?;
                }
            }
        }

        state.ui.say(&format!("Creating snapshot {}...", target));
        driver
            .create_snapshot(&vm, &target)
            .await
            .map_err(|e| e.context(format!("error creating snapshot {}", target)))
    }
}
