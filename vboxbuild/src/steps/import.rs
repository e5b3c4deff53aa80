//! Imports an existing appliance as the build VM.

use async_trait::async_trait;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use crate::pipeline::Step;
use crate::state::BuildState;

/// Produces `vm_name` from the configured appliance. Cleanup deletes the
/// imported VM unless it should stay registered after a successful build.
#[derive(Debug, Default)]
pub struct StepImport {
    vm_name: Option<String>,
}

impl StepImport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Step for StepImport {
    fn name(&self) -> &'static str {
        "import"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let config = state.config.clone();
        let Some(import) = config.import.as_ref() else {
            return Err(BuildError::Config("no appliance configured to import".to_string()));
        };

        if !import.source_path.is_file() {
            return Err(BuildError::Config(format!(
                "appliance {} does not exist",
                import.source_path.display()
            )));
        }

        state
            .ui
            .say(&format!("Importing VM: {}", import.source_path.display()));
        state
            .driver
            .import(&config.vm_name, &import.source_path, &import.flags)
            .await
            .map_err(|e| e.context("error importing VM"))?;

        tracing::info!(vm = %config.vm_name, source = %import.source_path.display(), "Imported VM");
        self.vm_name = Some(config.vm_name.clone());
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

        state.ui.say("Deregistering and deleting imported VM...");
        if let Err(e) = state.driver.delete(&name).await {
            state.ui.error(&format!("Error deleting VM: {}", e));
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, ImportConfig};
    use crate::driver::DriverCall;
    use crate::steps::testing::harness;

    fn config(source_path: std::path::PathBuf) -> BuildConfig {
        BuildConfig {
            vm_name: "imported".into(),
            import: Some(ImportConfig {
                source_path,
                flags: vec!["--eula".into(), "accept".into()],
            }),
            ..BuildConfig::default()
        }
    }

    fn appliance() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.ova");
        std::fs::write(&path, "ova").unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_import_sets_vm_name() {
        let (_dir, path) = appliance();
        let mut h = harness(config(path.clone()));
        h.state.vm_name = None;

        StepImport::new().run(&mut h.state).await.unwrap();

        assert_eq!(h.state.vm_name.as_deref(), Some("imported"));
        assert_eq!(
            h.driver.calls(),
            vec![DriverCall::Import {
                name: "imported".into(),
                path,
                flags: vec!["--eula".into(), "accept".into()],
            }]
        );
        assert!(h.ui.contains("Importing VM:"));
    }

    #[tokio::test]
    async fn test_missing_appliance_imports_nothing() {
        let mut h = harness(config("/nonexistent/base.ova".into()));
        h.state.vm_name = None;

        let mut step = StepImport::new();
        let err = step.run(&mut h.state).await.unwrap_err();

        assert!(matches!(err, BuildError::Config(_)));
        assert!(h.driver.calls().is_empty());
        step.cleanup(&mut h.state).await.unwrap();
        assert!(h.driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_import_is_not_deleted() {
        let (_dir, path) = appliance();
        let mut h = harness(config(path));
        h.state.vm_name = None;
        h.driver
            .fail_when(1, "invalid appliance", |call| matches!(call, DriverCall::Import { .. }));

        let mut step = StepImport::new();
        let err = step.run(&mut h.state).await.unwrap_err();
        assert!(err.to_string().contains("error importing VM"));

        step.cleanup(&mut h.state).await.unwrap();
        assert!(!h.driver.calls().iter().any(|c| matches!(c, DriverCall::Delete { .. })));
    }

    #[tokio::test]
    async fn test_cleanup_deletes_unless_kept() {
        let (_dir, path) = appliance();

        let mut h = harness(config(path.clone()));
        let mut step = StepImport::new();
        step.run(&mut h.state).await.unwrap();
        step.cleanup(&mut h.state).await.unwrap();
        assert!(h.driver.calls().contains(&DriverCall::Delete { vm: "imported".into() }));

        let mut kept = config(path);
        kept.keep_registered = true;
        let mut h = harness(kept);
        let mut step = StepImport::new();
        step.run(&mut h.state).await.unwrap();
        step.cleanup(&mut h.state).await.unwrap();
        assert!(!h.driver.calls().iter().any(|c| matches!(c, DriverCall::Delete { .. })));
        assert!(h.ui.contains("keep_registered = true"));
    }
}
