//! Exports the stopped VM as an appliance.

use std::path::PathBuf;

use async_trait::async_trait;
use vboxbuild_shared::constants::nat;
use vboxbuild_shared::errors::BuildResult;

use crate::config::{BuildConfig, CommType};
use crate::pipeline::Step;
use crate::state::BuildState;
use crate::vbox_args;

/// Produces `exported_path`.
#[derive(Debug, Default)]
pub struct StepExport;

impl StepExport {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn output_path(config: &BuildConfig, vm: &str) -> PathBuf {
    config
        .export
        .output_directory
        .join(format!("{}.{}", vm, config.export.format.extension()))
}

pub(crate) fn export_command(config: &BuildConfig, vm: &str, output: &std::path::Path) -> Vec<String> {
    let mut command = vbox_args!["export", vm, "--output", output.display()];
    if config.export.manifest {
        command.push("--manifest".to_string());
    }
    command
}

#[async_trait]
impl Step for StepExport {
    fn name(&self) -> &'static str {
        "export"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let config = state.config.clone();
        if config.export.skip {
            tracing::info!("Skipping export");
            return Ok(());
        }

        let vm = state.vm_name()?.to_string();
        let driver = state.driver.clone();

        // The forwarding rule would otherwise end up in the appliance.
        if !config.skip_nat_mapping && config.communicator.comm_type != CommType::None {
            state.ui.message("Deleting forwarded port mapping for the communicator");
            driver
                .vboxmanage(&vbox_args!["modifyvm", vm, "--natpf1", "delete", nat::COMM_RULE_NAME])
                .await
                .map_err(|e| e.context("error deleting port forwarding rule"))?;
        }

        tokio::fs::create_dir_all(&config.export.output_directory).await?;
        let output = output_path(&config, &vm);

        state.ui.say("Exporting virtual machine...");
        let command = export_command(&config, &vm, &output);
        tracing::debug!(command = %command.join(" "), "Export");
        driver
            .vboxmanage(&command)
            .await
            .map_err(|e| e.context("error exporting virtual machine"))?;

        tracing::info!(path = %output.display(), "VM exported");
        state.exported_path = Some(output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExportFormat;
    use crate::steps::testing::harness;

    fn config(dir: &std::path::Path) -> BuildConfig {
        let mut config = BuildConfig::default();
        config.export.output_directory = dir.join("out");
        config
    }

    #[tokio::test]
    async fn test_export_removes_rule_then_exports() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(config(dir.path()));

        StepExport::new().run(&mut h.state).await.unwrap();

        let expected = dir.path().join("out").join("foo.ovf");
        let calls = h.driver.vboxmanage_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vbox_args!["modifyvm", "foo", "--natpf1", "delete", "vboxbuildcomm"]);
        assert_eq!(calls[1], vbox_args!["export", "foo", "--output", expected.display()]);
        assert_eq!(h.state.exported_path.as_deref(), Some(expected.as_path()));
        assert!(dir.path().join("out").is_dir());
    }

    #[tokio::test]
    async fn test_ova_with_manifest_and_no_communicator() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.export.format = ExportFormat::Ova;
        config.export.manifest = true;
        config.communicator.comm_type = CommType::None;
        let mut h = harness(config);

        StepExport::new().run(&mut h.state).await.unwrap();

        let calls = h.driver.vboxmanage_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0][3].ends_with("foo.ova"));
        assert_eq!(calls[0].last().map(String::as_str), Some("--manifest"));
    }

    #[tokio::test]
    async fn test_skip() {
        let mut config = BuildConfig::default();
        config.export.skip = true;
        let mut h = harness(config);

        StepExport::new().run(&mut h.state).await.unwrap();
        assert!(h.driver.calls().is_empty());
        assert!(h.state.exported_path.is_none());
    }

    #[tokio::test]
    async fn test_export_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(config(dir.path()));
        h.driver.fail_when(1, "disk busy", |call| call.is_subcommand("export"));

        let err = StepExport::new().run(&mut h.state).await.unwrap_err();
        assert!(err.to_string().contains("error exporting virtual machine"));
        assert!(h.state.exported_path.is_none());
    }
}
