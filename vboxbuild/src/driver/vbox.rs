//! Driver backed by the `VBoxManage` binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Datelike;
use tokio::process::Command;
use vboxbuild_shared::constants::controllers;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use super::vminfo::{controllers_of_type, parse_machine_readable};
use super::{Driver, Snapshot, SnapshotTree};
use crate::util::{RetryPolicy, retry};
use crate::vbox_args;
use crate::version::{extract_tool_version, sata_port_count_flag};

/// Attempts for `unregistervm`, which fails transiently while the session
/// of a just-stopped VM is still being released.
const DELETE_RETRY: RetryPolicy = RetryPolicy::attempts(5).with_delay(Duration::from_secs(1));

/// Time a powered-off VM needs before its session lock is released.
const POWEROFF_SETTLE: Duration = Duration::from_secs(2);

const NO_SNAPSHOTS_MARKER: &str = "does not have any snapshots";
const GUEST_ADDITIONS_ISO_LABEL: &str = "Default Guest Additions ISO:";

pub struct VBoxDriver {
    tool_path: PathBuf,
    command_timeout: Option<Duration>,
    verified: bool,
}

impl VBoxDriver {
    /// Create a driver for the tool at `tool_path` and verify it.
    pub async fn new(tool_path: PathBuf, command_timeout: Option<Duration>) -> BuildResult<Self> {
        let mut driver = Self {
            tool_path,
            command_timeout,
            verified: false,
        };

        driver.verify().await.map_err(|e| {
            BuildError::Fatal(format!(
                "VBoxManage at {} is not usable: {}",
                driver.tool_path.display(),
                e
            ))
        })?;
        driver.verified = true;

        Ok(driver)
    }

    pub fn tool_path(&self) -> &Path {
        &self.tool_path
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    async fn execute(&self, args: &[String]) -> BuildResult<String> {
        tracing::debug!(args = ?args, "Executing VBoxManage");

        let mut cmd = Command::new(&self.tool_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match self.command_timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| {
                    BuildError::Timeout(format!(
                        "VBoxManage {} did not finish within {}s",
                        args.join(" "),
                        limit.as_secs()
                    ))
                })?,
            None => cmd.output().await,
        }
        .map_err(|e| {
            BuildError::command(
                args,
                format!("failed to run {}: {}", self.tool_path.display(), e),
            )
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() || has_error_banner(&stderr) {
            tracing::debug!(status = ?output.status.code(), %stderr, "VBoxManage failed");
            return Err(BuildError::command(args, stderr));
        }

        tracing::trace!(%stdout, "VBoxManage finished");
        Ok(stdout)
    }

    async fn vm_info(&self, vm: &str) -> BuildResult<std::collections::HashMap<String, String>> {
        let output = self
            .execute(&vbox_args!["showvminfo", vm, "--machinereadable"])
            .await?;
        parse_machine_readable(&output)
    }
}

/// `VBoxManage` sometimes reports errors with a zero exit code; its stderr
/// then carries a `VBoxManage<suffix>: error:` banner.
fn has_error_banner(stderr: &str) -> bool {
    stderr.match_indices("VBoxManage").any(|(index, marker)| {
        let rest = &stderr[index + marker.len()..];
        let suffix_len = rest
            .find(|c: char| !(c == '.' || c.is_ascii_lowercase()))
            .unwrap_or(rest.len());
        suffix_len > 0 && rest[suffix_len..].starts_with(": error:")
    })
}

fn sata_controller_args(vm: &str, controller: &str, port_count: u32, version: &str) -> Vec<String> {
    vbox_args![
        "storagectl",
        vm,
        "--name",
        controller,
        "--add",
        "sata",
        sata_port_count_flag(version),
        port_count,
    ]
}

fn suppress_messages_settings(year: i32) -> Vec<(&'static str, String)> {
    vec![
        ("GUI/RegistrationData", "triesLeft=0".to_string()),
        (
            "GUI/SuppressMessages",
            "confirmInputCapture,remindAboutAutoCapture,remindAboutMouseIntegrationOff,\
             remindAboutMouseIntegrationOn,remindAboutWrongColorDepth"
                .to_string(),
        ),
        ("GUI/UpdateDate", format!("1 d, {}-01-01, stable", year + 1)),
        ("GUI/UpdateCheckCount", "60".to_string()),
    ]
}

fn parse_guest_additions_iso(output: &str) -> BuildResult<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.split_once(GUEST_ADDITIONS_ISO_LABEL))
        .map(|(_, path)| path.trim())
        .find(|path| !path.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| {
            BuildError::Parse(format!(
                "cannot find {:?} in VBoxManage output (or it is empty)",
                GUEST_ADDITIONS_ISO_LABEL
            ))
        })
}

fn is_running_state(info: &std::collections::HashMap<String, String>) -> bool {
    matches!(
        info.get("VMState").map(String::as_str),
        Some("running" | "stopping" | "paused")
    )
}

#[async_trait]
impl Driver for VBoxDriver {
    async fn create_sata_controller(&self, vm: &str, controller: &str, port_count: u32) -> BuildResult<()> {
        let version = self.version().await?;
        self.execute(&sata_controller_args(vm, controller, port_count, &version))
            .await
            .map(drop)
    }

    async fn create_scsi_controller(&self, vm: &str, controller: &str) -> BuildResult<()> {
        self.execute(&vbox_args![
            "storagectl", vm, "--name", controller, "--add", "scsi", "--controller", "LSILogic",
        ])
        .await
        .map(drop)
    }

    async fn create_virtio_controller(&self, vm: &str, controller: &str) -> BuildResult<()> {
        self.execute(&vbox_args![
            "storagectl", vm, "--name", controller, "--add", "virtio", "--controller", "VirtIO",
        ])
        .await
        .map(drop)
    }

    async fn create_nvme_controller(&self, vm: &str, controller: &str, port_count: u32) -> BuildResult<()> {
        self.execute(&vbox_args![
            "storagectl", vm, "--name", controller, "--add", "pcie", "--controller", "NVMe",
            "--portcount", port_count,
        ])
        .await
        .map(drop)
    }

    async fn remove_floppy_controllers(&self, vm: &str) -> BuildResult<()> {
        let info = self.vm_info(vm).await?;
        for name in controllers_of_type(&info, controllers::FLOPPY_TYPE) {
            tracing::debug!(vm, controller = %name, "Removing floppy controller");
            self.execute(&vbox_args!["storagectl", vm, "--name", name, "--remove"])
                .await?;
        }
        Ok(())
    }

    async fn delete(&self, vm: &str) -> BuildResult<()> {
        let args = vbox_args!["unregistervm", vm, "--delete"];
        retry(DELETE_RETRY, |_| self.execute(&args), |_| true)
            .await
            .map(drop)
    }

    async fn import(&self, name: &str, path: &Path, flags: &[String]) -> BuildResult<()> {
        let mut args = vbox_args!["import", path.display(), "--vsys", "0", "--vmname", name];
        args.extend_from_slice(flags);
        self.execute(&args).await.map(drop)
    }

    async fn iso(&self) -> BuildResult<PathBuf> {
        let output = self.execute(&vbox_args!["list", "systemproperties"]).await?;
        let iso = parse_guest_additions_iso(&output)?;
        tracing::debug!(iso = %iso.display(), "Found default guest additions ISO");
        Ok(iso)
    }

    async fn is_running(&self, vm: &str) -> BuildResult<bool> {
        Ok(is_running_state(&self.vm_info(vm).await?))
    }

    async fn stop(&self, vm: &str) -> BuildResult<()> {
        self.execute(&vbox_args!["controlvm", vm, "poweroff"]).await?;
        tokio::time::sleep(POWEROFF_SETTLE).await;
        Ok(())
    }

    async fn stop_via_acpi(&self, vm: &str) -> BuildResult<()> {
        self.execute(&vbox_args!["controlvm", vm, "acpipowerbutton"])
            .await
            .map(drop)
    }

    async fn suppress_messages(&self) -> BuildResult<()> {
        for (key, value) in suppress_messages_settings(chrono::Utc::now().year()) {
            self.execute(&vbox_args!["setextradata", "global", key, value])
                .await?;
        }
        Ok(())
    }

    async fn vboxmanage(&self, args: &[String]) -> BuildResult<()> {
        self.execute(args).await.map(drop)
    }

    async fn vboxmanage_with_output(&self, args: &[String]) -> BuildResult<String> {
        self.execute(args).await
    }

    async fn verify(&self) -> BuildResult<()> {
        self.version().await.map(drop)
    }

    async fn version(&self) -> BuildResult<String> {
        let output = self.execute(&vbox_args!["--version"]).await?;
        let version = extract_tool_version(&output)?;
        tracing::debug!(%version, "VBoxManage version");
        Ok(version)
    }

    async fn load_snapshots(&self, vm: &str) -> BuildResult<Option<SnapshotTree>> {
        let output = match self
            .execute(&vbox_args!["snapshot", vm, "list", "--machinereadable"])
            .await
        {
            Ok(output) if output.contains(NO_SNAPSHOTS_MARKER) => return Ok(None),
            Ok(output) => output,
            Err(e) if e.to_string().contains(NO_SNAPSHOTS_MARKER) => return Ok(None),
            Err(e) => return Err(e),
        };

        let tree = SnapshotTree::parse(&output)?;
        Ok((!tree.is_empty()).then_some(tree))
    }

    async fn create_snapshot(&self, vm: &str, name: &str) -> BuildResult<()> {
        self.execute(&vbox_args!["snapshot", vm, "take", name])
            .await
            .map(drop)
    }

    async fn set_snapshot(&self, vm: &str, snapshot: &Snapshot) -> BuildResult<()> {
        self.execute(&vbox_args!["snapshot", vm, "restore", snapshot.uuid])
            .await
            .map(drop)
    }

    async fn delete_snapshot(&self, vm: &str, snapshot: &Snapshot) -> BuildResult<()> {
        self.execute(&vbox_args!["snapshot", vm, "delete", snapshot.uuid])
            .await
            .map(drop)
    }
}
