//! In-memory driver that records every call.
//!
//! Used by tests and by dry runs. Failures are scripted with
//! [`FakeDriver::fail_when`]; outputs of `vboxmanage_with_output` are canned
//! per subcommand.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use super::{Driver, Snapshot, SnapshotTree};

/// One recorded driver invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    CreateSataController { vm: String, controller: String, port_count: u32 },
    CreateScsiController { vm: String, controller: String },
    CreateVirtioController { vm: String, controller: String },
    CreateNvmeController { vm: String, controller: String, port_count: u32 },
    RemoveFloppyControllers { vm: String },
    Delete { vm: String },
    Import { name: String, path: PathBuf, flags: Vec<String> },
    Iso,
    IsRunning { vm: String },
    Stop { vm: String },
    StopViaAcpi { vm: String },
    SuppressMessages,
    VBoxManage(Vec<String>),
    Verify,
    Version,
    LoadSnapshots { vm: String },
    CreateSnapshot { vm: String, name: String },
    SetSnapshot { vm: String, uuid: String },
    DeleteSnapshot { vm: String, uuid: String },
}

impl DriverCall {
    /// Arguments of a raw management command.
    pub fn args(&self) -> Option<&[String]> {
        match self {
            DriverCall::VBoxManage(args) => Some(args),
            _ => None,
        }
    }

    /// True for a raw command containing `needle` as one of its arguments.
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args().is_some_and(|args| args.iter().any(|a| a == needle))
    }

    /// True for a raw command whose first argument is `subcommand`.
    pub fn is_subcommand(&self, subcommand: &str) -> bool {
        self.args()
            .and_then(|args| args.first())
            .is_some_and(|first| first == subcommand)
    }
}

impl fmt::Display for DriverCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverCall::VBoxManage(args) => write!(f, "VBoxManage {}", args.join(" ")),
            DriverCall::CreateSataController { vm, controller, port_count } => {
                write!(f, "create SATA controller {controller:?} on {vm} ({port_count} ports)")
            }
            DriverCall::CreateScsiController { vm, controller } => {
                write!(f, "create SCSI controller {controller:?} on {vm}")
            }
            DriverCall::CreateVirtioController { vm, controller } => {
                write!(f, "create VirtIO controller {controller:?} on {vm}")
            }
            DriverCall::CreateNvmeController { vm, controller, port_count } => {
                write!(f, "create NVMe controller {controller:?} on {vm} ({port_count} ports)")
            }
            DriverCall::RemoveFloppyControllers { vm } => write!(f, "remove floppy controllers of {vm}"),
            DriverCall::Delete { vm } => write!(f, "delete {vm}"),
            DriverCall::Import { name, path, .. } => write!(f, "import {} as {name}", path.display()),
            DriverCall::Iso => write!(f, "locate guest additions ISO"),
            DriverCall::IsRunning { vm } => write!(f, "is {vm} running"),
            DriverCall::Stop { vm } => write!(f, "power off {vm}"),
            DriverCall::StopViaAcpi { vm } => write!(f, "ACPI shutdown {vm}"),
            DriverCall::SuppressMessages => write!(f, "suppress GUI messages"),
            DriverCall::Verify => write!(f, "verify"),
            DriverCall::Version => write!(f, "version"),
            DriverCall::LoadSnapshots { vm } => write!(f, "list snapshots of {vm}"),
            DriverCall::CreateSnapshot { vm, name } => write!(f, "take snapshot {name:?} of {vm}"),
            DriverCall::SetSnapshot { vm, uuid } => write!(f, "restore snapshot {uuid} of {vm}"),
            DriverCall::DeleteSnapshot { vm, uuid } => write!(f, "delete snapshot {uuid} of {vm}"),
        }
    }
}

type CallPredicate = Box<dyn Fn(&DriverCall) -> bool + Send + Sync>;

struct FailureRule {
    remaining: usize,
    stderr: String,
    matches: CallPredicate,
}

struct FakeState {
    calls: Vec<DriverCall>,
    failures: Vec<FailureRule>,
    outputs: HashMap<String, String>,
    version: String,
    iso: PathBuf,
    running: VecDeque<bool>,
    snapshots: Option<SnapshotTree>,
    next_snapshot: u32,
    verify_error: Option<String>,
}

pub struct FakeDriver {
    state: Mutex<FakeState>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                calls: Vec::new(),
                failures: Vec::new(),
                outputs: HashMap::new(),
                version: "7.0.10".to_string(),
                iso: PathBuf::from("/usr/share/virtualbox/VBoxGuestAdditions.iso"),
                running: VecDeque::new(),
                snapshots: None,
                next_snapshot: 1,
                verify_error: None,
            }),
        }
    }

    pub fn with_version(self, version: impl Into<String>) -> Self {
        self.state.lock().version = version.into();
        self
    }

    pub fn with_iso(self, iso: impl Into<PathBuf>) -> Self {
        self.state.lock().iso = iso.into();
        self
    }

    /// Canned stdout for `vboxmanage_with_output` calls whose first
    /// argument is `subcommand`.
    pub fn with_output(self, subcommand: impl Into<String>, output: impl Into<String>) -> Self {
        self.state.lock().outputs.insert(subcommand.into(), output.into());
        self
    }

    /// Answers for successive `is_running` calls; once drained, the VM is
    /// reported as stopped.
    pub fn with_running(self, answers: impl IntoIterator<Item = bool>) -> Self {
        self.state.lock().running = answers.into_iter().collect();
        self
    }

    pub fn with_snapshots(self, tree: SnapshotTree) -> Self {
        self.state.lock().snapshots = Some(tree);
        self
    }

    pub fn with_verify_error(self, stderr: impl Into<String>) -> Self {
        self.state.lock().verify_error = Some(stderr.into());
        self
    }

    /// Fail the next `times` calls matching `predicate` with a command
    /// error carrying `stderr`.
    pub fn fail_when<P>(&self, times: usize, stderr: impl Into<String>, predicate: P)
    where
        P: Fn(&DriverCall) -> bool + Send + Sync + 'static,
    {
        self.state.lock().failures.push(FailureRule {
            remaining: times,
            stderr: stderr.into(),
            matches: Box::new(predicate),
        });
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    /// Argument vectors of every raw management command, in order.
    pub fn vboxmanage_calls(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| call.args().map(<[String]>::to_vec))
            .collect()
    }

    pub fn snapshots(&self) -> Option<SnapshotTree> {
        self.state.lock().snapshots.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, call: DriverCall) -> BuildResult<()> {
        let mut state = self.state.lock();
        let failure = state
            .failures
            .iter_mut()
            .find(|rule| rule.remaining > 0 && (rule.matches)(&call))
            .map(|rule| {
                rule.remaining -= 1;
                rule.stderr.clone()
            });

        let args = match &call {
            DriverCall::VBoxManage(args) => args.clone(),
            other => vec![other.to_string()],
        };
        state.calls.push(call);

        match failure {
            Some(stderr) => Err(BuildError::command(&args, stderr)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn create_sata_controller(&self, vm: &str, controller: &str, port_count: u32) -> BuildResult<()> {
        self.record(DriverCall::CreateSataController {
            vm: vm.to_string(),
            controller: controller.to_string(),
            port_count,
        })
    }

    async fn create_scsi_controller(&self, vm: &str, controller: &str) -> BuildResult<()> {
        self.record(DriverCall::CreateScsiController {
            vm: vm.to_string(),
            controller: controller.to_string(),
        })
    }

    async fn create_virtio_controller(&self, vm: &str, controller: &str) -> BuildResult<()> {
        self.record(DriverCall::CreateVirtioController {
            vm: vm.to_string(),
            controller: controller.to_string(),
        })
    }

    async fn create_nvme_controller(&self, vm: &str, controller: &str, port_count: u32) -> BuildResult<()> {
        self.record(DriverCall::CreateNvmeController {
            vm: vm.to_string(),
            controller: controller.to_string(),
            port_count,
        })
    }

    async fn remove_floppy_controllers(&self, vm: &str) -> BuildResult<()> {
        self.record(DriverCall::RemoveFloppyControllers { vm: vm.to_string() })
    }

    async fn delete(&self, vm: &str) -> BuildResult<()> {
        self.record(DriverCall::Delete { vm: vm.to_string() })
    }

    async fn import(&self, name: &str, path: &Path, flags: &[String]) -> BuildResult<()> {
        self.record(DriverCall::Import {
            name: name.to_string(),
            path: path.to_path_buf(),
            flags: flags.to_vec(),
        })
    }

    async fn iso(&self) -> BuildResult<PathBuf> {
        self.record(DriverCall::Iso)?;
        Ok(self.state.lock().iso.clone())
    }

    async fn is_running(&self, vm: &str) -> BuildResult<bool> {
        self.record(DriverCall::IsRunning { vm: vm.to_string() })?;
        Ok(self.state.lock().running.pop_front().unwrap_or(false))
    }

    async fn stop(&self, vm: &str) -> BuildResult<()> {
        self.record(DriverCall::Stop { vm: vm.to_string() })
    }

    async fn stop_via_acpi(&self, vm: &str) -> BuildResult<()> {
        self.record(DriverCall::StopViaAcpi { vm: vm.to_string() })
    }

    async fn suppress_messages(&self) -> BuildResult<()> {
        self.record(DriverCall::SuppressMessages)
    }

    async fn vboxmanage(&self, args: &[String]) -> BuildResult<()> {
        self.record(DriverCall::VBoxManage(args.to_vec()))
    }

    async fn vboxmanage_with_output(&self, args: &[String]) -> BuildResult<String> {
        self.record(DriverCall::VBoxManage(args.to_vec()))?;
        let state = self.state.lock();
        Ok(args
            .first()
            .and_then(|subcommand| state.outputs.get(subcommand))
            .cloned()
            .unwrap_or_default())
    }

    async fn verify(&self) -> BuildResult<()> {
        self.record(DriverCall::Verify)?;
        match self.state.lock().verify_error.clone() {
            Some(stderr) => Err(BuildError::Fatal(stderr)),
            None => Ok(()),
        }
    }

    async fn version(&self) -> BuildResult<String> {
        self.record(DriverCall::Version)?;
        Ok(self.state.lock().version.clone())
    }

    async fn load_snapshots(&self, vm: &str) -> BuildResult<Option<SnapshotTree>> {
        self.record(DriverCall::LoadSnapshots { vm: vm.to_string() })?;
        Ok(self
            .state
            .lock()
            .snapshots
            .clone()
            .filter(|tree| !tree.is_empty()))
    }

    async fn create_snapshot(&self, vm: &str, name: &str) -> BuildResult<()> {
        self.record(DriverCall::CreateSnapshot {
            vm: vm.to_string(),
            name: name.to_string(),
        })?;
        let mut state = self.state.lock();
        let uuid = format!("snapshot-{:04}", state.next_snapshot);
        state.next_snapshot += 1;
        state
            .snapshots
            .get_or_insert_with(SnapshotTree::new)
            .push(name, uuid);
        Ok(())
    }

    async fn set_snapshot(&self, vm: &str, snapshot: &Snapshot) -> BuildResult<()> {
        self.record(DriverCall::SetSnapshot {
            vm: vm.to_string(),
            uuid: snapshot.uuid.clone(),
        })?;
        match self.state.lock().snapshots.as_mut() {
            Some(tree) => tree.set_current(&snapshot.uuid),
            None => Err(BuildError::Internal(format!("{vm} has no snapshots"))),
        }
    }

    async fn delete_snapshot(&self, vm: &str, snapshot: &Snapshot) -> BuildResult<()> {
        self.record(DriverCall::DeleteSnapshot {
            vm: vm.to_string(),
            uuid: snapshot.uuid.clone(),
        })?;
        match self.state.lock().snapshots.as_mut() {
            Some(tree) => tree.remove(&snapshot.uuid).map(drop),
            None => Err(BuildError::Internal(format!("{vm} has no snapshots"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbox_args;

    #[tokio::test]
    async fn test_records_calls_in_order() {
        let driver = FakeDriver::new();
        driver.vboxmanage(&vbox_args!["modifyvm", "vm", "--nic1", "nat"]).await.unwrap();
        driver.stop("vm").await.unwrap();

        let calls = driver.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].has_arg("--nic1"));
        assert_eq!(calls[1], DriverCall::Stop { vm: "vm".into() });
        assert_eq!(driver.vboxmanage_calls(), vec![vbox_args!["modifyvm", "vm", "--nic1", "nat"]]);
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed() {
        let driver = FakeDriver::new();
        driver.fail_when(1, "A NAT rule of this name already exists", |call| call.has_arg("--natpf1"));

        let args = vbox_args!["modifyvm", "vm", "--natpf1", "rule"];
        let err = driver.vboxmanage(&args).await.unwrap_err();
        assert_eq!(err.stderr(), Some("A NAT rule of this name already exists"));
        assert!(driver.vboxmanage(&args).await.is_ok());
    }

    #[tokio::test]
    async fn test_canned_output_by_subcommand() {
        let driver = FakeDriver::new().with_output("showvminfo", "memory=1024");
        let out = driver
            .vboxmanage_with_output(&vbox_args!["showvminfo", "vm", "--machinereadable"])
            .await
            .unwrap();
        assert_eq!(out, "memory=1024");
        assert_eq!(driver.vboxmanage_with_output(&vbox_args!["list", "vms"]).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle() {
        let driver = FakeDriver::new();
        assert!(!driver.has_snapshots("vm").await.unwrap());

        driver.create_snapshot("vm", "base").await.unwrap();
        driver.create_snapshot("vm", "provisioned").await.unwrap();
        let current = driver.current_snapshot("vm").await.unwrap().unwrap();
        assert_eq!(current.name, "provisioned");

        driver.delete_snapshot("vm", &current).await.unwrap();
        let current = driver.current_snapshot("vm").await.unwrap().unwrap();
        assert_eq!(current.name, "base");
    }

    #[tokio::test]
    async fn test_running_script_drains_to_stopped() {
        let driver = FakeDriver::new().with_running([true, true]);
        assert!(driver.is_running("vm").await.unwrap());
        assert!(driver.is_running("vm").await.unwrap());
        assert!(!driver.is_running("vm").await.unwrap());
    }
}
