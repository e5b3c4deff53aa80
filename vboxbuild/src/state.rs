//! Per-build context shared by every step.
//!
//! Values produced by one step and consumed by later ones are explicit,
//! typed fields. Reading a required value that no earlier step produced is
//! a programming error and surfaces as [`BuildError::Internal`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use crate::config::BuildConfig;
use crate::driver::Driver;
use crate::media::AttachmentCategory;
use crate::ui::Ui;

pub struct BuildState {
    pub driver: Arc<dyn Driver>,
    pub ui: Arc<dyn Ui>,
    pub config: Arc<BuildConfig>,
    pub cancel: CancellationToken,

    /// Name of the VM once it was created.
    pub vm_name: Option<String>,
    /// Host port the communicator connects to; 0 when there is none.
    pub comm_host_port: Option<u16>,
    /// Inverse commands for every optical medium attached by this build.
    pub disk_unmount_commands: BTreeMap<AttachmentCategory, Vec<String>>,
    /// Set once the recorded media were detached.
    pub detached_isos: bool,

    pub iso_path: Option<PathBuf>,
    pub cd_path: Option<PathBuf>,
    pub guest_additions_path: Option<PathBuf>,
    pub floppy_path: Option<PathBuf>,

    /// Address the guest reaches the host's HTTP server on.
    pub http_ip: Option<String>,
    /// Hypervisor defaults for the guest OS type; empty when probing failed.
    pub vm_defaults: Option<HashMap<String, String>>,
    pub exported_path: Option<PathBuf>,

    /// First halting error, rendered for the host.
    pub error: Option<String>,
    pub halted: bool,
    pub cancelled: bool,

    /// Host-supplied values whose shape this crate does not own.
    pub extra: HashMap<String, serde_json::Value>,
}

impl BuildState {
    pub fn new(driver: Arc<dyn Driver>, ui: Arc<dyn Ui>, config: Arc<BuildConfig>) -> Self {
        Self {
            driver,
            ui,
            config,
            cancel: CancellationToken::new(),
            vm_name: None,
            comm_host_port: None,
            disk_unmount_commands: BTreeMap::new(),
            detached_isos: false,
            iso_path: None,
            cd_path: None,
            guest_additions_path: None,
            floppy_path: None,
            http_ip: None,
            vm_defaults: None,
            exported_path: None,
            error: None,
            halted: false,
            cancelled: false,
            extra: HashMap::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn vm_name(&self) -> BuildResult<&str> {
        required("vm_name", self.vm_name.as_deref())
    }

    pub fn iso_path(&self) -> BuildResult<&Path> {
        required("iso_path", self.iso_path.as_deref())
    }

    pub fn guest_additions_path(&self) -> BuildResult<&Path> {
        required("guest_additions_path", self.guest_additions_path.as_deref())
    }

    pub fn comm_host_port(&self) -> BuildResult<u16> {
        required("comm_host_port", self.comm_host_port)
    }

    /// Probed default for `key`, if probing produced one.
    pub fn vm_default(&self, key: &str) -> Option<&str> {
        self.vm_defaults
            .as_ref()
            .and_then(|defaults| defaults.get(key))
            .map(String::as_str)
    }

    /// Record the first halting error and surface it to the user.
    pub fn halt_with(&mut self, err: &BuildError) {
        let message = err.to_string();
        self.ui.error(&message);
        self.error.get_or_insert(message);
        self.halted = true;
    }

    /// Whether the build ended in a state that allows keeping resources.
    pub fn succeeded(&self) -> bool {
        !self.halted && !self.cancelled
    }
}

fn required<T>(key: &str, value: Option<T>) -> BuildResult<T> {
    value.ok_or_else(|| {
        BuildError::Internal(format!("{} was read before any step produced it", key))
    })
}
