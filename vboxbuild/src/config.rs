//! Build configuration.
//!
//! Loaded from JSON or YAML by the host, then normalized with
//! [`BuildConfig::prepare`] before any hypervisor command is issued.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vboxbuild_shared::constants::comm as const_comm;
use vboxbuild_shared::errors::{BuildError, BuildResult};

/// Lowest port used by optical media on SATA and VirtIO controllers.
const MEDIA_FIRST_PORT: u32 = 13;
const SCSI_PORTS: u32 = 16;
const VIRTIO_PORTS: u32 = 30;

// ============================================================================
// Enumerations
// ============================================================================

/// Controller interface optical media are attached to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaInterface {
    #[default]
    Ide,
    Sata,
    Virtio,
}

/// What to do with the hypervisor's guest additions ISO.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestAdditionsMode {
    /// Left to the host's upload machinery.
    #[default]
    Upload,
    /// Attached as an optical drive.
    Attach,
    Disable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommType {
    #[default]
    Ssh,
    Winrm,
    None,
}

/// Controller interface of the primary hard disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskInterface {
    #[default]
    Ide,
    Sata,
    Scsi,
    Pcie,
    Virtio,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Power the VM off.
    #[default]
    Force,
    /// Press the ACPI power button and wait.
    Acpi,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Ovf,
    Ova,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Ovf => "ovf",
            ExportFormat::Ova => "ova",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RtcTimeBase {
    #[default]
    #[serde(rename = "local", alias = "LOCAL")]
    Local,
    #[serde(rename = "UTC", alias = "utc")]
    Utc,
}

// ============================================================================
// Sections
// ============================================================================

/// Virtual hardware.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Number of CPUs. Default: 1
    #[serde(default)]
    pub cpus: i32,

    /// Memory in megabytes. Default: 512
    #[serde(default)]
    pub memory: i32,

    /// Host audio driver (`dsound`, `oss`, `alsa`, `pulse`, `coreaudio`,
    /// `null`). Default: none
    #[serde(default)]
    pub sound: String,

    #[serde(default)]
    pub usb: bool,
}

/// How the host reaches the guest once it boots.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommConfig {
    #[serde(rename = "type", default)]
    pub comm_type: CommType,

    /// Guest port. Default: 22 for SSH, 5985 for WinRM
    #[serde(default)]
    pub port: Option<u16>,
}

impl CommConfig {
    /// Guest-side port the communicator connects to.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.comm_type {
            CommType::Ssh => const_comm::SSH_PORT,
            CommType::Winrm => const_comm::WINRM_PORT,
            CommType::None => 0,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Primary disk size in megabytes.
    #[serde(default = "default_disk_size")]
    pub size_mb: u64,

    #[serde(default)]
    pub interface: DiskInterface,

    /// Medium format passed to `createmedium` (`VDI`, `VMDK`, `VHD`).
    #[serde(default = "default_disk_format")]
    pub format: String,

    /// Extra disks attached after the primary one.
    #[serde(default)]
    pub additional_sizes_mb: Vec<u64>,

    /// Ports of the SATA controller. Default: 1
    #[serde(default = "default_port_count")]
    pub sata_port_count: u32,

    /// Ports of the NVMe controller. Default: 1
    #[serde(default = "default_port_count")]
    pub nvme_port_count: u32,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            size_mb: default_disk_size(),
            interface: DiskInterface::default(),
            format: default_disk_format(),
            additional_sizes_mb: Vec::new(),
            sata_port_count: default_port_count(),
            nvme_port_count: default_port_count(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default)]
    pub mode: ShutdownMode,

    /// How long to wait for an ACPI shutdown. Default: 300
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_secs: u64,

    /// Pause after the VM stopped, for slow hosts to release locks.
    #[serde(default)]
    pub post_shutdown_delay_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            mode: ShutdownMode::default(),
            timeout_secs: default_shutdown_timeout(),
            post_shutdown_delay_secs: 0,
        }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn post_shutdown_delay(&self) -> Duration {
        Duration::from_secs(self.post_shutdown_delay_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub skip: bool,

    #[serde(default)]
    pub format: ExportFormat,

    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,

    /// Write a manifest next to the appliance.
    #[serde(default)]
    pub manifest: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            skip: false,
            format: ExportFormat::default(),
            output_directory: default_output_directory(),
            manifest: false,
        }
    }
}

/// Build from an existing appliance instead of creating a VM.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImportConfig {
    /// OVF or OVA file to import.
    pub source_path: PathBuf,

    /// Extra flags passed to `import`, e.g. `--eula accept`.
    #[serde(default)]
    pub flags: Vec<String>,
}

// ============================================================================
// Build configuration
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_vm_name")]
    pub vm_name: String,

    /// Hypervisor OS type identifier, e.g. `Ubuntu_64`. Default: Other
    #[serde(default = "default_guest_os_type")]
    pub guest_os_type: String,

    #[serde(default)]
    pub hardware: HardwareConfig,

    #[serde(default = "default_audio_controller")]
    pub audio_controller: String,

    #[serde(default = "default_chipset")]
    pub chipset: String,

    #[serde(default = "default_firmware")]
    pub firmware: String,

    /// NIC model applied to all eight adapters.
    #[serde(default = "default_nic_type")]
    pub nic_type: String,

    /// Graphics controller. When unset the probed default for the guest OS
    /// type is used, then `vboxvga`.
    #[serde(default)]
    pub gfx_controller: Option<String>,

    /// Video memory in megabytes. Default: 4
    #[serde(default = "default_vram")]
    pub gfx_vram_size: u32,

    #[serde(default)]
    pub gfx_accelerate_3d: bool,

    /// EFI framebuffer resolution hint, e.g. `1920x1080`.
    #[serde(default)]
    pub gfx_efi_resolution: Option<String>,

    #[serde(default)]
    pub rtc_time_base: RtcTimeBase,

    /// Nested hardware virtualization. `None` leaves the hypervisor default.
    #[serde(default)]
    pub nested_virt: Option<bool>,

    /// Keep the VM registered after a successful build.
    #[serde(default)]
    pub keep_registered: bool,

    /// Start the VM without a GUI.
    #[serde(default)]
    pub headless: bool,

    /// Appliance to import as the build VM.
    #[serde(default)]
    pub import: Option<ImportConfig>,

    #[serde(default)]
    pub iso_interface: MediaInterface,

    #[serde(default)]
    pub guest_additions_mode: GuestAdditionsMode,

    #[serde(default)]
    pub guest_additions_interface: MediaInterface,

    /// Attach the boot ISO supplied by the host. Default: true
    #[serde(default = "default_true")]
    pub attach_boot_iso: bool,

    #[serde(default)]
    pub communicator: CommConfig,

    #[serde(default = "default_host_port_min")]
    pub host_port_min: u16,

    #[serde(default = "default_host_port_max")]
    pub host_port_max: u16,

    /// Use the guest port directly instead of a NAT forwarding rule.
    #[serde(default)]
    pub skip_nat_mapping: bool,

    /// Host address the forwarding rule listens on.
    #[serde(default = "default_listen_address")]
    pub ssh_listen_address: String,

    /// Directory holding per-port advisory lock files.
    /// Default: `<tmp>/vboxbuild-ports`
    #[serde(default = "default_port_lock_dir")]
    pub port_lock_dir: PathBuf,

    #[serde(default)]
    pub disk: DiskConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Snapshot to restore before the build.
    #[serde(default)]
    pub attach_snapshot: Option<String>,

    /// Snapshot to take once the build succeeded.
    #[serde(default)]
    pub target_snapshot: Option<String>,

    /// Replace an existing snapshot named `target_snapshot`.
    #[serde(default)]
    pub delete_target_snapshot: bool,

    #[serde(default)]
    pub export: ExportConfig,

    /// Deadline for every `VBoxManage` call. Unset means no deadline.
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            vm_name: default_vm_name(),
            guest_os_type: default_guest_os_type(),
            hardware: HardwareConfig::default(),
            audio_controller: default_audio_controller(),
            chipset: default_chipset(),
            firmware: default_firmware(),
            nic_type: default_nic_type(),
            gfx_controller: None,
            gfx_vram_size: default_vram(),
            gfx_accelerate_3d: false,
            gfx_efi_resolution: None,
            rtc_time_base: RtcTimeBase::default(),
            nested_virt: None,
            keep_registered: false,
            headless: false,
            import: None,
            iso_interface: MediaInterface::default(),
            guest_additions_mode: GuestAdditionsMode::default(),
            guest_additions_interface: MediaInterface::default(),
            attach_boot_iso: true,
            communicator: CommConfig::default(),
            host_port_min: default_host_port_min(),
            host_port_max: default_host_port_max(),
            skip_nat_mapping: false,
            ssh_listen_address: default_listen_address(),
            port_lock_dir: default_port_lock_dir(),
            disk: DiskConfig::default(),
            shutdown: ShutdownConfig::default(),
            attach_snapshot: None,
            target_snapshot: None,
            delete_target_snapshot: false,
            export: ExportConfig::default(),
            command_timeout_secs: None,
        }
    }
}

impl BuildConfig {
    /// Load a configuration file. `.json` is parsed as JSON, anything else
    /// as YAML.
    pub fn from_path(path: &Path) -> BuildResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&raw)
        } else {
            Self::from_yaml(&raw)
        }
    }

    pub fn from_json(raw: &str) -> BuildResult<Self> {
        serde_json::from_str(raw).map_err(|e| BuildError::Config(e.to_string()))
    }

    pub fn from_yaml(raw: &str) -> BuildResult<Self> {
        serde_yaml::from_str(raw).map_err(|e| BuildError::Config(e.to_string()))
    }

    /// Apply defaults and validate. Every problem is reported at once.
    pub fn prepare(&mut self) -> BuildResult<()> {
        let mut errors = Vec::new();

        if self.hardware.cpus < 0 {
            errors.push(format!(
                "an invalid number of cpus was specified (cpus < 0): {}",
                self.hardware.cpus
            ));
        }
        if self.hardware.cpus == 0 {
            self.hardware.cpus = 1;
        }

        if self.hardware.memory < 0 {
            errors.push(format!(
                "an invalid memory size was specified (memory < 0): {}",
                self.hardware.memory
            ));
        }
        if self.hardware.memory == 0 {
            self.hardware.memory = 512;
        }

        if self.hardware.sound.is_empty() {
            self.hardware.sound = "none".to_string();
        }

        if self.vm_name.trim().is_empty() {
            errors.push("vm_name must not be empty".to_string());
        }

        if self.host_port_min == 0 {
            errors.push("host_port_min must be greater than 0".to_string());
        }
        if self.host_port_min > self.host_port_max {
            errors.push(format!(
                "host_port_min ({}) must be less than or equal to host_port_max ({})",
                self.host_port_min, self.host_port_max
            ));
        }

        if !(1..=30).contains(&self.disk.sata_port_count) {
            errors.push(format!(
                "sata_port_count must be between 1 and 30: {}",
                self.disk.sata_port_count
            ));
        }
        if !(1..=255).contains(&self.disk.nvme_port_count) {
            errors.push(format!(
                "nvme_port_count must be between 1 and 255: {}",
                self.disk.nvme_port_count
            ));
        }
        if self.disk.size_mb == 0 || self.disk.additional_sizes_mb.contains(&0) {
            errors.push("disk sizes must be greater than 0".to_string());
        }
        errors.extend(self.disk_layout_error());

        match (&self.attach_snapshot, &self.target_snapshot) {
            (Some(attach), Some(target)) if attach == target => errors.push(format!(
                "attach_snapshot and target_snapshot must differ: {:?}",
                attach
            )),
            (_, None) if self.delete_target_snapshot => {
                errors.push("delete_target_snapshot requires target_snapshot".to_string())
            }
            _ => {}
        }

        if let Some(import) = &self.import {
            if import.source_path.as_os_str().is_empty() {
                errors.push("import source_path must not be empty".to_string());
            }
            if self.attach_snapshot.is_some() {
                errors.push("import and attach_snapshot cannot be combined".to_string());
            }
        }

        if self.shutdown.mode == ShutdownMode::Acpi && self.shutdown.timeout_secs == 0 {
            errors.push("shutdown timeout_secs must be greater than 0 for acpi mode".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Config(errors.join("; ")))
        }
    }

    /// Disks occupy ports 0.. of their controller; they must fit and must not
    /// collide with the media ports on a shared controller.
    fn disk_layout_error(&self) -> Option<String> {
        let count = 1 + self.disk.additional_sizes_mb.len() as u32;
        let media_share = |interface: MediaInterface| {
            self.iso_interface == interface
                || (self.guest_additions_mode == GuestAdditionsMode::Attach
                    && self.guest_additions_interface == interface)
        };

        let limit = match self.disk.interface {
            DiskInterface::Ide if count > 1 => {
                return Some("additional disks are not supported on the ide interface".to_string());
            }
            DiskInterface::Ide => return None,
            DiskInterface::Sata if media_share(MediaInterface::Sata) => MEDIA_FIRST_PORT,
            DiskInterface::Sata => self.disk.sata_port_count,
            DiskInterface::Pcie => self.disk.nvme_port_count,
            DiskInterface::Scsi => SCSI_PORTS,
            DiskInterface::Virtio if media_share(MediaInterface::Virtio) => MEDIA_FIRST_PORT,
            DiskInterface::Virtio => VIRTIO_PORTS,
        };

        (count > limit).then(|| {
            format!(
                "{} disks do not fit the {:?} controller ({} ports available)",
                count, self.disk.interface, limit
            )
        })
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

fn default_vm_name() -> String {
    format!("vboxbuild-{}", chrono::Utc::now().timestamp())
}

fn default_guest_os_type() -> String {
    "Other".to_string()
}

fn default_audio_controller() -> String {
    "ac97".to_string()
}

fn default_chipset() -> String {
    "piix3".to_string()
}

fn default_firmware() -> String {
    "bios".to_string()
}

fn default_nic_type() -> String {
    "82540EM".to_string()
}

fn default_vram() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_host_port_min() -> u16 {
    const_comm::DEFAULT_HOST_PORT_MIN
}

fn default_host_port_max() -> u16 {
    const_comm::DEFAULT_HOST_PORT_MAX
}

fn default_listen_address() -> String {
    const_comm::DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_port_lock_dir() -> PathBuf {
    std::env::temp_dir().join("vboxbuild-ports")
}

fn default_disk_size() -> u64 {
    40_000
}

fn default_disk_format() -> String {
    "VDI".to_string()
}

fn default_port_count() -> u32 {
    1
}

fn default_shutdown_timeout() -> u64 {
    300
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("output-vboxbuild")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_applies_hardware_defaults() {
        let mut config = BuildConfig::default();
        config.prepare().unwrap();

        assert_eq!(config.hardware.cpus, 1);
        assert_eq!(config.hardware.memory, 512);
        assert_eq!(config.hardware.sound, "none");
    }

    #[test]
    fn test_prepare_collects_every_error() {
        let mut config = BuildConfig::default();
        config.hardware.cpus = -1;
        config.hardware.memory = -5;
        config.host_port_min = 5000;
        config.host_port_max = 4000;

        let msg = config.prepare().unwrap_err().to_string();
        assert!(msg.contains("cpus < 0"));
        assert!(msg.contains("memory < 0"));
        assert!(msg.contains("host_port_min (5000)"));
    }

    #[test]
    fn test_prepare_rejects_same_snapshot_names() {
        let mut config = BuildConfig::default();
        config.attach_snapshot = Some("base".into());
        config.target_snapshot = Some("base".into());
        assert!(config.prepare().is_err());

        let mut config = BuildConfig::default();
        config.delete_target_snapshot = true;
        assert!(config.prepare().is_err());
    }

    #[test]
    fn test_import_validation() {
        let mut config = BuildConfig::from_yaml(
            "import:\n  source_path: base.ova\n  flags: [\"--eula\", \"accept\"]\n",
        )
        .unwrap();
        config.prepare().unwrap();
        assert_eq!(config.import.as_ref().unwrap().flags, vec!["--eula", "accept"]);

        let mut config = BuildConfig {
            import: Some(ImportConfig::default()),
            attach_snapshot: Some("base".into()),
            ..BuildConfig::default()
        };
        let err = config.prepare().unwrap_err().to_string();
        assert!(err.contains("source_path must not be empty"));
        assert!(err.contains("cannot be combined"));
    }

    #[test]
    fn test_disk_layout_validation() {
        let mut config = BuildConfig::default();
        config.disk.additional_sizes_mb = vec![1000];
        let msg = config.prepare().unwrap_err().to_string();
        assert!(msg.contains("not supported on the ide interface"));

        let mut config = BuildConfig::default();
        config.disk.interface = DiskInterface::Pcie;
        config.disk.nvme_port_count = 2;
        config.disk.additional_sizes_mb = vec![1000, 1000];
        let msg = config.prepare().unwrap_err().to_string();
        assert!(msg.contains("3 disks do not fit"));

        let mut config = BuildConfig::default();
        config.disk.interface = DiskInterface::Sata;
        config.iso_interface = MediaInterface::Sata;
        config.disk.sata_port_count = 30;
        config.disk.additional_sizes_mb = vec![1000; 12];
        config.prepare().unwrap();
        config.disk.additional_sizes_mb.push(1000);
        assert!(config.prepare().is_err());
    }

    #[test]
    fn test_yaml_with_enums() {
        let yaml = r#"
vm_name: ubuntu
guest_os_type: Ubuntu_64
hardware:
  cpus: 2
  memory: 2048
iso_interface: sata
guest_additions_mode: attach
communicator:
  type: winrm
rtc_time_base: UTC
disk:
  interface: pcie
  nvme_port_count: 2
export:
  format: ova
"#;
        let config = BuildConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.vm_name, "ubuntu");
        assert_eq!(config.iso_interface, MediaInterface::Sata);
        assert_eq!(config.guest_additions_mode, GuestAdditionsMode::Attach);
        assert_eq!(config.communicator.port(), 5985);
        assert_eq!(config.rtc_time_base, RtcTimeBase::Utc);
        assert_eq!(config.disk.interface, DiskInterface::Pcie);
        assert_eq!(config.export.format.extension(), "ova");
        assert!(config.attach_boot_iso);
    }

    #[test]
    fn test_unknown_enum_value_rejected() {
        let err = BuildConfig::from_json(r#"{"iso_interface": "floppy"}"#).unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }

    #[test]
    fn test_from_path_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.json");
        std::fs::write(&path, r#"{"vm_name": "from-json", "communicator": {"type": "none"}}"#).unwrap();

        let config = BuildConfig::from_path(&path).unwrap();
        assert_eq!(config.vm_name, "from-json");
        assert_eq!(config.communicator.port(), 0);
    }
}
