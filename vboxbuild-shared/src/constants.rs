//! Constants shared by the driver, the steps and their hosts.
//!
//! Controller names and rule names are part of the command-line contract
//! with `VBoxManage` and must stay stable across releases.

/// Storage controller names created and addressed by the builder.
pub mod controllers {
    pub const IDE: &str = "IDE Controller";
    pub const SATA: &str = "SATA Controller";
    pub const SCSI: &str = "SCSI Controller";
    pub const NVME: &str = "NVMe Controller";
    pub const VIRTIO: &str = "VirtIO Controller";
    pub const FLOPPY: &str = "Floppy Controller";

    /// `storagecontrollertype` value reported for floppy controllers.
    pub const FLOPPY_TYPE: &str = "I82078";
}

/// NAT networking constants.
pub mod nat {
    /// Reserved name of the communicator port-forwarding rule on NIC 1.
    pub const COMM_RULE_NAME: &str = "vboxbuildcomm";

    /// Text `VBoxManage` prints when a rule with the same name exists.
    pub const RULE_EXISTS_MARKER: &str = "A NAT rule of this name already exists";

    /// Address of the host as seen from a guest behind VirtualBox NAT.
    pub const HOST_GATEWAY_IP: &str = "10.0.2.2";
}

/// Communicator defaults.
pub mod comm {
    pub const SSH_PORT: u16 = 22;
    pub const WINRM_PORT: u16 = 5985;

    pub const DEFAULT_HOST_PORT_MIN: u16 = 2222;
    pub const DEFAULT_HOST_PORT_MAX: u16 = 4444;
    pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1";
}

/// Tool discovery.
pub mod tool {
    /// Binary name looked up on `PATH`.
    pub const BINARY: &str = "VBoxManage";

    /// Windows environment variables holding install directories.
    pub const WINDOWS_INSTALL_VARS: &[&str] = &["VBOX_INSTALL_PATH", "VBOX_MSI_INSTALL_PATH"];

    /// Prefix for throw-away VMs created to probe defaults.
    pub const TEMP_VM_PREFIX: &str = "vboxbuild_temp_vm";
}
