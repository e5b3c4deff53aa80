//! Provisioning steps.
//!
//! Each step reads what earlier steps produced from [`BuildState`], drives
//! the hypervisor through the [`Driver`](crate::driver::Driver) and records
//! its own outputs for later steps.
//!
//! [`BuildState`]: crate::state::BuildState

mod attach_media;
mod create_disks;
mod create_vm;
mod export;
mod http_ip;
mod import;
mod port_forwarding;
mod remove_devices;
mod run;
mod shutdown;
mod snapshot;
mod vm_defaults;

pub use attach_media::StepAttachMedia;
pub use create_disks::StepCreateDisks;
pub use create_vm::StepCreateVm;
pub use export::StepExport;
pub use http_ip::StepHttpIpDiscover;
pub use import::StepImport;
pub use port_forwarding::{StepPortForwarding, add_access_to_localhost};
pub use remove_devices::StepRemoveDevices;
pub use run::StepRun;
pub use shutdown::StepShutdown;
pub use snapshot::{StepCreateSnapshot, StepSetSnapshot};
pub use vm_defaults::StepGetVmDefaults;
