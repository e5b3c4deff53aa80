//! vboxbuild shared - types used by the provisioning core and its hosts.
//!
//! Holds the error taxonomy and the constants that form the command-line
//! contract with `VBoxManage`.

pub mod constants;
pub mod errors;

pub use errors::{BuildError, BuildResult};
