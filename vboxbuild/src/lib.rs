//! vboxbuild - provisions VirtualBox machines through a pipeline of
//! reversible steps.
//!
//! A [`Builder`] turns a [`BuildConfig`] into an ordered list of steps. Each
//! step drives the hypervisor through a [`Driver`] and records what it
//! produced in the shared [`BuildState`]. When a step fails or the build is
//! cancelled, the steps that already ran are cleaned up in reverse order.

pub mod builder;
pub mod config;
pub mod driver;
pub mod media;
pub mod net;
pub mod pipeline;
pub mod state;
pub mod steps;
pub mod ui;
pub mod util;
pub mod version;

pub use builder::{Artifact, Builder, MediaInputs};
pub use config::BuildConfig;
pub use driver::{Driver, DriverCall, FakeDriver, VBoxDriver, new_driver};
pub use pipeline::{Pipeline, PipelineState, Step};
pub use state::BuildState;
pub use ui::{BufferUi, ConsoleUi, Ui};
pub use vboxbuild_shared::{BuildError, BuildResult};
