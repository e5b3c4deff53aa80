//! Assembles and runs the provisioning pipeline for one VM.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use vboxbuild_shared::errors::BuildResult;

use crate::config::BuildConfig;
use crate::driver::Driver;
use crate::pipeline::{Pipeline, Step};
use crate::state::BuildState;
use crate::steps::{
    StepAttachMedia, StepCreateDisks, StepCreateSnapshot, StepCreateVm, StepExport,
    StepGetVmDefaults, StepHttpIpDiscover, StepImport, StepPortForwarding, StepRemoveDevices,
    StepRun, StepSetSnapshot, StepShutdown,
};
use crate::ui::Ui;

/// Media acquired by the host before the build starts.
#[derive(Debug, Clone, Default)]
pub struct MediaInputs {
    pub iso_path: Option<PathBuf>,
    pub cd_path: Option<PathBuf>,
    pub guest_additions_path: Option<PathBuf>,
    pub floppy_path: Option<PathBuf>,
}

/// Result of a completed build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub vm_name: String,
    /// Appliance written by the export step, unless export was skipped.
    pub exported_path: Option<PathBuf>,
    /// Whether the VM is still registered with the hypervisor.
    pub kept_registered: bool,
}

/// One build: configuration, collaborators and host-supplied steps.
///
/// Host steps run after the VM has booted with its forwarding rule in
/// place, and before it is shut down.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use vboxbuild::{BuildConfig, Builder, ConsoleUi, MediaInputs, new_driver};
///
/// # async fn build() -> vboxbuild::BuildResult<()> {
/// let config = BuildConfig::from_path("build.yaml".as_ref())?;
/// let driver = Arc::new(new_driver(config.command_timeout()).await?);
/// let artifact = Builder::new(config, driver, Arc::new(ConsoleUi::new()))?
///     .with_media(MediaInputs {
///         iso_path: Some("ubuntu.iso".into()),
///         ..Default::default()
///     })
///     .run()
///     .await?;
/// println!("built {}", artifact.vm_name);
/// # Ok(())
/// # }
/// ```
pub struct Builder {
    config: Arc<BuildConfig>,
    driver: Arc<dyn Driver>,
    ui: Arc<dyn Ui>,
    media: MediaInputs,
    host_steps: Vec<Box<dyn Step>>,
    cancel: CancellationToken,
}

impl Builder {
    // ─────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────

    /// Validate `config` and create a builder. No hypervisor command is
    /// issued for an invalid configuration.
    pub fn new(mut config: BuildConfig, driver: Arc<dyn Driver>, ui: Arc<dyn Ui>) -> BuildResult<Self> {
        config.prepare()?;
        Ok(Self {
            config: Arc::new(config),
            driver,
            ui,
            media: MediaInputs::default(),
            host_steps: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_media(mut self, media: MediaInputs) -> Self {
        self.media = media;
        self
    }

    /// Append a host step (provisioner, communicator wait, ...).
    pub fn with_host_step(mut self, step: impl Step + 'static) -> Self {
        self.host_steps.push(Box::new(step));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    // ─────────────────────────────────────────────────────────────────────
    // Getters
    // ─────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Token that cancels the build when triggered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Names of the steps in execution order.
    pub fn step_names(&self) -> Vec<&'static str> {
        let (before, after) = self.builtin_steps();
        before
            .iter()
            .chain(self.host_steps.iter())
            .chain(after.iter())
            .map(|step| step.name())
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────

    /// Built-in steps that run before and after the host steps.
    fn builtin_steps(&self) -> (Vec<Box<dyn Step>>, Vec<Box<dyn Step>>) {
        let config = &self.config;
        let mut before: Vec<Box<dyn Step>> = Vec::new();

        if config.attach_snapshot.is_some() {
            before.push(Box::new(StepSetSnapshot::new()));
        } else if config.import.is_some() {
            before.push(Box::new(StepImport::new()));
        } else {
            before.push(Box::new(StepGetVmDefaults::new()));
            before.push(Box::new(StepCreateVm::new()));
            before.push(Box::new(StepCreateDisks::new()));
        }
        before.push(Box::new(StepAttachMedia::new()));
        before.push(Box::new(StepHttpIpDiscover::new()));
        before.push(Box::new(StepPortForwarding::new()));
        before.push(Box::new(StepRun::new()));

        let mut after: Vec<Box<dyn Step>> = vec![
            Box::new(StepShutdown::new()),
            Box::new(StepRemoveDevices::new()),
        ];
        if config.target_snapshot.is_some() {
            after.push(Box::new(StepCreateSnapshot::new()));
        }
        after.push(Box::new(StepExport::new()));

        (before, after)
    }

    fn take_steps(&mut self) -> Vec<Box<dyn Step>> {
        let (mut steps, after) = self.builtin_steps();
        steps.append(&mut self.host_steps);
        steps.extend(after);
        steps
    }

    /// Run the pipeline to completion. On failure every resource the build
    /// acquired has already been released when this returns.
    pub async fn run(mut self) -> BuildResult<Artifact> {
        let span = tracing::info_span!("build", vm = %self.config.vm_name);

        async move {
            self.driver
                .suppress_messages()
                .await
                .map_err(|e| e.context("error suppressing VirtualBox messages"))?;

            let mut state = BuildState::new(self.driver.clone(), self.ui.clone(), self.config.clone())
                .with_cancel(self.cancel.clone());
            let media = std::mem::take(&mut self.media);
            state.iso_path = media.iso_path;
            state.cd_path = media.cd_path;
            state.guest_additions_path = media.guest_additions_path;
            state.floppy_path = media.floppy_path;

            let mut pipeline = Pipeline::new(self.take_steps());
            tracing::info!(steps = ?pipeline.step_names(), "Starting build");
            pipeline.run(&mut state).await?;

            let artifact = Artifact {
                vm_name: state.vm_name()?.to_string(),
                exported_path: state.exported_path.take(),
                kept_registered: self.config.keep_registered || self.config.attach_snapshot.is_some(),
            };
            tracing::info!(vm = %artifact.vm_name, "Build finished");
            Ok(artifact)
        }
        .instrument(span)
        .await
    }
}
