//! Step pipeline with reverse-order unwind.
//!
//! Steps run strictly in sequence against one [`BuildState`]. The first
//! failing step halts the pipeline; cancellation is checked between steps.
//! Once the pipeline stops, for whatever reason, every step that completed
//! its `run` gets its `cleanup` called, last step first. Cleanup failures
//! are logged and never interrupt the unwind.

use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use crate::state::BuildState;

/// A provisioning unit with a forward action and its inverse.
///
/// A step owns whatever it allocated between `run` and `cleanup`. When
/// `run` fails halfway, the step unwinds its own partial work before
/// returning: its `cleanup` is not called.
#[async_trait]
pub trait Step: Send {
    fn name(&self) -> &'static str;

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()>;

    async fn cleanup(&mut self, _state: &mut BuildState) -> BuildResult<()> {
        Ok(())
    }
}

/// Where the pipeline is. Indices refer to the step list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Running(usize),
    Halted(usize),
    Cancelled(usize),
    Completed,
}

pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
    status: PipelineState,
}

impl Pipeline {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self {
            steps,
            status: PipelineState::Pending,
        }
    }

    pub fn status(&self) -> PipelineState {
        self.status
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step, then unwind. Returns the first run error.
    pub async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        let total_start = Instant::now();
        let mut completed = 0;
        let mut outcome = Ok(());

        for (index, step) in self.steps.iter_mut().enumerate() {
            if state.cancel.is_cancelled() {
                tracing::warn!(step = step.name(), "Build cancelled before step");
                self.status = PipelineState::Cancelled(index);
                outcome = Err(BuildError::Cancelled);
                break;
            }

            self.status = PipelineState::Running(index);
            let span = tracing::info_span!("step", name = step.name(), index);
            let start = Instant::now();

            match step.run(state).instrument(span).await {
                Ok(()) => {
                    tracing::debug!(
                        step = step.name(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Step completed"
                    );
                    completed = index + 1;
                }
                Err(e) if e.is_cancelled() => {
                    tracing::warn!(step = step.name(), "Build cancelled during step");
                    self.status = PipelineState::Cancelled(index);
                    outcome = Err(e);
                    break;
                }
                Err(e) => {
                    tracing::error!(step = step.name(), error = %e, "Step failed, halting");
                    self.status = PipelineState::Halted(index);
                    outcome = Err(e);
                    break;
                }
            }
        }

        let status = self.status;
        match (status, &outcome) {
            (PipelineState::Cancelled(_), Err(e)) => {
                state.cancelled = true;
                state.error.get_or_insert_with(|| e.to_string());
                state.ui.error("Build was cancelled.");
            }
            (PipelineState::Halted(_), Err(e)) => state.halt_with(e),
            _ => self.status = PipelineState::Completed,
        }

        self.unwind(completed, state).await;

        tracing::info!(
            status = ?self.status,
            total_ms = total_start.elapsed().as_millis() as u64,
            "Pipeline finished"
        );
        outcome
    }

    async fn unwind(&mut self, completed: usize, state: &mut BuildState) {
        for step in self.steps[..completed].iter_mut().rev() {
            tracing::debug!(step = step.name(), "Cleaning up step");
            if let Err(e) = step.cleanup(state).await {
                tracing::warn!(step = step.name(), error = %e, "Cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::config::BuildConfig;
    use crate::driver::FakeDriver;
    use crate::ui::BufferUi;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        journal: Journal,
        fail: bool,
        fail_cleanup: bool,
        cancel_after: bool,
    }

    impl Recording {
        fn new(name: &'static str, journal: &Journal) -> Self {
            Self {
                name,
                journal: journal.clone(),
                fail: false,
                fail_cleanup: false,
                cancel_after: false,
            }
        }

        fn boxed(name: &'static str, journal: &Journal) -> Box<dyn Step> {
            Box::new(Self::new(name, journal))
        }
    }

    #[async_trait]
    impl Step for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
            self.journal.lock().push(format!("run {}", self.name));
            if self.cancel_after {
                state.cancel.cancel();
            }
            if self.fail {
                return Err(BuildError::Parse(format!("{} failed", self.name)));
            }
            Ok(())
        }

        async fn cleanup(&mut self, _state: &mut BuildState) -> BuildResult<()> {
            self.journal.lock().push(format!("cleanup {}", self.name));
            if self.fail_cleanup {
                return Err(BuildError::Storage("cleanup failed".into()));
            }
            Ok(())
        }
    }

    fn state() -> BuildState {
        BuildState::new(
            Arc::new(FakeDriver::new()),
            Arc::new(BufferUi::new()),
            Arc::new(BuildConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_halt_cleans_up_earlier_steps_in_reverse() {
        let journal = Journal::default();
        let steps: Vec<Box<dyn Step>> = vec![
            Recording::boxed("s0", &journal),
            Recording::boxed("s1", &journal),
            Box::new(Recording {
                fail: true,
                ..Recording::new("s2", &journal)
            }),
            Recording::boxed("s3", &journal),
        ];

        let mut state = state();
        let mut pipeline = Pipeline::new(steps);
        let err = pipeline.run(&mut state).await.unwrap_err();

        assert_eq!(err.to_string(), "parse error: s2 failed");
        assert_eq!(pipeline.status(), PipelineState::Halted(2));
        assert_eq!(
            *journal.lock(),
            vec!["run s0", "run s1", "run s2", "cleanup s1", "cleanup s0"]
        );
        assert!(state.halted);
        assert_eq!(state.error.as_deref(), Some("parse error: s2 failed"));
    }

    #[tokio::test]
    async fn test_completed_runs_final_teardown() {
        let journal = Journal::default();
        let steps = vec![Recording::boxed("a", &journal), Recording::boxed("b", &journal)];

        let mut state = state();
        let mut pipeline = Pipeline::new(steps);
        pipeline.run(&mut state).await.unwrap();

        assert_eq!(pipeline.status(), PipelineState::Completed);
        assert_eq!(*journal.lock(), vec!["run a", "run b", "cleanup b", "cleanup a"]);
        assert!(state.succeeded());
    }

    #[tokio::test]
    async fn test_cleanup_errors_do_not_stop_unwind() {
        let journal = Journal::default();
        let steps: Vec<Box<dyn Step>> = vec![
            Recording::boxed("a", &journal),
            Box::new(Recording {
                fail_cleanup: true,
                ..Recording::new("b", &journal)
            }),
            Recording::boxed("c", &journal),
        ];

        let mut state = state();
        Pipeline::new(steps).run(&mut state).await.unwrap();

        assert_eq!(
            *journal.lock(),
            vec!["run a", "run b", "run c", "cleanup c", "cleanup b", "cleanup a"]
        );
    }

    #[tokio::test]
    async fn test_cancellation_between_steps() {
        let journal = Journal::default();
        let steps: Vec<Box<dyn Step>> = vec![
            Recording::boxed("a", &journal),
            Box::new(Recording {
                cancel_after: true,
                ..Recording::new("b", &journal)
            }),
            Recording::boxed("c", &journal),
        ];

        let mut state = state();
        let mut pipeline = Pipeline::new(steps);
        let err = pipeline.run(&mut state).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(pipeline.status(), PipelineState::Cancelled(2));
        assert_eq!(*journal.lock(), vec!["run a", "run b", "cleanup b", "cleanup a"]);
        assert!(state.cancelled);
        assert!(!state.halted);
    }

    #[tokio::test]
    async fn test_first_step_failure_cleans_nothing() {
        let journal = Journal::default();
        let steps: Vec<Box<dyn Step>> = vec![Box::new(Recording {
            fail: true,
            ..Recording::new("only", &journal)
        })];

        let mut state = state();
        let mut pipeline = Pipeline::new(steps);
        assert!(pipeline.run(&mut state).await.is_err());
        assert_eq!(*journal.lock(), vec!["run only"]);
    }
}
