//! Error taxonomy for provisioning builds.
//!
//! Categories follow how a failure is handled:
//! - [`BuildError::Command`]: the external tool exited non-zero (halts the step)
//! - [`BuildError::Conflict`]: a named resource already exists (retryable once)
//! - [`BuildError::Config`]: rejected before any external call is made
//! - [`BuildError::Fatal`]: the driver is unusable; no build may start

use thiserror::Error;

/// Result type for build operations.
pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Non-zero exit (or an error banner on stderr) from the management tool.
    #[error("VBoxManage error: {stderr}")]
    Command { command: String, stderr: String },

    /// No free resource in the configured range (e.g. host ports).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A named resource already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Tool output could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid user configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Driver construction or verification failed.
    #[error("fatal: {0}")]
    Fatal(String),

    /// An external call exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The build was cancelled by the host.
    #[error("build cancelled")]
    Cancelled,

    /// Local filesystem operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Broken internal invariant, such as a context value read before any
    /// step produced it.
    #[error("internal error: {0}")]
    Internal(String),

    /// Human-readable wrapper that keeps the underlying cause inspectable.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<BuildError>,
    },

    /// Several independent operations failed.
    #[error("{} operation(s) failed: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<BuildError>),
}

fn join_errors(errors: &[BuildError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl BuildError {
    /// Build a command error from an argument vector and captured stderr.
    pub fn command(args: &[String], stderr: impl Into<String>) -> Self {
        BuildError::Command {
            command: args.join(" "),
            stderr: stderr.into(),
        }
    }

    /// Wrap this error with a message describing what was being attempted.
    pub fn context(self, context: impl Into<String>) -> Self {
        BuildError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any `Context` wrappers.
    pub fn root(&self) -> &BuildError {
        let mut current = self;
        while let BuildError::Context { source, .. } = current {
            current = source;
        }
        current
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), BuildError::Conflict(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), BuildError::Cancelled)
    }

    /// Captured stderr when the root cause is a command failure.
    pub fn stderr(&self) -> Option<&str> {
        match self.root() {
            BuildError::Command { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        BuildError::Storage(err.to_string())
    }
}
