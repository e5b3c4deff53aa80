//! Process-level helpers: tool discovery, tracing setup, argument vectors.

pub mod retry;

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use vboxbuild_shared::constants::tool;
use vboxbuild_shared::errors::{BuildError, BuildResult};

pub use retry::{RetryPolicy, retry};

/// Build a `Vec<String>` argument vector from mixed displayable values.
///
/// ```
/// let args = vboxbuild::vbox_args!["modifyvm", "vm", "--cpus", 2];
/// assert_eq!(args, vec!["modifyvm", "vm", "--cpus", "2"]);
/// ```
#[macro_export]
macro_rules! vbox_args {
    ($($arg:expr),* $(,)?) => {
        vec![$($arg.to_string()),*]
    };
}

/// Locate the `VBoxManage` binary.
///
/// On Windows the install-path environment variables are consulted first
/// (each may hold a `;`-separated list), then `PATH` is searched.
pub fn find_tool() -> BuildResult<PathBuf> {
    let mut candidates = Vec::new();

    if cfg!(windows) {
        for key in tool::WINDOWS_INSTALL_VARS {
            if let Ok(value) = std::env::var(key) {
                tracing::debug!(%key, %value, "Install path variable set");
                candidates.extend(
                    value
                        .split(';')
                        .filter(|dir| !dir.is_empty())
                        .map(|dir| Path::new(dir).join(executable_name())),
                );
            }
        }
    }

    if let Some(path) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&path).map(|dir| dir.join(executable_name())));
    }

    for candidate in &candidates {
        if candidate.is_file() {
            tracing::debug!(tool = %candidate.display(), "Found VBoxManage");
            return Ok(candidate.clone());
        }
    }

    Err(BuildError::Fatal(format!(
        "{} not found; searched {} location(s). Is VirtualBox installed?",
        tool::BINARY,
        candidates.len()
    )))
}

fn executable_name() -> String {
    if cfg!(windows) {
        format!("{}.exe", tool::BINARY)
    } else {
        tool::BINARY.to_string()
    }
}

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}

/// `RUST_LOG` filter, falling back to `default` when unset or invalid.
pub fn env_filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vbox_args_mixed_types() {
        let vm = String::from("build-vm");
        let port: u16 = 2222;
        let args = vbox_args!["modifyvm", &vm, "--natpf1", port];
        assert_eq!(args, vec!["modifyvm", "build-vm", "--natpf1", "2222"]);
    }

    #[test]
    fn test_executable_name() {
        let name = executable_name();
        assert!(name.starts_with("VBoxManage"));
    }
}
