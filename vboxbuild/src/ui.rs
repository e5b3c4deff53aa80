//! Human-readable progress output for the host.
//!
//! Separate from `tracing`: the Ui stream is the commentary a user sees
//! while a build runs, logs are for operators.

use std::io::Write;

use parking_lot::Mutex;

/// Output sink supplied by the host.
pub trait Ui: Send + Sync {
    /// Announce a major action.
    fn say(&self, message: &str);

    /// Detail line under the current action.
    fn message(&self, message: &str);

    /// Error visible to the user.
    fn error(&self, message: &str);
}

/// Writes commentary to stdout, errors to stderr.
#[derive(Debug, Default)]
pub struct ConsoleUi {
    prefix: Option<String>,
}

impl ConsoleUi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix every line with the build name, e.g. `vboxbuild.ubuntu: `.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    fn line(&self, marker: &str, message: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{marker}{prefix}: {message}"),
            None => format!("{marker}{message}"),
        }
    }
}

impl Ui for ConsoleUi {
    fn say(&self, message: &str) {
        let _ = writeln!(std::io::stdout(), "{}", self.line("==> ", message));
    }

    fn message(&self, message: &str) {
        let _ = writeln!(std::io::stdout(), "{}", self.line("    ", message));
    }

    fn error(&self, message: &str) {
        let _ = writeln!(std::io::stderr(), "{}", self.line("==> ", message));
    }
}

/// Severity of a captured line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiLevel {
    Say,
    Message,
    Error,
}

/// Captures every line in memory.
#[derive(Debug, Default)]
pub struct BufferUi {
    lines: Mutex<Vec<(UiLevel, String)>>,
}

impl BufferUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(UiLevel, String)> {
        self.lines.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(level, _)| *level == UiLevel::Error)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|(_, line)| line.contains(needle))
    }

    fn push(&self, level: UiLevel, message: &str) {
        self.lines.lock().push((level, message.to_string()));
    }
}

impl Ui for BufferUi {
    fn say(&self, message: &str) {
        self.push(UiLevel::Say, message);
    }

    fn message(&self, message: &str) {
        self.push(UiLevel::Message, message);
    }

    fn error(&self, message: &str) {
        self.push(UiLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_ui_captures_levels() {
        let ui = BufferUi::new();
        ui.say("Creating virtual machine...");
        ui.message("Mounting boot ISO...");
        ui.error("Error creating VM");

        let lines = ui.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].0, UiLevel::Say);
        assert_eq!(lines[1].0, UiLevel::Message);
        assert_eq!(ui.errors(), vec!["Error creating VM".to_string()]);
        assert!(ui.contains("boot ISO"));
    }

    #[test]
    fn test_console_prefix() {
        let ui = ConsoleUi::with_prefix("vboxbuild.ubuntu");
        assert_eq!(ui.line("==> ", "hello"), "==> vboxbuild.ubuntu: hello");
        assert_eq!(ConsoleUi::new().line("    ", "hi"), "    hi");
    }
}
