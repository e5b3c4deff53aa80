#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use assert_cmd::Command;
use tempfile::TempDir;

pub struct TestContext {
    pub cmd: Command,
    pub dir: TempDir, // Dropped after test
}

impl TestContext {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a configuration file into the test directory.
    pub fn write_config(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).expect("Failed to write config");
        path
    }

    /// YAML configuration keeping locks and output inside the test directory.
    pub fn isolated_config(&self, extra: &str) -> PathBuf {
        let contents = format!(
            "vm_name: cli-test\nhost_port_min: 44000\nhost_port_max: 44999\nport_lock_dir: {}\nexport:\n  output_directory: {}\n{}",
            self.path().join("locks").display(),
            self.path().join("output").display(),
            extra
        );
        self.write_config("build.yaml", &contents)
    }
}

pub fn vboxbuild() -> TestContext {
    let bin_path = env!("CARGO_BIN_EXE_vboxbuild");
    let mut cmd = Command::new(bin_path);
    cmd.timeout(Duration::from_secs(60));
    cmd.env("RUST_LOG", "warn");

    TestContext {
        cmd,
        dir: TempDir::new().expect("Failed to create temp dir"),
    }
}
