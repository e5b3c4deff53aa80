use predicates::prelude::*;

mod common;

#[test]
fn test_validate_accepts_defaults() {
    let mut ctx = common::vboxbuild();
    let config = ctx.write_config("build.json", r#"{"vm_name": "ubuntu"}"#);

    ctx.cmd
        .arg("validate")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid (vm: ubuntu)"));
}

#[test]
fn test_validate_reports_every_error() {
    let mut ctx = common::vboxbuild();
    let config = ctx.write_config(
        "build.yaml",
        "hardware:\n  cpus: -1\n  memory: -1\nhost_port_min: 5000\nhost_port_max: 4000\n",
    );

    ctx.cmd
        .arg("validate")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("cpus < 0"))
        .stderr(predicate::str::contains("memory < 0"))
        .stderr(predicate::str::contains("host_port_min (5000)"));
}

#[test]
fn test_validate_rejects_unknown_enum() {
    let mut ctx = common::vboxbuild();
    let config = ctx.write_config("build.yaml", "iso_interface: scsi\n");

    ctx.cmd
        .arg("validate")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn test_validate_missing_file() {
    let mut ctx = common::vboxbuild();
    let missing = ctx.path().join("missing.yaml");
    ctx.cmd
        .arg("validate")
        .arg("--config")
        .arg(missing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load"));
}
