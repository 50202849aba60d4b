//! End-to-end checks of the CLI surface and its exit codes. Everything here
//! runs without a live InfluxDB: the network-facing paths use endpoints that
//! refuse connections immediately.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn cmd() -> Command {
    Command::cargo_bin("influxdb_backup").expect("binary builds")
}

fn write_config(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create config");
    file.write_all(contents.as_bytes()).expect("write config");
    path
}

/// A syntactically valid configuration pointing at ports nothing listens on,
/// tuned so connection attempts fail fast.
const UNREACHABLE: &str = r#"
source:
  url: http://127.0.0.1:1
destination:
  url: http://127.0.0.1:1
options:
  retries: 1
  initial_connection_retry_delay: 0
  timeout_client: 2
"#;

#[test]
fn help_names_the_exit_codes() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--validate-only"))
        .stdout(predicate::str::contains("Exit codes"));
}

#[test]
fn missing_config_argument_fails() {
    cmd().assert().failure();
}

#[test]
fn unparseable_yaml_exits_with_config_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "broken.yaml", "source: [not, a, mapping\n");
    cmd()
        .arg("--config")
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("broken.yaml"));
}

#[test]
fn unknown_keys_exit_with_config_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "typo.yaml",
        "source:\n  url: http://localhost:8086\n  bananas: 3\ndestination:\n  url: http://localhost:8087\n",
    );
    cmd().arg("--config").arg(&path).assert().code(2);
}

#[test]
fn directory_without_configs_exits_with_config_invalid() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .arg("--config")
        .arg(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no configuration files"));
}

#[test]
fn validate_only_reports_unreachable_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "offline.yaml", UNREACHABLE);
    cmd()
        .arg("--config")
        .arg(&path)
        .arg("--validate-only")
        .assert()
        .code(4);
}

#[test]
fn directory_mode_folds_child_exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    write_config(&dir, "broken.yaml", "just junk\n");
    write_config(&dir, "offline.yaml", UNREACHABLE);
    // config errors dominate unreachable endpoints
    cmd()
        .arg("--config")
        .arg(dir.path())
        .arg("--validate-only")
        .assert()
        .code(2);
}
