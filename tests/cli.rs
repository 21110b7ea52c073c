//! Command-line behavior: exit codes, overrides, and report files.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const PASSING: &str = r##"
[orchestrator]
max_parallel = 2
max_retries = 1
timeout_secs = 10

[[units]]
id = "home"
program = "sh"
args = ['-c', 'echo "{\"success\": true, \"duration\": 4}"']

[[units]]
id = "checkout/guest"
program = "sh"
args = ['-c', 'echo "{\"success\": true, \"duration\": 9, \"details\": {\"base\": \"$E2E_BASE_URL\"}}"']

[report]
output_dir = "results"
"##;

const FAILING: &str = r##"
[orchestrator]
max_parallel = 2
timeout_secs = 10

[[units]]
id = "home"
program = "sh"
args = ['-c', 'echo "{\"success\": true, \"duration\": 4}"']

[[units]]
id = "broken"
command = "sh -c 'echo attempt >> attempts.log; exit 1'"

[report]
output_dir = "results"
"##;

fn workspace(config: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("e2e.toml"), config).unwrap();
    dir
}

fn cli(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("e2e-orchestrator").unwrap();
    cmd.current_dir(dir)
        .env_remove("E2E_CONFIG")
        .env_remove("E2E_MAX_PARALLEL")
        .env_remove("E2E_MAX_RETRIES")
        .env_remove("E2E_TIMEOUT_SECS")
        .env_remove("E2E_BASE_URL")
        .env_remove("E2E_DEBUG")
        .env_remove("RUST_LOG");
    cmd
}

fn reports(dir: &Path) -> Vec<std::path::PathBuf> {
    let Ok(entries) = fs::read_dir(dir.join("results")) else {
        return Vec::new();
    };
    entries
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect()
}

#[test]
fn run_all_passing_exits_zero_and_writes_report() {
    let dir = workspace(PASSING);

    cli(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("All tests passed!"))
        .stdout(predicate::str::contains("Report:"));

    let reports = reports(dir.path());
    assert_eq!(reports.len(), 1);
    let name = reports[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("e2e-report-"), "unexpected report name {name}");

    let report: serde_json::Value = serde_json::from_str(&fs::read_to_string(&reports[0]).unwrap()).unwrap();
    assert_eq!(report["summary"]["total"], 2);
    assert_eq!(report["summary"]["passed"], 2);
    assert_eq!(report["errors"].as_array().unwrap().len(), 0);
}

#[test]
fn run_with_failure_exits_one_after_retries() {
    let dir = workspace(FAILING);

    cli(dir.path())
        .arg("run")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Some tests failed."))
        .stdout(predicate::str::contains("broken"));

    let attempts = fs::read_to_string(dir.path().join("attempts.log")).unwrap();
    assert_eq!(attempts.lines().count(), 3);

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&reports(dir.path())[0]).unwrap()).unwrap();
    assert_eq!(report["summary"]["failed"], 1);
    assert_eq!(report["errors"][0]["unit"]["id"], "broken");
    assert_eq!(report["errors"][0]["retryCount"], 2);
    assert_eq!(report["errors"][0]["outcome"]["status"], "crash");
    assert_eq!(report["errors"][0]["outcome"]["exitCode"], 1);
}

#[test]
fn env_overrides_retry_count() {
    let dir = workspace(FAILING);

    cli(dir.path())
        .arg("run")
        .env("E2E_MAX_RETRIES", "0")
        .assert()
        .code(1);

    let attempts = fs::read_to_string(dir.path().join("attempts.log")).unwrap();
    assert_eq!(attempts.lines().count(), 1);
}

#[test]
fn base_url_reaches_units() {
    let dir = workspace(PASSING);

    cli(dir.path())
        .args(["run", "--only", "checkout/guest", "--base-url", "https://staging.example.com"])
        .assert()
        .success();

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&reports(dir.path())[0]).unwrap()).unwrap();
    assert_eq!(report["summary"]["total"], 1);
    assert_eq!(
        report["results"][0]["outcome"]["details"]["base"],
        "https://staging.example.com"
    );
}

#[test]
fn only_unknown_unit_fails_before_running() {
    let dir = workspace(FAILING);

    cli(dir.path())
        .args(["run", "--only", "nope"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown unit: nope"));

    assert!(!dir.path().join("attempts.log").exists());
    assert!(reports(dir.path()).is_empty());
}

#[test]
fn junit_flag_writes_xml() {
    let dir = workspace(FAILING);

    cli(dir.path())
        .args(["run", "--junit", "--max-retries", "0"])
        .assert()
        .code(1);

    let xml = fs::read_to_string(dir.path().join("results").join("junit.xml")).unwrap();
    assert!(xml.contains(r#"tests="2""#));
    assert!(xml.contains(r#"name="broken""#));
    assert!(xml.contains("<error"));
}

#[test]
fn list_prints_units() {
    let dir = workspace(PASSING);

    cli(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("home"))
        .stdout(predicate::str::contains("checkout/guest"))
        .stdout(predicate::str::contains("2 units"));
}

#[test]
fn validate_reports_resolved_settings() {
    let dir = workspace(PASSING);

    cli(dir.path())
        .arg("validate")
        .env("E2E_MAX_PARALLEL", "7")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Max parallel: 7"))
        .stdout(predicate::str::contains("Max retries: 1"));
}

#[test]
fn validate_rejects_bad_config() {
    let dir = workspace("[orchestrator]\nmax_parallel = 0\n");

    cli(dir.path())
        .arg("validate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn missing_config_fails() {
    let dir = tempfile::tempdir().unwrap();

    cli(dir.path())
        .arg("run")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn init_writes_starter_config_once() {
    let dir = tempfile::tempdir().unwrap();

    cli(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created e2e.toml"));
    assert!(dir.path().join("e2e.toml").exists());

    cli(dir.path())
        .arg("init")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already exists"));

    cli(dir.path()).arg("validate").assert().success();
    cli(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("All tests passed!"));
}
