//! Integration tests for the `corvus` binary.
//!
//! Each test launches the binary via `assert_cmd`, writes any required
//! fixture files to a temp directory, and asserts on exit code + output.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn corvus() -> Command {
    Command::cargo_bin("corvus").expect("binary not found")
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const BRUTE_FORCE_RULE: &str = r#"
id: test-bruteforce-01
name: SSH brute force
severity: high
triggers:
  - type: event
    event_type: login_failure
aggregation:
  function: count
  field: username
  group_by: source_ip
  window_seconds: 300
  operator: gte
  threshold: 2
"#;

const SIMPLE_RULE: &str = r#"
id: simple-rule
name: Any SSH failure
severity: low
triggers:
  - type: event
    event_type: login_failure
conditions:
  - field: protocol
    operator: equals
    value: ssh
"#;

const BROKEN_RULE: &str = "id: [unterminated\n";

fn event_json(ip: &str, secs: i64) -> String {
    format!(
        r#"{{"id":"ev-{secs}","timestamp":"2025-06-01T12:{:02}:{:02}Z","eventType":"login_failure","sourceIp":"{ip}","protocol":"ssh","metadata":{{"username":"testuser"}}}}"#,
        (secs / 60) % 60,
        secs % 60,
    )
}

// ---------------------------------------------------------------------------
// parse
// ---------------------------------------------------------------------------

#[test]
fn parse_prints_rule_as_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("simple-rule.yml");
    fs::write(&path, SIMPLE_RULE).unwrap();

    corvus()
        .arg("parse")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": \"simple-rule\""));
}

#[test]
fn parse_rejects_missing_fields_by_name() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("incomplete.yml");
    fs::write(&path, "name: no id here\nseverity: low\ntriggers: []\n").unwrap();

    corvus()
        .arg("parse")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing required field 'id'"));
}

#[test]
fn parse_rejects_invalid_regex() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad-regex.yml");
    fs::write(
        &path,
        r#"
id: bad-regex
name: Bad regex
severity: low
triggers:
  - type: event
    event_type: login_failure
conditions:
  - field: username
    operator: regex
    value: "[invalid"
"#,
    )
    .unwrap();

    corvus()
        .arg("parse")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not compile"));
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

#[test]
fn validate_reports_summary_and_fails_on_errors() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("simple-rule.yml"), SIMPLE_RULE).unwrap();
    fs::write(dir.path().join("broken.yml"), BROKEN_RULE).unwrap();

    corvus()
        .arg("validate")
        .arg(dir.path())
        .arg("--verbose")
        .assert()
        .failure()
        .stdout(predicate::str::contains("Loaded 1 rules"))
        .stdout(predicate::str::contains("Rejected files: 1"))
        .stdout(predicate::str::contains("broken.yml"));
}

#[test]
fn validate_succeeds_on_clean_directory() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("simple-rule.yml"), SIMPLE_RULE).unwrap();
    fs::write(dir.path().join("test-bruteforce-01.yml"), BRUTE_FORCE_RULE).unwrap();

    corvus()
        .arg("validate")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Loaded 2 rules"));
}

// ---------------------------------------------------------------------------
// eval
// ---------------------------------------------------------------------------

#[test]
fn eval_single_event_fires_rule() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("simple-rule.yml");
    fs::write(&path, SIMPLE_RULE).unwrap();

    corvus()
        .arg("eval")
        .arg("--rules")
        .arg(&path)
        .arg("--event")
        .arg(event_json("10.0.0.1", 0))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ruleId\":\"simple-rule\""));
}

#[test]
fn eval_ndjson_stream_counts_to_threshold() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("test-bruteforce-01.yml"), BRUTE_FORCE_RULE).unwrap();

    let input = format!("{}\n{}\n", event_json("10.0.0.1", 10), event_json("10.0.0.1", 20));

    corvus()
        .arg("eval")
        .arg("--rules")
        .arg(dir.path())
        .write_stdin(input)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"aggregationCount\":2"));
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

#[test]
fn run_consumes_stdin_and_persists_alerts() {
    let dir = TempDir::new().unwrap();
    let rules_dir = dir.path().join("rules");
    fs::create_dir(&rules_dir).unwrap();
    fs::write(rules_dir.join("test-bruteforce-01.yml"), BRUTE_FORCE_RULE).unwrap();

    let db_path = dir.path().join("alerts.db");
    let config_path = dir.path().join("engine.yml");
    fs::write(
        &config_path,
        format!(
            "rules:\n  directory: {}\nalerts:\n  database_path: {}\n",
            rules_dir.display(),
            db_path.display()
        ),
    )
    .unwrap();

    let input = format!("{}\n{}\n", event_json("10.0.0.1", 10), event_json("10.0.0.1", 20));

    corvus()
        .arg("run")
        .arg("--config")
        .arg(&config_path)
        .write_stdin(input)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ruleId\":\"test-bruteforce-01\""));

    assert!(db_path.exists(), "alert database should have been created");
}

#[test]
fn run_aggregates_config_problems() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("engine.yml");
    fs::write(
        &config_path,
        "store:\n  max_window_secs: 0\n  cleanup_interval_secs: 0\nrules:\n  directory: /nonexistent\n",
    )
    .unwrap();

    corvus()
        .arg("run")
        .arg("--config")
        .arg(&config_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration:"))
        .stderr(predicate::str::contains("max_window_secs"))
        .stderr(predicate::str::contains("/nonexistent"));
}
