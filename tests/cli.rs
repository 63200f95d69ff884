use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn exapatch() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("exapatch").unwrap()
}

fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

const DOM0_REQUEST: &str = r#"{
    "request_id": "req-1",
    "target_kind": "dom0",
    "operation": "patch",
    "nodes": ["db1", "db2"],
    "include_nodes": ["db2"],
    "target_version": "22.1.0",
    "payload": {"path": "/tmp/exadata_22.1.0.zip"}
}"#;

#[test]
fn test_help_exits_successfully() {
    exapatch().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    exapatch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("exapatch"));
}

#[test]
fn test_no_args_shows_usage() {
    exapatch()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    exapatch()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = exapatch().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for cmd in [
        "run",
        "request-check",
        "config-check",
        "version-compare",
        "ledger",
    ] {
        assert!(
            output.contains(cmd),
            "Help output should list '{}' subcommand",
            cmd
        );
    }
}

#[test]
fn test_version_compare_orders_numerically() {
    exapatch()
        .args(["version-compare", "22.1.10", "22.1.9"])
        .assert()
        .success()
        .stdout(predicate::str::contains("greater"));
    exapatch()
        .args(["version-compare", "21.2.0", "22.1.0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("less"));
}

#[test]
fn test_version_compare_rejects_garbage() {
    exapatch()
        .args(["version-compare", "22.1.0", "latest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not comparable"));
}

#[test]
fn test_config_check_prints_defaults() {
    let assert = exapatch().arg("config-check").assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(value["engine"]["remote_root"].is_string());
    assert!(value["session"]["timeout_secs"].as_u64().unwrap() > 0);
}

#[test]
fn test_config_check_rejects_zero_poll_interval() {
    let config = write_temp(".toml", "[session]\npoll_interval_secs = 0\n");
    exapatch()
        .args(["config-check", "--config"])
        .arg(config.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("poll_interval_secs"));
}

#[test]
fn test_request_check_shows_selection() {
    let request = write_temp(".json", DOM0_REQUEST);
    let assert = exapatch()
        .args(["request-check", "--request"])
        .arg(request.path())
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["request_id"], "req-1");
    assert_eq!(value["selected_nodes"], serde_json::json!(["db2"]));
    assert_eq!(value["style"], "rolling");
    assert_eq!(value["ledger_replicas"], serde_json::json!(["db1", "db2"]));
}

#[test]
fn test_request_check_requires_launch_node_for_switches() {
    let request = write_temp(
        ".json",
        r#"{"target_kind": "ibswitch", "operation": "patch", "nodes": ["sw1"],
            "target_version": "2.2.16", "payload": {"path": "/tmp/ib.zip"}}"#,
    );
    exapatch()
        .args(["request-check", "--request"])
        .arg(request.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("launch_candidates"));
}

#[test]
fn test_run_rejects_request_without_nodes() {
    let request = write_temp(
        ".json",
        r#"{"target_kind": "cell", "operation": "postcheck", "nodes": []}"#,
    );
    exapatch()
        .args(["run", "--request"])
        .arg(request.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("has no nodes"));
}

#[test]
fn test_ledger_show_rejects_unknown_kind() {
    exapatch()
        .args(["ledger", "show", "--kind", "toaster", "--hosts", "db1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown target kind"));
}
