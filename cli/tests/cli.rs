use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

fn write_config(dir: &Path, extra: Value) -> std::path::PathBuf {
    let mut config = json!({
        "project_id": "acme",
        "dataset_id": "raw",
        "warehouse_dir": dir.join("warehouse"),
    });
    if let (Some(config), Value::Object(extra)) = (config.as_object_mut(), extra) {
        config.extend(extra);
    }
    let path = dir.join("config.json");
    fs::write(&path, config.to_string()).unwrap();
    path
}

fn bqtarget() -> Command {
    Command::cargo_bin("bqtarget").unwrap()
}

const INPUT: &str = concat!(
    r#"{"type":"SCHEMA","stream":"users","schema":{"properties":{"id":{"type":"integer"},"name":{"type":"string"}}},"key_properties":["id"]}"#,
    "\n",
    r#"{"type":"RECORD","stream":"users","record":{"id":1,"name":"ada"}}"#,
    "\n",
    r#"{"type":"RECORD","stream":"users","record":{"id":2,"name":"grace"}}"#,
    "\n",
    r#"{"type":"STATE","value":{"bookmarks":{"users":2}}}"#,
    "\n",
);

#[test]
fn loads_records_and_echoes_final_state() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), json!({}));

    bqtarget()
        .arg("--config")
        .arg(&config)
        .write_stdin(INPUT)
        .assert()
        .success()
        .stdout("{\"bookmarks\":{\"users\":2}}\n");

    let rows = fs::read_to_string(dir.path().join("warehouse/acme/raw/users/rows.jsonl")).unwrap();
    assert_eq!(rows.lines().count(), 2);
}

#[test]
fn missing_config_key_exits_with_config_code() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    fs::write(&path, r#"{"project_id": "acme"}"#).unwrap();

    bqtarget()
        .arg("-c")
        .arg(&path)
        .write_stdin("")
        .assert()
        .code(2)
        .stdout("")
        .stderr(predicate::str::contains("dataset_id"));
}

#[test]
fn malformed_input_exits_with_parse_code() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), json!({}));

    bqtarget()
        .arg("-c")
        .arg(&config)
        .write_stdin(format!("{INPUT}{{not json\n"))
        .assert()
        .code(3)
        .stdout("");
}

#[test]
fn schema_sync_dry_run_prints_plan() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), json!({"table_prefix": "tap_"}));
    let catalog = dir.path().join("catalog.json");
    fs::write(
        &catalog,
        json!({"streams": [
            {"tap_stream_id": "users", "schema": {"properties": {"id": {"type": "integer"}}}},
            {"tap_stream_id": "orders", "schema": {"properties": {"id": {"type": "integer"}}}}
        ]})
        .to_string(),
    )
    .unwrap();

    let output = bqtarget()
        .args(["-c"])
        .arg(&config)
        .arg("--schema")
        .arg(&catalog)
        .args(["--dryrun", "--tables", "users"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let plan: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(plan["dry_run"], true);
    assert_eq!(plan["tables"].as_array().unwrap().len(), 1);
    assert_eq!(plan["tables"][0]["table"], "acme.raw.tap_users");
    assert_eq!(plan["tables"][0]["action"], "create");
    assert!(!dir.path().join("warehouse/acme/raw/tap_users").exists());
}

#[test]
fn schema_sync_creates_tables() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), json!({}));
    let catalog = dir.path().join("catalog.json");
    fs::write(
        &catalog,
        json!({"streams": [
            {"stream": "users", "schema": {"properties": {"id": {"type": "integer"}}}}
        ]})
        .to_string(),
    )
    .unwrap();

    bqtarget()
        .arg("-c")
        .arg(&config)
        .arg("-s")
        .arg(&catalog)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"applied\": true"));

    assert!(dir
        .path()
        .join("warehouse/acme/raw/users/table.json")
        .exists());
}
