use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use jsonschema::JSONSchema;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use ulid::Ulid;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

fn schema_rejects(schema_path: &Path, value: &Value) -> bool {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    !compiled.is_valid(value)
}

fn run_mbti(db_path: &Path, args: &[&str]) {
    let output = Command::new(env!("CARGO_BIN_EXE_mbti"))
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(db_path)
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to run mbti {args:?}: {err}"));
    assert!(
        output.status.success(),
        "mbti {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stored_value(db_path: &Path, key: &str) -> Value {
    let conn = Connection::open(db_path)
        .unwrap_or_else(|err| panic!("failed to open {}: {err}", db_path.display()));
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM kv_entries WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or_else(|err| panic!("failed to query {key}: {err}"));
    let raw = raw.unwrap_or_else(|| panic!("no stored value for {key}"));
    serde_json::from_str(&raw).unwrap_or_else(|err| panic!("stored {key} is not JSON: {err}"))
}

fn path_arg(path: &Path) -> &str {
    path.to_str()
        .unwrap_or_else(|| panic!("path must be valid UTF-8: {}", path.display()))
}

#[test]
fn contract_pack_validates_fixtures() {
    let repo = repo_root();
    let schema_dir = repo.join("contracts/v1/schemas");
    let fixture_dir = repo.join("contracts/v1/fixtures");

    assert_schema(
        &schema_dir.join("progress.schema.json"),
        &read_json(&fixture_dir.join("progress.sample.json")),
    );
    assert_schema(
        &schema_dir.join("history.schema.json"),
        &read_json(&fixture_dir.join("history.sample.json")),
    );
}

#[test]
fn contract_schemas_reject_malformed_records() {
    let schema_dir = repo_root().join("contracts/v1/schemas");

    let bad_progress = serde_json::json!({
        "answers": [{ "questionId": 0, "value": "E", "weight": 1.5 }],
        "currentQuestion": 1,
        "timestamp": 0
    });
    assert!(schema_rejects(&schema_dir.join("progress.schema.json"), &bad_progress));

    let bad_history = serde_json::json!([{
        "id": "x",
        "date": "2025-10-16 08:00",
        "timestamp": 0,
        "typeCode": "XXXX",
        "answers": [],
        "scores": { "E": 0, "I": 0, "S": 0, "N": 0, "T": 0, "F": 0, "J": 0, "P": 0 }
    }]);
    assert!(schema_rejects(&schema_dir.join("history.schema.json"), &bad_history));
}

#[test]
fn live_store_output_matches_contract_schemas() {
    let repo = repo_root();
    let schema_dir = repo.join("contracts/v1/schemas");
    let fixture_dir = repo.join("contracts/v1/fixtures");
    let catalog = fixture_dir.join("catalog.sample.json");
    let answers = fixture_dir.join("answers.sample.json");
    let db_path = std::env::temp_dir().join(format!("mbti-contracts-{}.sqlite3", Ulid::new()));

    run_mbti(
        &db_path,
        &[
            "progress",
            "save",
            "--answers",
            path_arg(&answers),
            "--current-question",
            "2",
        ],
    );
    assert_schema(
        &schema_dir.join("progress.schema.json"),
        &stored_value(&db_path, "mbti_progress"),
    );

    run_mbti(
        &db_path,
        &[
            "history",
            "save",
            "--catalog",
            path_arg(&catalog),
            "--answers",
            path_arg(&answers),
        ],
    );
    let history = stored_value(&db_path, "mbti_history");
    assert_schema(&schema_dir.join("history.schema.json"), &history);
    assert_eq!(history.as_array().map(Vec::len), Some(1));
}
