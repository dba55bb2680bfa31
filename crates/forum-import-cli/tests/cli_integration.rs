use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use rusqlite::{params, Connection};
use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_fimport<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_fimport"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute fimport binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_fimport(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "fimport command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let body = fs::read_to_string(&schema_path)
        .unwrap_or_else(|err| panic!("failed to read schema {}: {err}", schema_path.display()));
    let schema_json: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse schema {}: {err}", schema_path.display()));
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

/// Writes a legacy database with groups and `users` users next to an import config for it.
fn write_fixture(sandbox: &Path, users: i64) -> PathBuf {
    let source = sandbox.join("legacy.sqlite3");
    let conn = Connection::open(&source)
        .unwrap_or_else(|err| panic!("failed to create {}: {err}", source.display()));
    conn.execute_batch(
        "CREATE TABLE legacy_usergroup (
           usergroupid INTEGER PRIMARY KEY, title TEXT NOT NULL,
           usertitle TEXT NOT NULL DEFAULT '', forumpermissions INTEGER NOT NULL DEFAULT 0);
         CREATE TABLE legacy_user (
           userid INTEGER PRIMARY KEY, username TEXT NOT NULL, email TEXT NOT NULL DEFAULT '',
           usergroupid INTEGER NOT NULL DEFAULT 2, membergroupids TEXT NOT NULL DEFAULT '',
           joindate INTEGER NOT NULL DEFAULT 0, lastactivity INTEGER NOT NULL DEFAULT 0,
           posts INTEGER NOT NULL DEFAULT 0, usertitle TEXT NOT NULL DEFAULT '',
           signature TEXT NOT NULL DEFAULT '', ipaddress TEXT NOT NULL DEFAULT '');
         INSERT INTO legacy_usergroup(usergroupid, title) VALUES (1, 'Guests'), (2, 'Registered');",
    )
    .unwrap_or_else(|err| panic!("failed to create legacy schema: {err}"));
    for userid in 1..=users {
        conn.execute(
            "INSERT INTO legacy_user(userid, username, joindate) VALUES (?1, ?2, ?3)",
            params![userid, format!("member{userid}"), 1_200_000_000 + userid],
        )
        .unwrap_or_else(|err| panic!("failed to insert legacy user {userid}: {err}"));
    }

    let config = sandbox.join("import.yaml");
    fs::write(
        &config,
        "importer: reference\nsource: legacy.sqlite3\nsteps: [user_groups, users]\nbatch:\n  users: 2\n",
    )
    .unwrap_or_else(|err| panic!("failed to write {}: {err}", config.display()));
    config
}

#[test]
fn db_commands_report_and_apply_migrations() {
    let sandbox = unique_temp_dir("forum-import-cli-db");
    let db = sandbox.join("target.sqlite3");
    let db = path_str(&db);

    let planned = run_json(["--db", db, "db", "migrate", "--dry-run"]);
    assert_eq!(planned["contract_version"], "cli.v1");
    assert!(as_bool(&planned, "dry_run"));
    assert_eq!(planned["would_apply_versions"], serde_json::json!([1, 2]));

    let applied = run_json(["--db", db, "db", "migrate"]);
    assert_eq!(as_i64(&applied, "after_version"), 2);

    let version = run_json(["--db", db, "db", "schema-version"]);
    assert!(as_bool(&version, "up_to_date"));

    let integrity = run_json(["--db", db, "db", "integrity-check"]);
    assert!(as_bool(&integrity, "ok"));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn session_run_and_log_outputs_follow_contracts() {
    let sandbox = unique_temp_dir("forum-import-cli-session");
    let config = write_fixture(&sandbox, 5);
    let db = sandbox.join("target.sqlite3");
    let db = path_str(&db);

    let empty = run_json(["--db", db, "session", "status"]);
    validate_schema("session-status.schema.json", &empty);
    assert!(empty["session"].is_null());

    let started = run_json(["--db", db, "session", "start", "--config", path_str(&config)]);
    validate_schema("session-status.schema.json", &started);
    assert_eq!(started["session"]["queue"], serde_json::json!(["user_groups", "users"]));

    let first = run_json(["--db", db, "run", "--max-invocations", "2"]);
    validate_schema("run.schema.json", &first);
    assert_eq!(as_i64(&first["report"], "invocations"), 2);
    assert_eq!(first["report"]["current_step"], "users");

    let status = run_json(["--db", db, "session", "status"]);
    validate_schema("session-status.schema.json", &status);
    let users = status["session"]["steps"]
        .as_array()
        .and_then(|steps| steps.iter().find(|step| step["name"] == "users"))
        .unwrap_or_else(|| panic!("users step missing: {status}"));
    assert_eq!(as_i64(users, "start_after"), 2);
    assert_eq!(as_i64(users, "end"), 5);

    let rest = run_json(["--db", db, "run"]);
    validate_schema("run.schema.json", &rest);
    assert!(as_bool(&rest["report"], "session_complete"));

    let found = run_json(["--db", db, "log", "lookup", "--type", "user", "--id", "5"]);
    assert!(as_bool(&found, "found"));
    let group = run_json(["--db", db, "log", "lookup", "--type", "user_group", "--id", "1"]);
    assert_eq!(as_i64(&group, "new_id"), 1);
    let missing = run_json(["--db", db, "log", "lookup", "--type", "user", "--id", "6"]);
    assert!(!as_bool(&missing, "found"));

    let stats = run_json(["--db", db, "log", "stats"]);
    assert_eq!(as_i64(&stats, "total"), 7);

    let digest = run_json(["--db", db, "db", "digest", "--table", "user"]);
    assert_eq!(digest["tables"][0]["rows"], 5);

    let cleared = run_json(["--db", db, "session", "reset"]);
    assert!(as_bool(&cleared, "cleared"));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn zero_time_budget_imports_one_record_per_invocation() {
    let sandbox = unique_temp_dir("forum-import-cli-budget");
    let config = write_fixture(&sandbox, 4);
    let db = sandbox.join("target.sqlite3");
    let db = path_str(&db);

    run_json(["--db", db, "session", "start", "--config", path_str(&config)]);
    run_json(["--db", db, "run", "--max-invocations", "1"]);
    let one = run_json(["--db", db, "run", "--max-time-ms", "0", "--max-invocations", "1"]);
    assert_eq!(as_i64(&one["report"], "imported"), 1);

    let rerun = run_json(["--db", db, "run", "--max-time-ms", "0"]);
    assert!(as_bool(&rerun["report"], "session_complete"));
    assert_eq!(as_i64(&rerun["report"], "imported"), 3);
    assert_eq!(as_i64(&rerun["session"], "total_imported"), 4);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn commands_without_prerequisites_fail() {
    let sandbox = unique_temp_dir("forum-import-cli-failures");
    let db = sandbox.join("target.sqlite3");
    let db = path_str(&db);

    assert!(!run_fimport(["--db", db, "run"]).status.success());
    assert!(!run_fimport(["--db", db, "session", "rerun", "--step", "users"]).status.success());
    assert!(!run_fimport(["--db", db, "steps", "list", "--importer", "nope"]).status.success());

    let steps = run_json(["--db", db, "steps", "list", "--importer", "reference"]);
    let names: Vec<&str> = steps["steps"]
        .as_array()
        .map(|steps| steps.iter().filter_map(|step| step["name"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(names, ["user_groups", "users", "forums", "moderators", "threads", "posts"]);
    let batched: Vec<&str> = steps["steps"]
        .as_array()
        .map(|steps| {
            steps
                .iter()
                .filter(|step| step["batched"] == Value::Bool(true))
                .filter_map(|step| step["name"].as_str())
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(batched, ["users", "threads", "posts"]);

    let _ = fs::remove_dir_all(&sandbox);
}
