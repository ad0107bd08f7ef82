use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{now}", std::process::id()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_nb<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_nb"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute nb binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_nb(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "nb command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

// Any valid ULID works as an acting admin.
const ADMIN_USER: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

struct TestDb {
    dir: PathBuf,
    db: PathBuf,
}

impl TestDb {
    fn new(prefix: &str) -> Self {
        let dir = unique_temp_dir(prefix);
        let db = dir.join("naturabase.sqlite3");
        Self { dir, db }
    }

    fn admin_args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec![
            "--db".to_string(),
            path_str(&self.db).to_string(),
            "--user".to_string(),
            ADMIN_USER.to_string(),
            "--role".to_string(),
            "admin".to_string(),
        ];
        args.extend(rest.iter().map(ToString::to_string));
        args
    }

    fn args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["--db".to_string(), path_str(&self.db).to_string()];
        args.extend(rest.iter().map(ToString::to_string));
        args
    }

    fn add_reference(&self, kind: &str, draft: &Value) -> Value {
        let payload = draft.to_string();
        let reply = run_json(self.admin_args(&["ref", "add", "--kind", kind, "--json", &payload]));
        reply
            .get("reference")
            .cloned()
            .unwrap_or_else(|| panic!("ref add reply has no reference: {reply}"))
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// Seed the full reference chain one inventory and entry need, returning the
/// candidate payloads as JSON.
fn seed_observation_fixture(db: &TestDb) -> (Value, Value) {
    let observer = db.add_reference("observer", &serde_json::json!({"label": "Luc Besnard"}));
    let department = db.add_reference("department", &serde_json::json!({"code": "73"}));
    let town = db.add_reference(
        "town",
        &serde_json::json!({
            "department_id": as_str(&department, "id"),
            "code": 73_065,
            "name": "Chambéry"
        }),
    );
    let locality = db.add_reference(
        "locality",
        &serde_json::json!({
            "town_id": as_str(&town, "id"),
            "name": "Les Monts",
            "coordinates": {
                "altitude": 320,
                "longitude": 5.91,
                "latitude": 45.58,
                "system": "gps"
            }
        }),
    );
    let class = db.add_reference("species_class", &serde_json::json!({"label": "Oiseaux"}));
    let species = db.add_reference(
        "species",
        &serde_json::json!({
            "species_class_id": as_str(&class, "id"),
            "code": "BUSVAR",
            "name": "Buse variable",
            "latin_name": "Buteo buteo"
        }),
    );
    let sex = db.add_reference("sex", &serde_json::json!({"label": "indéterminé"}));
    let age = db.add_reference("age", &serde_json::json!({"label": "adulte"}));
    let estimate = db.add_reference("number_estimate", &serde_json::json!({"label": "compté"}));

    let inventory_candidate = serde_json::json!({
        "observer_id": as_str(&observer, "id"),
        "associate_ids": [],
        "date": "2024-05-20",
        "time": null,
        "duration_minutes": null,
        "locality_id": as_str(&locality, "id"),
        "custom_coordinates": null,
        "temperature": null,
        "weather_ids": []
    });
    let entry_template = serde_json::json!({
        "species_id": as_str(&species, "id"),
        "sex_id": as_str(&sex, "id"),
        "age_id": as_str(&age, "id"),
        "number_estimate_id": as_str(&estimate, "id"),
        "number": 1,
        "distance_estimate_id": null,
        "distance": null,
        "comment": null,
        "behavior_ids": [],
        "environment_ids": []
    });

    (inventory_candidate, entry_template)
}

#[test]
fn migrate_reports_up_to_date_schema() {
    let db = TestDb::new("nb-migrate");

    let before = run_json(db.args(&["db", "schema-version"]));
    assert_eq!(before.get("current_version").and_then(Value::as_i64), Some(0));

    let migrated = run_json(db.args(&["db", "migrate"]));
    assert_eq!(migrated.get("up_to_date").and_then(Value::as_bool), Some(true));

    let after = run_json(db.args(&["db", "schema-version"]));
    assert_eq!(
        after.get("current_version").and_then(Value::as_i64),
        after.get("target_version").and_then(Value::as_i64)
    );
}

#[test]
fn reference_crud_roundtrip() {
    let db = TestDb::new("nb-refcrud");

    let created = db.add_reference("sex", &serde_json::json!({"label": "femelle"}));
    let id = as_str(&created, "id").to_string();

    let listed = run_json(db.args(&["ref", "list", "--kind", "sex"]));
    let rows = listed
        .get("references")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("listing has no references array: {listed}"));
    assert_eq!(rows.len(), 1);

    // Folded-key duplicate is rejected even with different accents.
    let duplicate = run_nb(db.admin_args(&[
        "ref",
        "add",
        "--kind",
        "sex",
        "--json",
        r#"{"label": "Femelle"}"#,
    ]));
    assert!(!duplicate.status.success());

    let deleted =
        run_json(db.admin_args(&["ref", "delete", "--kind", "sex", "--id", &id]));
    assert_eq!(deleted.get("deleted").and_then(Value::as_bool), Some(true));
}

#[test]
fn anonymous_callers_cannot_mutate_references() {
    let db = TestDb::new("nb-anon");

    let output = run_nb(db.args(&[
        "ref",
        "add",
        "--kind",
        "sex",
        "--json",
        r#"{"label": "femelle"}"#,
    ]));
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not allowed"), "unexpected stderr: {stderr}");
}

#[test]
fn inventory_create_is_idempotent_and_duplicate_entries_fail() {
    let db = TestDb::new("nb-obs");
    let (inventory_candidate, entry_template) = seed_observation_fixture(&db);

    let inventory_json = inventory_candidate.to_string();
    let first = run_json(db.admin_args(&["inventory", "create", "--json", &inventory_json]));
    let second = run_json(db.admin_args(&["inventory", "create", "--json", &inventory_json]));
    let first_id = as_str(
        first.get("inventory").unwrap_or_else(|| panic!("no inventory in reply: {first}")),
        "id",
    );
    let second_id = as_str(
        second.get("inventory").unwrap_or_else(|| panic!("no inventory in reply: {second}")),
        "id",
    );
    assert_eq!(first_id, second_id);

    let mut entry_candidate = entry_template;
    if let Value::Object(map) = &mut entry_candidate {
        map.insert("inventory_id".to_string(), Value::String(first_id.to_string()));
    }
    let entry_json = entry_candidate.to_string();

    let created = run_json(db.admin_args(&["entry", "create", "--json", &entry_json]));
    assert!(created.get("entry").is_some());

    let duplicate = run_nb(db.admin_args(&["entry", "create", "--json", &entry_json]));
    assert!(!duplicate.status.success());

    let count = run_json(db.args(&["entry", "count", "--json", "{}"]));
    assert_eq!(as_u64(&count, "total"), 1);
}

#[test]
fn deleting_the_last_entry_cascades_to_the_inventory() {
    let db = TestDb::new("nb-cascade");
    let (inventory_candidate, entry_template) = seed_observation_fixture(&db);

    let inventory_json = inventory_candidate.to_string();
    let created = run_json(db.admin_args(&["inventory", "create", "--json", &inventory_json]));
    let inventory_id = as_str(
        created.get("inventory").unwrap_or_else(|| panic!("no inventory in reply: {created}")),
        "id",
    )
    .to_string();

    let mut entry_candidate = entry_template;
    if let Value::Object(map) = &mut entry_candidate {
        map.insert("inventory_id".to_string(), Value::String(inventory_id.clone()));
    }
    let entry_json = entry_candidate.to_string();
    let entry = run_json(db.admin_args(&["entry", "create", "--json", &entry_json]));
    let entry_id = as_str(
        entry.get("entry").unwrap_or_else(|| panic!("no entry in reply: {entry}")),
        "id",
    )
    .to_string();

    let deleted = run_json(db.admin_args(&["entry", "delete", "--id", &entry_id]));
    assert_eq!(deleted.get("inventory_deleted").and_then(Value::as_bool), Some(true));

    let lookup = run_json(db.args(&["inventory", "get", "--id", &inventory_id]));
    assert!(lookup.get("inventory").is_some_and(Value::is_null));
}

#[test]
fn entry_search_filters_by_species_text() {
    let db = TestDb::new("nb-search");
    let (inventory_candidate, entry_template) = seed_observation_fixture(&db);

    let inventory_json = inventory_candidate.to_string();
    let created = run_json(db.admin_args(&["inventory", "create", "--json", &inventory_json]));
    let inventory_id = as_str(
        created.get("inventory").unwrap_or_else(|| panic!("no inventory in reply: {created}")),
        "id",
    )
    .to_string();

    let mut entry_candidate = entry_template;
    if let Value::Object(map) = &mut entry_candidate {
        map.insert("inventory_id".to_string(), Value::String(inventory_id));
    }
    run_json(db.admin_args(&["entry", "create", "--json", &entry_candidate.to_string()]));

    let hit = run_json(db.args(&["entry", "search", "--json", r#"{"q": "buse"}"#]));
    assert_eq!(as_u64(&hit, "total"), 1);

    let miss = run_json(db.args(&["entry", "search", "--json", r#"{"q": "mésange"}"#]));
    assert_eq!(as_u64(&miss, "total"), 0);
}

#[test]
fn snapshot_export_import_roundtrip() {
    let source = TestDb::new("nb-export");
    let (inventory_candidate, entry_template) = seed_observation_fixture(&source);

    let inventory_json = inventory_candidate.to_string();
    let created =
        run_json(source.admin_args(&["inventory", "create", "--json", &inventory_json]));
    let inventory_id = as_str(
        created.get("inventory").unwrap_or_else(|| panic!("no inventory in reply: {created}")),
        "id",
    )
    .to_string();
    let mut entry_candidate = entry_template;
    if let Value::Object(map) = &mut entry_candidate {
        map.insert("inventory_id".to_string(), Value::String(inventory_id));
    }
    run_json(source.admin_args(&["entry", "create", "--json", &entry_candidate.to_string()]));

    let snapshot_dir = source.dir.join("snapshot");
    run_json(source.args(&["db", "export", "--out", path_str(&snapshot_dir)]));

    let target = TestDb::new("nb-import");
    let imported =
        run_json(target.args(&["db", "import", "--in", path_str(&snapshot_dir)]));
    let summary = imported
        .get("summary")
        .unwrap_or_else(|| panic!("import reply has no summary: {imported}"));
    assert_eq!(as_u64(summary, "imported_inventories"), 1);
    assert_eq!(as_u64(summary, "imported_entries"), 1);

    let count = run_json(target.args(&["entry", "count", "--json", "{}"]));
    assert_eq!(as_u64(&count, "total"), 1);
}

#[test]
fn import_rows_groups_shared_headers() {
    let db = TestDb::new("nb-rows");
    seed_observation_fixture(&db);

    let rows = serde_json::json!([
        {
            "observer": "Luc Besnard",
            "date": "2024-05-21",
            "department": "73",
            "town": "Chambéry",
            "locality": "Les Monts",
            "species": "BUSVAR",
            "sex": "indéterminé",
            "age": "adulte",
            "number_estimate": "compté",
            "number": 2
        },
        {
            "observer": "Luc Besnard",
            "date": "2024-05-21",
            "department": "73",
            "town": "Chambéry",
            "locality": "Les Monts",
            "species": "BUSVAR",
            "sex": "indéterminé",
            "age": "adulte",
            "number_estimate": "compté",
            "number": 3
        }
    ]);

    let reply =
        run_json(db.admin_args(&["import-rows", "--json", &rows.to_string()]));
    let report =
        reply.get("report").unwrap_or_else(|| panic!("reply has no report: {reply}"));
    assert_eq!(as_u64(report, "created_inventories"), 1);
    assert_eq!(as_u64(report, "reused_inventories"), 1);
    assert_eq!(as_u64(report, "created_entries"), 2);
}

#[test]
fn integrity_check_reports_clean_database() {
    let db = TestDb::new("nb-integrity");
    run_json(db.args(&["db", "migrate"]));

    let report = run_json(db.args(&["db", "integrity-check"]));
    assert_eq!(report.get("quick_check_ok").and_then(Value::as_bool), Some(true));
}
