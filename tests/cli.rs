mod util;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;
use util::{CmecRow, FixtureDb, Visit, day};

fn fixture() -> FixtureDb {
    let visits = vec![
        Visit::new("Retail", "North", day(2024, 3, 1)).at("08:00:00"),
        Visit::new("Retail", "North", day(2024, 3, 1))
            .at("10:00:00")
            .customer("900123"),
        Visit::new("Retail", "South", day(2024, 3, 1)).at("16:00:00"),
        Visit::new("Horeca", "East", day(2024, 3, 4)).at("09:00:00"),
    ];
    let cmec = vec![
        CmecRow::new(&visits[0], 10, 9, 5, 20.0),
        CmecRow::new(&visits[1], 2, 2, 1, 1.0),
        CmecRow::new(&visits[2], 4, 4, 2, 8.0),
    ];
    FixtureDb::new(&visits, &cmec)
}

/// `smart` isolated from the host config, `.env` and environment.
fn smart(home: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("smart");
    cmd.current_dir(home.path())
        .env("XDG_CONFIG_HOME", home.path())
        .env_remove("SMART_DATABASE")
        .env_remove("RUST_LOG");
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("valid json on stdout")
}

#[test]
fn report_json_for_one_day() {
    let db = fixture();
    let home = TempDir::new().unwrap();
    let out = smart(&home)
        .args(["report", "--json", "--from", "2024-03-01", "--to", "2024-03-01"])
        .arg("--db")
        .arg(db.path())
        .assert()
        .success()
        .get_output()
        .clone();

    let json = stdout_json(&out);
    assert_eq!(json["rows"]["rows"].as_array().unwrap().len(), 3);
    assert_eq!(json["filtered_rows"], 3);
    assert_eq!(json["total_rows"], 4);
    assert_eq!(json["funnel"]["total"]["target_call"].as_f64(), Some(16.0));
    assert_eq!(json["funnel"]["dummy"]["target_call"].as_f64(), Some(2.0));
    assert_eq!(json["route"]["working_time"], "08:00:00");
    assert_eq!(json["failures"].as_array().unwrap().len(), 0);
}

#[test]
fn facets_reconcile_a_stale_pick() {
    let db = fixture();
    let home = TempDir::new().unwrap();
    let out = smart(&home)
        .args(["facets", "--json", "--division", "Horeca", "--sales-office", "North"])
        .arg("--db")
        .arg(db.path())
        .assert()
        .success()
        .get_output()
        .clone();

    let json = stdout_json(&out);
    assert_eq!(json["selection"]["division"]["value"], "Horeca");
    assert_eq!(json["selection"]["sales_office"], "all");
    assert_eq!(json["date_bounds"]["start"], "2024-03-04");
    let office = json["controls"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["facet"] == "sales_office")
        .unwrap();
    assert_eq!(office["options"], serde_json::json!(["All", "East"]));
}

#[test]
fn escaped_all_selects_a_stored_all_value() {
    let visits = vec![
        Visit::new("All", "North", day(2024, 3, 1)),
        Visit::new("Retail", "South", day(2024, 3, 1)),
    ];
    let db = FixtureDb::new(&visits, &[]);
    let home = TempDir::new().unwrap();
    let out = smart(&home)
        .args(["rows", "--all", "--json", "--division", "=All"])
        .arg("--db")
        .arg(db.path())
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&out);
    assert_eq!(json["rows"]["rows"].as_array().unwrap().len(), 1);
}

#[test]
fn rows_all_exports_every_match() {
    let db = fixture();
    let home = TempDir::new().unwrap();
    let out = smart(&home)
        .args(["rows", "--all", "--json", "--division", "Retail"])
        .arg("--db")
        .arg(db.path())
        .assert()
        .success()
        .get_output()
        .clone();
    let json = stdout_json(&out);
    assert_eq!(json["rows"]["rows"].as_array().unwrap().len(), 3);
}

#[test]
fn schema_reads_database_from_config_file() {
    let db = fixture();
    let home = TempDir::new().unwrap();
    let config = home.path().join("engine.toml");
    std::fs::write(
        &config,
        format!("database = {:?}\n", db.path().display().to_string()),
    )
    .unwrap();

    smart(&home)
        .arg("schema")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"Sales_Office_Name\""))
        .stdout(predicate::str::contains("\"degraded\": false"));
}

#[test]
fn database_env_var_is_honoured() {
    let db = fixture();
    let home = TempDir::new().unwrap();
    smart(&home)
        .env("SMART_DATABASE", db.path())
        .args(["schema", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"table\":\"SMI_Final\""));
}

#[test]
fn missing_database_is_a_usage_error() {
    let home = TempDir::new().unwrap();
    smart(&home)
        .arg("schema")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no database configured"))
        .stderr(predicate::str::contains("hint:"));
}

#[test]
fn json_errors_are_structured() {
    let home = TempDir::new().unwrap();
    let out = smart(&home)
        .args(["report", "--json"])
        .assert()
        .code(2)
        .get_output()
        .clone();
    let err: Value = serde_json::from_slice(&out.stderr).expect("json error on stderr");
    assert_eq!(err["error"]["code"], 2);
    assert_eq!(err["error"]["kind"], "usage");
    assert_eq!(err["error"]["retryable"], false);
}

#[test]
fn invalid_config_exits_with_config_error() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("engine.toml");
    std::fs::write(&config, "preview_row_cap = 90\nmax_row_cap = 60\n").unwrap();
    smart(&home)
        .args(["schema", "--config"])
        .arg(&config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("preview_row_cap (90) exceeds max_row_cap (60)"));
}

#[test]
fn help_lists_subcommands() {
    let home = TempDir::new().unwrap();
    smart(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("report"))
        .stdout(predicate::str::contains("facets"));
}
