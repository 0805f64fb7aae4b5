use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use pretty_assertions::assert_eq;
use regstat_model::LICENSE_COLUMNS;

fn regstat(db: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_regstat"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env("RUST_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("run regstat")
}

fn success(output: &Output) -> String {
    assert!(
        output.status.success(),
        "regstat failed\nstderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout.clone()).expect("utf-8 stdout")
}

fn license_extract(dir: &Path, year: i32, genders: &[&str]) -> PathBuf {
    let path = dir.join(format!("permis_{year}.csv"));
    let mut out = LICENSE_COLUMNS.join(";");
    out.push('\n');
    for (i, gender) in genders.iter().enumerate() {
        out.push_str(&format!(
            "{year};L{i};20-24;{gender};Laval (65);Laval (13);5;10 ans et plus;0\n"
        ));
    }
    std::fs::write(&path, out).expect("write extract");
    path
}

#[test]
fn import_query_and_package_a_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("store.db");
    let extract = license_extract(dir.path(), 2021, &["F", "M", "F"]);
    let extract = extract.to_str().expect("utf-8 path");

    let imported = success(&regstat(&db, &["import", extract, "--kind", "license", "--format", "json"]));
    let imported: serde_json::Value = serde_json::from_str(&imported).expect("import json");
    assert_eq!(imported["year"], 2021);
    assert_eq!(imported["success"], 3);

    let duplicate = regstat(&db, &["import", extract, "--kind", "license"]);
    assert!(!duplicate.status.success());

    let spec = dir.path().join("women.json");
    std::fs::write(
        &spec,
        r#"{"data_kind": "license", "selections": {"gender": ["F"]}}"#,
    )
    .expect("write spec");
    let series = success(&regstat(
        &db,
        &["query", spec.to_str().expect("utf-8 path"), "--format", "json"],
    ));
    let series: serde_json::Value = serde_json::from_str(&series).expect("series json");
    assert_eq!(series, serde_json::json!({"points": [[2021, 2.0]]}));

    let text = success(&regstat(&db, &["query", spec.to_str().expect("utf-8 path")]));
    assert_eq!(text, "2021\t2\n");

    let genders = success(&regstat(&db, &["values", "gender", "--kind", "license"]));
    assert_eq!(genders, "F\nM\n");

    let stats = success(&regstat(&db, &["stats", "--format", "json"]));
    let stats: serde_json::Value = serde_json::from_str(&stats).expect("stats json");
    assert_eq!(stats["imports"].as_array().map(Vec::len), Some(1));

    let exported = dir.path().join("bundle.db");
    success(&regstat(&db, &["export", exported.to_str().expect("utf-8 path")]));
    assert!(exported.is_file());
}

#[test]
fn year_must_come_from_the_flag_or_the_file_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("store.db");
    let path = dir.path().join("permis.csv");
    std::fs::write(&path, LICENSE_COLUMNS.join(";")).expect("write extract");

    let output = regstat(&db, &["import", path.to_str().expect("utf-8 path"), "--kind", "license"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--year"));
}

#[test]
fn commands_other_than_import_need_an_existing_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("missing.db");

    let output = regstat(&db, &["stats"]);
    assert!(!output.status.success());
    assert!(!db.exists());
}
