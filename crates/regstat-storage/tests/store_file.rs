mod common;

use common::{import_vehicles, small_config, uniform_rows, write_license_extract, VehicleRow};
use pretty_assertions::assert_eq;
use regstat_storage::storage::StorageError;
use regstat_storage::{DataKind, Dimension, GeographicEntity, Storage, StorageConfig};

fn all_values(storage: &Storage) -> Vec<(Dimension, DataKind, Vec<String>)> {
    let mut out = Vec::new();
    for kind in DataKind::ALL {
        for dim in Dimension::for_kind(kind) {
            let values = storage.available_values(dim, kind, false).expect("values");
            out.push((dim, kind, values.iter().map(|v| v.value.clone()).collect()));
        }
    }
    out
}

#[test]
fn export_and_full_replace_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = Storage::open_path_with_config(dir.path().join("source.db"), small_config())
        .expect("open source");
    import_vehicles(&source, dir.path(), 2019, &uniform_rows(4, "A", "HONDA", "CIVIC"));
    import_vehicles(
        &source,
        dir.path(),
        2020,
        &[
            VehicleRow::new("B0", "KIA", "RIO").region("Laval (13)"),
            VehicleRow::new("B1", "FORD", "FOCUS").fuel("D"),
        ],
    );
    let license = write_license_extract(dir.path(), 2020, &[("16-19", "F", "5")]);
    source
        .import_file(&license, 2020, DataKind::License, false)
        .expect("license import");

    let exported = dir.path().join("bundle.db");
    source.export_to(&exported).expect("export");
    assert!(matches!(
        source.export_to(&exported),
        Err(StorageError::ValidationFailed(_))
    ));

    let target = Storage::open_path_with_config(dir.path().join("target.db"), small_config())
        .expect("open target");
    import_vehicles(&target, dir.path(), 2018, &uniform_rows(1, "Z", "LADA", "NIVA"));
    let version_before = target.version().expect("version");
    // Warm the cache so the reload has something to drop.
    target
        .available_values(Dimension::Make, DataKind::Vehicle, false)
        .expect("values");

    target.reload_from(&exported).expect("reload");

    assert!(target.version().expect("version") > version_before);
    assert_eq!(all_values(&target), all_values(&source));
    assert_eq!(target.years(DataKind::Vehicle).expect("years"), vec![2019, 2020]);
    assert!(target.contains_kind(DataKind::License).expect("contains"));
    assert_eq!(target.resolve(Dimension::Make, "LADA").expect("resolve"), None);
}

#[test]
fn reload_rejects_files_that_are_not_stores() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open_path(dir.path().join("store.db")).expect("open");
    let bogus = dir.path().join("bogus.db");
    std::fs::write(&bogus, b"not a database").expect("write");

    assert!(matches!(
        storage.reload_from(&bogus),
        Err(StorageError::ValidationFailed(_))
    ));
    assert!(storage.is_connected());

    let memory = Storage::open_in_memory().expect("open");
    assert!(matches!(
        memory.reload_from(dir.path().join("store.db")),
        Err(StorageError::ValidationFailed(_))
    ));
}

#[test]
fn failed_reload_keeps_the_current_store_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = Storage::open_path_with_config(dir.path().join("source.db"), small_config())
        .expect("open source");
    import_vehicles(&source, dir.path(), 2019, &uniform_rows(2, "S", "HONDA", "FIT"));
    let exported = dir.path().join("bundle.db");
    source.export_to(&exported).expect("export");

    let target = Storage::open_path_with_config(dir.path().join("store.db"), small_config())
        .expect("open target");
    import_vehicles(&target, dir.path(), 2020, &uniform_rows(3, "T", "KIA", "RIO"));
    let version = target.version().expect("version");

    // The staging path is taken by a directory, so the copy cannot land.
    std::fs::create_dir(dir.path().join("store.incoming")).expect("block staging path");
    let err = target.reload_from(&exported).expect_err("staging fails");
    assert!(matches!(err, StorageError::Io(_)), "{err:?}");

    assert_eq!(target.row_count(DataKind::Vehicle).expect("count"), 3);
    assert_eq!(target.years(DataKind::Vehicle).expect("years"), vec![2020]);
    assert_eq!(target.version().expect("version"), version);
}

#[test]
fn available_values_follow_imports_without_explicit_invalidation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open_in_memory_with_config(small_config()).expect("open");
    import_vehicles(&storage, dir.path(), 2019, &uniform_rows(2, "A", "HONDA", "CIVIC"));

    let first = storage
        .available_values(Dimension::Make, DataKind::Vehicle, false)
        .expect("values");
    let again = storage
        .available_values(Dimension::Make, DataKind::Vehicle, false)
        .expect("values");
    assert_eq!(first, again);
    let stats = storage.filter_cache_stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));

    import_vehicles(&storage, dir.path(), 2020, &uniform_rows(2, "B", "ACURA", "MDX"));
    let after = storage
        .available_values(Dimension::Make, DataKind::Vehicle, false)
        .expect("values");
    let makes: Vec<&str> = after.iter().map(|v| v.value.as_str()).collect();
    assert_eq!(makes, vec!["ACURA", "HONDA"]);
    assert_eq!(storage.filter_cache_stats().invalidations, 1);
}

#[test]
fn curated_only_values_come_from_curated_years() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open_in_memory_with_config(StorageConfig {
        curated_years: [2019].into_iter().collect(),
        ..small_config()
    })
    .expect("open");
    import_vehicles(&storage, dir.path(), 2019, &uniform_rows(2, "A", "HONDA", "CIVIC"));
    import_vehicles(&storage, dir.path(), 2020, &uniform_rows(2, "B", "ACURA", "MDX"));

    let curated = storage
        .available_values(Dimension::Make, DataKind::Vehicle, true)
        .expect("values");
    assert_eq!(
        curated.iter().map(|v| v.value.as_str()).collect::<Vec<_>>(),
        vec!["HONDA"]
    );

    let models = storage
        .available_values(Dimension::Model, DataKind::Vehicle, false)
        .expect("values");
    let pairs: Vec<(Option<&str>, &str)> = models
        .iter()
        .map(|v| (v.parent.as_deref(), v.value.as_str()))
        .collect();
    assert_eq!(pairs, vec![(Some("ACURA"), "MDX"), (Some("HONDA"), "CIVIC")]);

    let genders = storage
        .available_values(Dimension::Gender, DataKind::Vehicle, false)
        .expect("values");
    assert!(genders.is_empty());
}

#[test]
fn statistics_describe_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open_in_memory_with_config(small_config()).expect("open");
    import_vehicles(&storage, dir.path(), 2019, &uniform_rows(3, "A", "HONDA", "CIVIC"));
    import_vehicles(&storage, dir.path(), 2020, &uniform_rows(2, "B", "HONDA", "FIT"));

    let stats = storage.statistics().expect("statistics");
    let vehicles = stats.kind(DataKind::Vehicle).expect("vehicles");
    assert_eq!(vehicles.rows, 5);
    assert_eq!(
        vehicles.years.iter().map(|y| (y.year, y.rows)).collect::<Vec<_>>(),
        vec![(2019, 3), (2020, 2)]
    );
    assert_eq!(stats.kind(DataKind::License).expect("licenses").rows, 0);
    assert_eq!(stats.dictionaries[&Dimension::Model], 2);
    assert_eq!(stats.imports.len(), 2);

    let json = serde_json::to_value(&stats).expect("json");
    assert_eq!(json["version"], serde_json::json!(stats.version));
}

#[test]
fn closed_store_rejects_every_operation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open_path(dir.path().join("store.db")).expect("open");
    storage.close().expect("close");

    assert!(matches!(storage.row_count(DataKind::Vehicle), Err(StorageError::NotConnected)));
    assert!(matches!(
        storage.resolve(Dimension::Make, "HONDA"),
        Err(StorageError::NotConnected)
    ));
    assert!(matches!(
        storage.available_values(Dimension::Make, DataKind::Vehicle, false),
        Err(StorageError::NotConnected)
    ));
    assert!(matches!(
        Storage::open_existing(dir.path().join("missing.db"), StorageConfig::default()),
        Err(StorageError::NotConnected)
    ));
}

#[test]
fn geographic_entities_seed_the_hierarchy() {
    let storage = Storage::open_in_memory().expect("open");

    let region = storage
        .insert_geographic_entity(&GeographicEntity {
            code: "13".to_string(),
            name: "Laval".to_string(),
            kind: Dimension::Region,
            parent_code: None,
            latitude: Some(45.6),
            longitude: Some(-73.7),
            area: Some(246.1),
        })
        .expect("region");
    let district = GeographicEntity {
        code: "65".to_string(),
        name: "Laval".to_string(),
        kind: Dimension::District,
        parent_code: Some("13".to_string()),
        latitude: None,
        longitude: None,
        area: None,
    };
    let district_id = storage.insert_geographic_entity(&district).expect("district");

    let entries = storage.dictionary_entries(Dimension::District).expect("entries");
    assert_eq!(entries[0].parent_id, Some(region));

    // Re-inserting updates in place.
    let again = storage
        .insert_geographic_entity(&GeographicEntity {
            name: "Ville de Laval".to_string(),
            area: Some(247.0),
            ..district.clone()
        })
        .expect("update");
    assert_eq!(again, district_id);
    let entries = storage.dictionary_entries(Dimension::District).expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].description.as_deref(), Some("Ville de Laval"));
    assert_eq!(
        storage
            .geographic_attributes(Dimension::District, "65")
            .expect("attributes")
            .and_then(|a| a.area),
        Some(247.0)
    );

    let orphan = GeographicEntity {
        code: "66023".to_string(),
        kind: Dimension::Municipality,
        parent_code: Some("99".to_string()),
        ..district
    };
    assert!(matches!(
        storage.insert_geographic_entity(&orphan),
        Err(StorageError::ValidationFailed(_))
    ));

    let not_geographic = GeographicEntity {
        kind: Dimension::Make,
        ..orphan
    };
    assert!(matches!(
        storage.insert_geographic_entity(&not_geographic),
        Err(StorageError::ValidationFailed(_))
    ));
}
