use regstat_storage::storage::StorageError;
use regstat_storage::{Dimension, Storage};

#[test]
fn resolve_or_create_is_idempotent() {
    let storage = Storage::open_in_memory().expect("open storage");

    for dim in [Dimension::Make, Dimension::Color, Dimension::FuelType, Dimension::Gender] {
        let id = storage.resolve_or_create(dim, "VALUE").expect("create");
        assert_eq!(storage.resolve_or_create(dim, "VALUE").expect("again"), id);
        assert_eq!(storage.resolve(dim, "VALUE").expect("resolve"), Some(id));
        assert_eq!(storage.reverse(dim, id).expect("reverse").as_deref(), Some("VALUE"));
        assert_eq!(storage.dictionary_len(dim).expect("len"), 1);
    }
}

#[test]
fn resolve_never_creates() {
    let storage = Storage::open_in_memory().expect("open storage");
    let before = storage.version().expect("version");

    assert_eq!(storage.resolve(Dimension::Make, "TOYOTA").expect("resolve"), None);
    assert_eq!(storage.dictionary_len(Dimension::Make).expect("len"), 0);
    assert_eq!(storage.version().expect("version"), before);
}

#[test]
fn creating_a_value_advances_the_version_once() {
    let storage = Storage::open_in_memory().expect("open storage");
    let v0 = storage.version().expect("version");

    storage.resolve_or_create(Dimension::Make, "FORD").expect("create");
    let v1 = storage.version().expect("version");
    assert!(v1 > v0);

    storage.resolve_or_create(Dimension::Make, "FORD").expect("existing");
    assert_eq!(storage.version().expect("version"), v1);
}

#[test]
fn ids_are_dense() {
    let storage = Storage::open_in_memory().expect("open storage");
    let ids: Vec<i64> = ["A", "B", "C"]
        .iter()
        .map(|v| storage.resolve_or_create(Dimension::Color, v).expect("create"))
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn models_are_scoped_by_make() {
    let storage = Storage::open_in_memory().expect("open storage");

    let hyundai_santa_fe = storage
        .resolve_or_create_model("HYUNDAI", "SANTA FE")
        .expect("create");
    let kia_santa_fe = storage
        .resolve_or_create_model("KIA", "SANTA FE")
        .expect("create");
    assert_ne!(hyundai_santa_fe, kia_santa_fe);

    assert_eq!(
        storage.resolve_model("HYUNDAI", "SANTA FE").expect("resolve"),
        Some(hyundai_santa_fe)
    );
    assert_eq!(
        storage.resolve_model("KIA", "SANTA FE").expect("resolve"),
        Some(kia_santa_fe)
    );
    assert_eq!(storage.resolve_model("FORD", "SANTA FE").expect("resolve"), None);

    let entries = storage.dictionary_entries(Dimension::Model).expect("entries");
    let makes: Vec<Option<i64>> = entries.iter().map(|e| e.parent_id).collect();
    assert_eq!(
        makes,
        vec![
            storage.resolve(Dimension::Make, "HYUNDAI").expect("make"),
            storage.resolve(Dimension::Make, "KIA").expect("make"),
        ]
    );
}

#[test]
fn model_lookup_by_name_alone_is_rejected() {
    let storage = Storage::open_in_memory().expect("open storage");
    storage.resolve_or_create_model("HONDA", "CIVIC").expect("create");

    let err = storage.resolve(Dimension::Model, "CIVIC").expect_err("ambiguous lookup");
    assert!(matches!(err, StorageError::ValidationFailed(_)));
    let err = storage
        .resolve_or_create(Dimension::Model, "ACCORD")
        .expect_err("ambiguous create");
    assert!(matches!(err, StorageError::ValidationFailed(_)));
}

#[test]
fn geographic_values_are_keyed_by_code() {
    let storage = Storage::open_in_memory().expect("open storage");

    let id = storage
        .resolve_or_create(Dimension::Region, "Montréal (06)")
        .expect("create");
    assert_eq!(storage.resolve(Dimension::Region, "06").expect("resolve"), Some(id));
    assert_eq!(
        storage.resolve(Dimension::Region, "Île de Montréal (06)").expect("resolve"),
        Some(id)
    );

    let entries = storage.dictionary_entries(Dimension::Region).expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, "06");
    assert_eq!(entries[0].description.as_deref(), Some("Montréal"));
}

#[test]
fn empty_values_are_rejected() {
    let storage = Storage::open_in_memory().expect("open storage");
    let err = storage
        .resolve_or_create(Dimension::Color, "   ")
        .expect_err("empty value");
    assert!(matches!(err, StorageError::ValidationFailed(_)));
}
