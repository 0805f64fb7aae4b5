mod common;

use common::{import_vehicles, memory_store, uniform_rows, write_license_extract, VehicleRow};
use pretty_assertions::assert_eq;
use regstat_storage::storage::StorageError;
use regstat_storage::{
    CoverageField, DataKind, Dimension, FilterSpec, Measure, Metric, RoadWearMode, Storage,
};
use std::path::Path;

fn masses(prefix: &str, values: &[&str]) -> Vec<VehicleRow> {
    values
        .iter()
        .enumerate()
        .map(|(i, mass)| VehicleRow::new(format!("{prefix}{i}"), "HONDA", "CIVIC").net_mass(mass))
        .collect()
}

fn mass_store(dir: &Path) -> Storage {
    let storage = memory_store();
    import_vehicles(&storage, dir, 2020, &masses("A", &["1000", "2000", "3000", "4000"]));
    import_vehicles(&storage, dir, 2021, &masses("B", &["9000", "1000", "", "5000"]));
    import_vehicles(&storage, dir, 2022, &masses("C", &["", ""]));
    storage
}

fn assert_close(actual: f64, expected: f64) {
    let tolerance = expected.abs().max(1.0) * 1e-9;
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn percentage_against_itself_is_one_hundred() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = mass_store(dir.path());

    let base = FilterSpec::new(DataKind::Vehicle).select(Dimension::Make, ["HONDA"]);
    let spec = base.clone().with_metric(Metric::Percentage {
        baseline: Box::new(base),
    });
    let series = storage.run_query(&spec).expect("query");

    assert_eq!(series.years(), vec![2020, 2021, 2022]);
    for value in series.values() {
        assert_close(value, 100.0);
    }
}

#[test]
fn percentage_of_a_subset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = memory_store();
    let mut rows = uniform_rows(3, "P", "HONDA", "CIVIC");
    rows.push(VehicleRow::new("P9", "FORD", "FOCUS"));
    import_vehicles(&storage, dir.path(), 2020, &rows);

    let spec = FilterSpec::new(DataKind::Vehicle)
        .select(Dimension::Make, ["FORD"])
        .with_metric(Metric::Percentage {
            baseline: Box::new(FilterSpec::new(DataKind::Vehicle)),
        });
    let series = storage.run_query(&spec).expect("query");
    assert_eq!(series.points, vec![(2020, 25.0)]);
}

#[test]
fn median_averages_the_two_middle_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = mass_store(dir.path());

    let spec = FilterSpec::new(DataKind::Vehicle).with_metric(Metric::Median {
        measure: Measure::NetMass,
    });
    let series = storage.run_query(&spec).expect("query");
    // 2022 has no mass at all and is omitted rather than reported as zero.
    assert_eq!(series.points, vec![(2020, 2500.0), (2021, 5000.0)]);
}

#[test]
fn aggregates_skip_years_without_values() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = mass_store(dir.path());

    let sum = storage
        .run_query(&FilterSpec::new(DataKind::Vehicle).with_metric(Metric::Sum {
            measure: Measure::NetMass,
        }))
        .expect("sum");
    assert_eq!(sum.points, vec![(2020, 10000.0), (2021, 15000.0)]);

    let min = storage
        .run_query(&FilterSpec::new(DataKind::Vehicle).with_metric(Metric::Min {
            measure: Measure::NetMass,
        }))
        .expect("min");
    assert_eq!(min.points, vec![(2020, 1000.0), (2021, 1000.0)]);

    let avg = storage
        .run_query(&FilterSpec::new(DataKind::Vehicle).with_metric(Metric::Average {
            measure: Measure::NetMass,
        }))
        .expect("avg");
    assert_eq!(avg.points, vec![(2020, 2500.0), (2021, 5000.0)]);

    let count = storage
        .run_query(&FilterSpec::new(DataKind::Vehicle))
        .expect("count");
    assert_eq!(count.points, vec![(2020, 4.0), (2021, 4.0), (2022, 2.0)]);
}

#[test]
fn coverage_as_percentage_and_as_null_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = mass_store(dir.path());

    let percent = storage
        .run_query(&FilterSpec::new(DataKind::Vehicle).with_metric(Metric::Coverage {
            field: CoverageField::Measure(Measure::NetMass),
            as_percentage: true,
        }))
        .expect("coverage");
    assert_eq!(percent.points, vec![(2020, 100.0), (2021, 75.0), (2022, 0.0)]);

    let nulls = storage
        .run_query(&FilterSpec::new(DataKind::Vehicle).with_metric(Metric::Coverage {
            field: CoverageField::Measure(Measure::NetMass),
            as_percentage: false,
        }))
        .expect("coverage");
    assert_eq!(nulls.points, vec![(2020, 0.0), (2021, 1.0), (2022, 2.0)]);
}

#[test]
fn road_wear_index_weights_mass_by_axle_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = memory_store();
    let rows = vec![
        VehicleRow::new("W0", "VOLVO", "VNL").net_mass("1000").axles("2"),
        VehicleRow::new("W1", "VOLVO", "VNL").net_mass("1000").axles("6"),
        VehicleRow::new("W2", "VOLVO", "VNL").net_mass("1000").axles(""),
        VehicleRow::new("W3", "VOLVO", "VNL").net_mass("2000").axles("3"),
        VehicleRow::new("W4", "VOLVO", "VNL").net_mass("").axles("4"),
    ];
    import_vehicles(&storage, dir.path(), 2020, &rows);

    let m4 = |m: f64| m * m * m * m;
    let expected = m4(1000.0) * 0.1325
        + m4(1000.0) / 216.0
        + m4(1000.0) * 0.1325
        + m4(2000.0) * 0.0381;

    let sum = storage
        .run_query(&FilterSpec::new(DataKind::Vehicle).with_metric(Metric::RoadWearIndex {
            mode: RoadWearMode::Sum,
        }))
        .expect("road wear");
    assert_eq!(sum.years(), vec![2020]);
    assert_close(sum.points[0].1, expected);

    let avg = storage
        .run_query(&FilterSpec::new(DataKind::Vehicle).with_metric(Metric::RoadWearIndex {
            mode: RoadWearMode::Average,
        }))
        .expect("road wear");
    assert_close(avg.points[0].1, expected / 4.0);
}

#[test]
fn age_ranges_are_or_ed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = memory_store();
    let rows = vec![
        VehicleRow::new("G0", "FORD", "F150").model_year("2019"),
        VehicleRow::new("G1", "FORD", "F150").model_year("2010"),
        VehicleRow::new("G2", "FORD", "F150").model_year("2000"),
        VehicleRow::new("G3", "FORD", "F150").model_year(""),
    ];
    import_vehicles(&storage, dir.path(), 2020, &rows);

    let young = FilterSpec::new(DataKind::Vehicle).with_age_range(Some(0), Some(5));
    assert_eq!(storage.run_query(&young).expect("query").points, vec![(2020, 1.0)]);

    let young_or_old = young.with_age_range(Some(15), None);
    assert_eq!(
        storage.run_query(&young_or_old).expect("query").points,
        vec![(2020, 2.0)]
    );

    let mean_age = FilterSpec::new(DataKind::Vehicle).with_metric(Metric::Average {
        measure: Measure::Age,
    });
    let series = storage.run_query(&mean_age).expect("query");
    assert_eq!(series.years(), vec![2020]);
    assert_close(series.points[0].1, 31.0 / 3.0);
}

#[test]
fn normalization_then_cumulative_sum() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = memory_store();
    for (year, count) in [(2019, 2), (2020, 4), (2021, 6)] {
        import_vehicles(&storage, dir.path(), year, &uniform_rows(count, "N", "HONDA", "CIVIC"));
    }

    let mut spec = FilterSpec::new(DataKind::Vehicle);
    spec.normalize_to_first_year = true;
    assert_eq!(
        storage.run_query(&spec).expect("query").values(),
        vec![1.0, 2.0, 3.0]
    );

    spec.cumulative_sum = true;
    assert_eq!(
        storage.run_query(&spec).expect("query").values(),
        vec![1.0, 3.0, 6.0]
    );
}

#[test]
fn normalization_is_skipped_when_the_first_value_is_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = mass_store(dir.path());

    let mut spec = FilterSpec::new(DataKind::Vehicle).with_metric(Metric::Coverage {
        field: CoverageField::Measure(Measure::NetMass),
        as_percentage: false,
    });
    spec.normalize_to_first_year = true;
    assert_eq!(
        storage.run_query(&spec).expect("query").points,
        vec![(2020, 0.0), (2021, 1.0), (2022, 2.0)]
    );
}

#[test]
fn unknown_values_narrow_instead_of_widening() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = memory_store();
    let mut rows = uniform_rows(3, "U", "HONDA", "CIVIC");
    rows.push(VehicleRow::new("U9", "FORD", "FOCUS"));
    import_vehicles(&storage, dir.path(), 2020, &rows);

    let only_unknown = FilterSpec::new(DataKind::Vehicle).select(Dimension::Make, ["NOPE"]);
    assert!(storage.run_query(&only_unknown).expect("query").is_empty());

    let partly_unknown =
        FilterSpec::new(DataKind::Vehicle).select(Dimension::Make, ["HONDA", "NOPE"]);
    assert_eq!(
        storage.run_query(&partly_unknown).expect("query").points,
        vec![(2020, 3.0)]
    );

    let unknown_year = FilterSpec::new(DataKind::Vehicle).with_years([1999]);
    assert!(storage.run_query(&unknown_year).expect("query").is_empty());
}

#[test]
fn model_selection_is_scoped_to_its_make() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = memory_store();
    let mut rows = uniform_rows(3, "H", "HYUNDAI", "SANTA FE");
    rows.extend(uniform_rows(2, "K", "KIA", "SANTA FE"));
    import_vehicles(&storage, dir.path(), 2020, &rows);

    let kia = FilterSpec::new(DataKind::Vehicle).select_model("KIA", "SANTA FE");
    assert_eq!(storage.run_query(&kia).expect("query").points, vec![(2020, 2.0)]);

    let both = kia.select_model("HYUNDAI", "SANTA FE");
    assert_eq!(storage.run_query(&both).expect("query").points, vec![(2020, 5.0)]);

    let by_name = FilterSpec::new(DataKind::Vehicle).select(Dimension::Model, ["SANTA FE"]);
    assert!(matches!(
        storage.run_query(&by_name),
        Err(StorageError::QueryFailed(_))
    ));
}

#[test]
fn geographic_filters_accept_codes_or_labels() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = memory_store();
    let mut rows = uniform_rows(2, "R", "HONDA", "CIVIC");
    rows.push(VehicleRow::new("R9", "HONDA", "CIVIC").region("Laval (13)"));
    import_vehicles(&storage, dir.path(), 2020, &rows);

    let by_code = FilterSpec::new(DataKind::Vehicle).select(Dimension::Region, ["13"]);
    assert_eq!(storage.run_query(&by_code).expect("query").points, vec![(2020, 1.0)]);

    let by_label = FilterSpec::new(DataKind::Vehicle).select(Dimension::Region, ["Montréal (06)"]);
    assert_eq!(storage.run_query(&by_label).expect("query").points, vec![(2020, 2.0)]);
}

#[test]
fn license_queries_filter_by_license_dimensions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = memory_store();
    let path = write_license_extract(
        dir.path(),
        2020,
        &[("16-19", "F", "5"), ("20-24", "M", "5"), ("25-34", "F", "6A")],
    );
    storage
        .import_file(&path, 2020, DataKind::License, false)
        .expect("import");

    let women = FilterSpec::new(DataKind::License).select(Dimension::Gender, ["F"]);
    assert_eq!(storage.run_query(&women).expect("query").points, vec![(2020, 2.0)]);
}

#[test]
fn malformed_specs_fail_loudly() {
    let storage = memory_store();

    let wrong_dimension = FilterSpec::new(DataKind::Vehicle).select(Dimension::Gender, ["F"]);
    assert!(matches!(
        storage.run_query(&wrong_dimension),
        Err(StorageError::QueryFailed(_))
    ));

    let wrong_measure = FilterSpec::new(DataKind::License).with_metric(Metric::Sum {
        measure: Measure::NetMass,
    });
    assert!(matches!(
        storage.run_query(&wrong_measure),
        Err(StorageError::QueryFailed(_))
    ));
}

#[test]
fn closed_store_reports_not_connected() {
    let storage = memory_store();
    storage.close().expect("close");
    assert!(!storage.is_connected());
    assert!(matches!(
        storage.run_query(&FilterSpec::new(DataKind::Vehicle)),
        Err(StorageError::NotConnected)
    ));
    assert!(matches!(storage.version(), Err(StorageError::NotConnected)));
}
