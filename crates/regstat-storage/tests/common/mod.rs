#![allow(dead_code)]

use regstat_model::{LICENSE_COLUMNS, VEHICLE_COLUMNS};
use regstat_storage::{DataKind, ImportResult, Storage, StorageConfig};
use std::path::{Path, PathBuf};

/// One vehicle extract row; every field is written verbatim, empty means null.
#[derive(Clone, Debug)]
pub struct VehicleRow {
    pub sequence: String,
    pub vehicle_type: String,
    pub make: String,
    pub model: String,
    pub model_year: String,
    pub net_mass: String,
    pub axles: String,
    pub fuel: String,
    pub region: String,
}

impl VehicleRow {
    pub fn new(sequence: impl ToString, make: &str, model: &str) -> Self {
        Self {
            sequence: sequence.to_string(),
            vehicle_type: "AU".to_string(),
            make: make.to_string(),
            model: model.to_string(),
            model_year: "2015".to_string(),
            net_mass: "1500".to_string(),
            axles: "2".to_string(),
            fuel: "E".to_string(),
            region: "Montréal (06)".to_string(),
        }
    }

    pub fn vehicle_type(mut self, value: &str) -> Self {
        self.vehicle_type = value.to_string();
        self
    }

    pub fn model_year(mut self, value: &str) -> Self {
        self.model_year = value.to_string();
        self
    }

    pub fn net_mass(mut self, value: &str) -> Self {
        self.net_mass = value.to_string();
        self
    }

    pub fn axles(mut self, value: &str) -> Self {
        self.axles = value.to_string();
        self
    }

    pub fn fuel(mut self, value: &str) -> Self {
        self.fuel = value.to_string();
        self
    }

    pub fn region(mut self, value: &str) -> Self {
        self.region = value.to_string();
        self
    }

    fn line(&self, year: i32) -> String {
        format!(
            "{year},{},PAU,{},{},{},{},{},4,2000,{},BLANC,{},{},Montréal (66),66023",
            self.sequence,
            self.vehicle_type,
            self.make,
            self.model,
            self.model_year,
            self.net_mass,
            self.axles,
            self.fuel,
            self.region
        )
    }
}

pub fn vehicle_extract(year: i32, rows: &[VehicleRow]) -> String {
    let mut out = VEHICLE_COLUMNS.join(",");
    out.push('\n');
    for row in rows {
        out.push_str(&row.line(year));
        out.push('\n');
    }
    out
}

pub fn write_vehicle_extract(dir: &Path, year: i32, rows: &[VehicleRow]) -> PathBuf {
    let path = dir.join(format!("vehicules_{year}.csv"));
    std::fs::write(&path, vehicle_extract(year, rows)).expect("write extract");
    path
}

/// `count` plain rows with sequences `{prefix}0..`.
pub fn uniform_rows(count: usize, prefix: &str, make: &str, model: &str) -> Vec<VehicleRow> {
    (0..count)
        .map(|i| VehicleRow::new(format!("{prefix}{i}"), make, model))
        .collect()
}

pub fn write_license_extract(dir: &Path, year: i32, rows: &[(&str, &str, &str)]) -> PathBuf {
    let path = dir.join(format!("permis_{year}.csv"));
    let mut out = LICENSE_COLUMNS.join(";");
    out.push('\n');
    for (i, (age_group, gender, license_type)) in rows.iter().enumerate() {
        out.push_str(&format!(
            "{year};L{i};{age_group};{gender};Laval (65);Laval (13);{license_type};10 ans et plus;0\n"
        ));
    }
    std::fs::write(&path, out).expect("write extract");
    path
}

pub fn small_config() -> StorageConfig {
    StorageConfig {
        batch_size: 16,
        min_chunk_rows: 8,
        max_chunk_rows: 32,
        max_parse_workers: Some(2),
        progress_interval_ms: 10,
        ..StorageConfig::default()
    }
}

pub fn memory_store() -> Storage {
    Storage::open_in_memory_with_config(small_config()).expect("open store")
}

pub fn import_vehicles(storage: &Storage, dir: &Path, year: i32, rows: &[VehicleRow]) -> ImportResult {
    let path = write_vehicle_extract(dir, year, rows);
    storage
        .import_file(&path, year, DataKind::Vehicle, false)
        .expect("import")
}
