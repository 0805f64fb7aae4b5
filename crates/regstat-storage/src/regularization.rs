//! Inference of vehicle type and fuel type for years that did not report them.
//!
//! Mappings are keyed by the make/model seen in uncurated years. Vehicle type
//! is inferred per `(make, model)`; fuel type varies with trim, so it is
//! inferred per `(make, model, model_year)` and must match all three.

use crate::storage::{bump_version, Result, Storage, StorageError};
use regstat_model::Dimension;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Attribute that regularization can fill in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegularizedAttribute {
    VehicleType,
    FuelType,
}

impl RegularizedAttribute {
    pub fn for_dimension(dimension: Dimension) -> Option<Self> {
        match dimension {
            Dimension::VehicleType => Some(Self::VehicleType),
            Dimension::FuelType => Some(Self::FuelType),
            _ => None,
        }
    }

    pub fn dimension(self) -> Dimension {
        match self {
            Self::VehicleType => Dimension::VehicleType,
            Self::FuelType => Dimension::FuelType,
        }
    }

    /// Column of the regularization table holding the inferred id.
    pub(crate) fn mapping_column(self) -> &'static str {
        match self {
            Self::VehicleType => "vehicle_type_id",
            Self::FuelType => "fuel_type_id",
        }
    }

    /// Fuel type mappings are model-year specific; vehicle type mappings are not.
    pub fn matches_model_year(self) -> bool {
        matches!(self, Self::FuelType)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularizationMapping {
    pub make_id: i64,
    pub model_id: i64,
    pub model_year_id: Option<i64>,
    pub vehicle_type_id: Option<i64>,
    pub fuel_type_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegularizationSummary {
    pub vehicle_type_rows: u64,
    pub fuel_type_rows: u64,
}

/// Make/model ids whose mappings infer one of the requested attribute values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expansion {
    pub make_ids: BTreeSet<i64>,
    pub model_ids: BTreeSet<i64>,
}

impl Expansion {
    pub fn is_empty(&self) -> bool {
        self.make_ids.is_empty() || self.model_ids.is_empty()
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub(crate) fn expand(
    conn: &Connection,
    attribute: RegularizedAttribute,
    targets: &BTreeSet<i64>,
    make_ids: &BTreeSet<i64>,
    model_ids: &BTreeSet<i64>,
    coupling: bool,
) -> rusqlite::Result<Expansion> {
    if targets.is_empty() {
        return Ok(Expansion::default());
    }
    let year_clause = if attribute.matches_model_year() {
        "model_year_id IS NOT NULL"
    } else {
        "model_year_id IS NULL"
    };
    let sql = format!(
        "SELECT DISTINCT uncurated_make_id, uncurated_model_id FROM regularization WHERE {year_clause} AND {column} IN ({slots})",
        column = attribute.mapping_column(),
        slots = placeholders(targets.len()),
    );
    let mut stmt = conn.prepare(&sql)?;
    let pairs = stmt
        .query_map(params_from_iter(targets.iter()), |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let make_ok = |id: &i64| make_ids.is_empty() || make_ids.contains(id);
    let model_ok = |id: &i64| model_ids.is_empty() || model_ids.contains(id);

    let mut out = Expansion::default();
    if coupling {
        for (make, model) in pairs {
            if make_ok(&make) && model_ok(&model) {
                out.make_ids.insert(make);
                out.model_ids.insert(model);
            }
        }
    } else {
        for (make, model) in pairs {
            if make_ok(&make) {
                out.make_ids.insert(make);
            }
            if model_ok(&model) {
                out.model_ids.insert(model);
            }
        }
    }
    Ok(out)
}

impl Storage {
    /// Rebuild every mapping from the current vehicle facts.
    ///
    /// For each make/model (and make/model/model-year for fuel) seen in a year
    /// outside `curated_years`, the most frequent non-null attribute among
    /// curated-year rows with the same key becomes the inferred value. Ties go
    /// to the smaller id.
    pub fn rebuild_regularization(&self, curated_years: &BTreeSet<i32>) -> Result<RegularizationSummary> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM regularization", [])?;

        let mut summary = RegularizationSummary::default();
        if !curated_years.is_empty() {
            let years: Vec<i64> = curated_years.iter().map(|y| *y as i64).collect();
            let curated_ids = format!(
                "SELECT id FROM dim_year WHERE CAST(value AS INTEGER) IN ({})",
                placeholders(years.len())
            );

            let vehicle_type_sql = format!(
                r#"
                WITH uncurated AS (
                  SELECT DISTINCT make_id, model_id FROM vehicles
                  WHERE year_id NOT IN ({curated_ids})
                    AND make_id IS NOT NULL AND model_id IS NOT NULL
                ),
                counts AS (
                  SELECT f.make_id, f.model_id, f.vehicle_type_id AS attr, COUNT(*) AS n
                  FROM vehicles f
                  JOIN uncurated u ON u.make_id = f.make_id AND u.model_id = f.model_id
                  WHERE f.year_id IN ({curated_ids}) AND f.vehicle_type_id IS NOT NULL
                  GROUP BY f.make_id, f.model_id, f.vehicle_type_id
                ),
                ranked AS (
                  SELECT make_id, model_id, attr,
                         ROW_NUMBER() OVER (PARTITION BY make_id, model_id ORDER BY n DESC, attr ASC) AS rn
                  FROM counts
                )
                INSERT INTO regularization (uncurated_make_id, uncurated_model_id, model_year_id, vehicle_type_id)
                SELECT make_id, model_id, NULL, attr FROM ranked WHERE rn = 1
                "#
            );
            let bound: Vec<i64> = years.iter().chain(years.iter()).copied().collect();
            summary.vehicle_type_rows = tx.execute(&vehicle_type_sql, params_from_iter(bound.iter()))? as u64;

            let fuel_type_sql = format!(
                r#"
                WITH uncurated AS (
                  SELECT DISTINCT make_id, model_id, model_year_id FROM vehicles
                  WHERE year_id NOT IN ({curated_ids})
                    AND make_id IS NOT NULL AND model_id IS NOT NULL AND model_year_id IS NOT NULL
                ),
                counts AS (
                  SELECT f.make_id, f.model_id, f.model_year_id, f.fuel_type_id AS attr, COUNT(*) AS n
                  FROM vehicles f
                  JOIN uncurated u
                    ON u.make_id = f.make_id AND u.model_id = f.model_id AND u.model_year_id = f.model_year_id
                  WHERE f.year_id IN ({curated_ids}) AND f.fuel_type_id IS NOT NULL
                  GROUP BY f.make_id, f.model_id, f.model_year_id, f.fuel_type_id
                ),
                ranked AS (
                  SELECT make_id, model_id, model_year_id, attr,
                         ROW_NUMBER() OVER (
                           PARTITION BY make_id, model_id, model_year_id ORDER BY n DESC, attr ASC
                         ) AS rn
                  FROM counts
                )
                INSERT INTO regularization (uncurated_make_id, uncurated_model_id, model_year_id, fuel_type_id)
                SELECT make_id, model_id, model_year_id, attr FROM ranked WHERE rn = 1
                "#
            );
            summary.fuel_type_rows = tx.execute(&fuel_type_sql, params_from_iter(bound.iter()))? as u64;
        }

        bump_version(&tx)?;
        tx.commit()?;
        log::info!(
            "regularization rebuilt: {} vehicle-type and {} fuel-type mappings",
            summary.vehicle_type_rows,
            summary.fuel_type_rows
        );
        Ok(summary)
    }

    /// Insert or replace one mapping row.
    ///
    /// Rows without a model year may only carry a vehicle type; rows with one
    /// may only carry a fuel type.
    pub fn upsert_regularization(&self, mapping: &RegularizationMapping) -> Result<()> {
        match (mapping.model_year_id, mapping.vehicle_type_id, mapping.fuel_type_id) {
            (None, Some(_), None) | (Some(_), None, Some(_)) => {}
            _ => {
                return Err(StorageError::ValidationFailed(
                    "a mapping infers either a vehicle type (no model year) or a fuel type (with model year)"
                        .to_string(),
                ))
            }
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            DELETE FROM regularization
            WHERE uncurated_make_id = ?1 AND uncurated_model_id = ?2 AND model_year_id IS ?3
            "#,
            params![mapping.make_id, mapping.model_id, mapping.model_year_id],
        )?;
        tx.execute(
            r#"
            INSERT INTO regularization
              (uncurated_make_id, uncurated_model_id, model_year_id, vehicle_type_id, fuel_type_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                mapping.make_id,
                mapping.model_id,
                mapping.model_year_id,
                mapping.vehicle_type_id,
                mapping.fuel_type_id
            ],
        )?;
        bump_version(&tx)?;
        tx.commit()?;
        Ok(())
    }

    pub fn regularization_mappings(&self) -> Result<Vec<RegularizationMapping>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT uncurated_make_id, uncurated_model_id, model_year_id, vehicle_type_id, fuel_type_id
            FROM regularization
            ORDER BY uncurated_make_id, uncurated_model_id, IFNULL(model_year_id, 0)
            "#,
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(RegularizationMapping {
                make_id: r.get(0)?,
                model_id: r.get(1)?,
                model_year_id: r.get(2)?,
                vehicle_type_id: r.get(3)?,
                fuel_type_id: r.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Widen make/model id sets to every pair whose mapping infers one of `targets`.
    ///
    /// Non-empty `make_ids` / `model_ids` restrict the result. With `coupling`,
    /// only pairs that co-occur in the mapping table contribute and both sides
    /// must pass their restriction; without it makes and models are widened
    /// independently.
    pub fn expand_regularized(
        &self,
        attribute: RegularizedAttribute,
        targets: &BTreeSet<i64>,
        make_ids: &BTreeSet<i64>,
        model_ids: &BTreeSet<i64>,
        coupling: bool,
    ) -> Result<Expansion> {
        let conn = self.lock()?;
        Ok(expand(&conn, attribute, targets, make_ids, model_ids, coupling)?)
    }
}
