use regstat_model::{DataKind, Dimension};
use rusqlite::Connection;

pub(crate) fn fact_table(kind: DataKind) -> &'static str {
    match kind {
        DataKind::Vehicle => "vehicles",
        DataKind::License => "licenses",
    }
}

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;

    for dim in Dimension::ALL {
        // `scope_id` is the make id for models and 0 everywhere else, so the
        // uniqueness constraint never involves NULLs.
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
              id INTEGER PRIMARY KEY,
              scope_id INTEGER NOT NULL DEFAULT 0,
              value TEXT NOT NULL,
              description TEXT,
              parent_id INTEGER,
              UNIQUE (scope_id, value)
            );
            "#,
            table = dim.table()
        ))?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS vehicles (
          id INTEGER PRIMARY KEY,
          year_id INTEGER NOT NULL REFERENCES dim_year(id),
          sequence TEXT NOT NULL,
          classification_id INTEGER REFERENCES dim_classification(id),
          vehicle_type_id INTEGER REFERENCES dim_vehicle_type(id),
          make_id INTEGER REFERENCES dim_make(id),
          model_id INTEGER REFERENCES dim_model(id),
          model_year_id INTEGER REFERENCES dim_model_year(id),
          color_id INTEGER REFERENCES dim_color(id),
          fuel_type_id INTEGER REFERENCES dim_fuel_type(id),
          cylinder_count_id INTEGER REFERENCES dim_cylinder_count(id),
          axle_count_id INTEGER REFERENCES dim_axle_count(id),
          region_id INTEGER REFERENCES dim_region(id),
          district_id INTEGER REFERENCES dim_district(id),
          municipality_id INTEGER REFERENCES dim_municipality(id),
          net_mass REAL,
          displacement REAL,
          axle_count INTEGER,
          model_year INTEGER,
          UNIQUE (year_id, sequence)
        );

        CREATE TABLE IF NOT EXISTS licenses (
          id INTEGER PRIMARY KEY,
          year_id INTEGER NOT NULL REFERENCES dim_year(id),
          sequence TEXT NOT NULL,
          license_type_id INTEGER REFERENCES dim_license_type(id),
          age_group_id INTEGER REFERENCES dim_age_group(id),
          gender_id INTEGER REFERENCES dim_gender(id),
          experience_id INTEGER REFERENCES dim_experience(id),
          region_id INTEGER REFERENCES dim_region(id),
          district_id INTEGER REFERENCES dim_district(id),
          is_probationary INTEGER,
          UNIQUE (year_id, sequence)
        );

        CREATE TABLE IF NOT EXISTS regularization (
          id INTEGER PRIMARY KEY,
          uncurated_make_id INTEGER NOT NULL REFERENCES dim_make(id),
          uncurated_model_id INTEGER NOT NULL REFERENCES dim_model(id),
          model_year_id INTEGER REFERENCES dim_model_year(id),
          vehicle_type_id INTEGER REFERENCES dim_vehicle_type(id),
          fuel_type_id INTEGER REFERENCES dim_fuel_type(id)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_regularization_key
          ON regularization(uncurated_make_id, uncurated_model_id, IFNULL(model_year_id, 0));
        CREATE INDEX IF NOT EXISTS idx_regularization_model
          ON regularization(uncurated_model_id);

        CREATE TABLE IF NOT EXISTS geo_attributes (
          dimension TEXT NOT NULL,
          id INTEGER NOT NULL,
          latitude REAL,
          longitude REAL,
          area REAL,
          PRIMARY KEY (dimension, id)
        );

        CREATE TABLE IF NOT EXISTS store_meta (
          key TEXT PRIMARY KEY,
          value INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO store_meta (key, value) VALUES ('version', 0);

        CREATE TABLE IF NOT EXISTS import_log (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          year INTEGER NOT NULL,
          data_kind TEXT NOT NULL,
          file_name TEXT,
          total INTEGER NOT NULL,
          success INTEGER NOT NULL,
          error INTEGER NOT NULL,
          status TEXT NOT NULL,
          duration_ms INTEGER NOT NULL,
          imported_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )?;

    for kind in DataKind::ALL {
        create_filter_indexes(conn, kind)?;
    }

    Ok(())
}

fn filter_columns(kind: DataKind) -> impl Iterator<Item = &'static str> {
    Dimension::for_kind(kind)
        .filter(|d| *d != Dimension::Year)
        .map(|d| d.fact_column())
}

/// Indexes backing dimension filters. The `(year_id, sequence)` key is a table
/// constraint and is not part of this set.
pub(crate) fn create_filter_indexes(conn: &Connection, kind: DataKind) -> rusqlite::Result<()> {
    let table = fact_table(kind);
    for column in filter_columns(kind) {
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_{column} ON {table}({column});"
        ))?;
    }
    if kind == DataKind::Vehicle {
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_vehicles_year_make_model ON vehicles(year_id, make_id, model_id);",
        )?;
    }
    Ok(())
}

pub(crate) fn drop_filter_indexes(conn: &Connection, kind: DataKind) -> rusqlite::Result<()> {
    let table = fact_table(kind);
    for column in filter_columns(kind) {
        conn.execute_batch(&format!("DROP INDEX IF EXISTS idx_{table}_{column};"))?;
    }
    if kind == DataKind::Vehicle {
        conn.execute_batch("DROP INDEX IF EXISTS idx_vehicles_year_make_model;")?;
    }
    Ok(())
}
