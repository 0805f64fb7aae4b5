use crate::dictionary::{lookup, NO_SCOPE};
use crate::storage::{bump_version, Result, Storage, StorageError};
use regstat_model::Dimension;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

/// One region, district or municipality from a geographic reference file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeographicEntity {
    pub code: String,
    pub name: String,
    /// `Region`, `District` or `Municipality`.
    pub kind: Dimension,
    /// Code of the enclosing entity one level up.
    pub parent_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Surface in km².
    pub area: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GeographicAttributes {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub area: Option<f64>,
}

impl Storage {
    /// Seed or update a geographic dictionary entry.
    ///
    /// An existing code keeps its id; its name, parent and attributes are
    /// overwritten.
    pub fn insert_geographic_entity(&self, entity: &GeographicEntity) -> Result<i64> {
        if !entity.kind.is_geographic() {
            return Err(StorageError::ValidationFailed(format!(
                "{} is not a geographic level",
                entity.kind
            )));
        }
        let code = entity.code.trim();
        if code.is_empty() {
            return Err(StorageError::ValidationFailed(
                "geographic entity without a code".to_string(),
            ));
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let parent_id = match (entity.kind.parent(), entity.parent_code.as_deref()) {
            (Some(level), Some(parent_code)) => {
                let parent_code = parent_code.trim();
                let id = lookup(&tx, level, NO_SCOPE, parent_code)?.ok_or_else(|| {
                    StorageError::ValidationFailed(format!(
                        "unknown {level} {parent_code} for {} {code}",
                        entity.kind
                    ))
                })?;
                Some(id)
            }
            (None, Some(parent_code)) => {
                log::warn!("ignoring parent {parent_code} of top-level {} {code}", entity.kind);
                None
            }
            (_, None) => None,
        };

        let table = entity.kind.table();
        let name = entity.name.trim();
        let name = (!name.is_empty()).then_some(name);
        let id = match lookup(&tx, entity.kind, NO_SCOPE, code)? {
            Some(id) => {
                tx.execute(
                    &format!(
                        "UPDATE {table} SET description = COALESCE(?1, description), parent_id = COALESCE(?2, parent_id) WHERE id = ?3"
                    ),
                    params![name, parent_id, id],
                )?;
                id
            }
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO {table} (scope_id, value, description, parent_id) VALUES (?1, ?2, ?3, ?4)"
                    ),
                    params![NO_SCOPE, code, name, parent_id],
                )?;
                tx.last_insert_rowid()
            }
        };

        tx.execute(
            r#"
            INSERT INTO geo_attributes (dimension, id, latitude, longitude, area)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(dimension, id) DO UPDATE SET
              latitude = excluded.latitude,
              longitude = excluded.longitude,
              area = excluded.area
            "#,
            params![
                entity.kind.as_str(),
                id,
                entity.latitude,
                entity.longitude,
                entity.area
            ],
        )?;
        bump_version(&tx)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn geographic_attributes(
        &self,
        kind: Dimension,
        code: &str,
    ) -> Result<Option<GeographicAttributes>> {
        let conn = self.lock()?;
        let Some(id) = lookup(&conn, kind, NO_SCOPE, code.trim())? else {
            return Ok(None);
        };
        let attrs = conn
            .query_row(
                "SELECT latitude, longitude, area FROM geo_attributes WHERE dimension = ?1 AND id = ?2",
                params![kind.as_str(), id],
                |r| {
                    Ok(GeographicAttributes {
                        latitude: r.get(0)?,
                        longitude: r.get(1)?,
                        area: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(attrs)
    }
}
