//! Dictionary store: dense, append-only surrogate ids for every categorical value.
//!
//! Ids are assigned by SQLite (`INTEGER PRIMARY KEY` without reuse while rows
//! exist, and rows are never deleted), so an id handed out once keeps resolving
//! for as long as the store lives.

use crate::storage::{bump_version, Result, Storage, StorageError};
use regstat_model::{split_geographic_value, Dimension};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

/// Scope used by every dimension except `Model`.
pub(crate) const NO_SCOPE: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DictionaryEntry {
    pub id: i64,
    pub value: String,
    pub description: Option<String>,
    pub parent_id: Option<i64>,
}

/// Canonical external value for a raw extract/filter value, plus a description
/// when the raw value carried one (`"Name (code)"` geography).
pub(crate) fn normalize_value(dimension: Dimension, raw: &str) -> (String, Option<String>) {
    if dimension.is_geographic() {
        split_geographic_value(raw)
    } else {
        (raw.trim().to_string(), None)
    }
}

pub(crate) fn lookup(
    conn: &Connection,
    dimension: Dimension,
    scope: i64,
    value: &str,
) -> rusqlite::Result<Option<i64>> {
    conn.prepare_cached(&format!(
        "SELECT id FROM {} WHERE scope_id = ?1 AND value = ?2",
        dimension.table()
    ))?
    .query_row(params![scope, value], |r| r.get(0))
    .optional()
}

pub(crate) fn insert(
    conn: &Connection,
    dimension: Dimension,
    scope: i64,
    value: &str,
    description: Option<&str>,
    parent_id: Option<i64>,
) -> rusqlite::Result<i64> {
    conn.prepare_cached(&format!(
        "INSERT INTO {} (scope_id, value, description, parent_id) VALUES (?1, ?2, ?3, ?4)",
        dimension.table()
    ))?
    .execute(params![scope, value, description, parent_id])?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn lookup_or_insert(
    conn: &Connection,
    dimension: Dimension,
    scope: i64,
    value: &str,
    description: Option<&str>,
    parent_id: Option<i64>,
) -> rusqlite::Result<(i64, bool)> {
    if let Some(id) = lookup(conn, dimension, scope, value)? {
        return Ok((id, false));
    }
    Ok((insert(conn, dimension, scope, value, description, parent_id)?, true))
}

fn require_unscoped(dimension: Dimension) -> Result<()> {
    if dimension.is_scoped() {
        return Err(StorageError::ValidationFailed(format!(
            "{dimension} values are only unique within their make"
        )));
    }
    Ok(())
}

impl Storage {
    /// Id of an external value, without creating it.
    pub fn resolve(&self, dimension: Dimension, value: &str) -> Result<Option<i64>> {
        require_unscoped(dimension)?;
        let (value, _) = normalize_value(dimension, value);
        let conn = self.lock()?;
        Ok(lookup(&conn, dimension, NO_SCOPE, &value)?)
    }

    /// Id of `model` within `make`. A model name alone is ambiguous across makes.
    pub fn resolve_model(&self, make: &str, model: &str) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let Some(make_id) = lookup(&conn, Dimension::Make, NO_SCOPE, make.trim())? else {
            return Ok(None);
        };
        Ok(lookup(&conn, Dimension::Model, make_id, model.trim())?)
    }

    /// External value of an id.
    pub fn reverse(&self, dimension: Dimension, id: i64) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE id = ?1", dimension.table()),
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Id of an external value, creating the entry on first sight.
    ///
    /// Check and insert run under the store's writer lock, so two first
    /// sightings of the same value always agree on one id.
    pub fn resolve_or_create(&self, dimension: Dimension, value: &str) -> Result<i64> {
        require_unscoped(dimension)?;
        let (value, description) = normalize_value(dimension, value);
        if value.is_empty() {
            return Err(StorageError::ValidationFailed(format!(
                "empty {dimension} value"
            )));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let (id, created) =
            lookup_or_insert(&tx, dimension, NO_SCOPE, &value, description.as_deref(), None)?;
        if created {
            bump_version(&tx)?;
        }
        tx.commit()?;
        Ok(id)
    }

    pub fn resolve_or_create_model(&self, make: &str, model: &str) -> Result<i64> {
        let (make, model) = (make.trim(), model.trim());
        if make.is_empty() || model.is_empty() {
            return Err(StorageError::ValidationFailed(
                "models need both a make and a model name".to_string(),
            ));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let (make_id, make_created) =
            lookup_or_insert(&tx, Dimension::Make, NO_SCOPE, make, None, None)?;
        let (model_id, model_created) =
            lookup_or_insert(&tx, Dimension::Model, make_id, model, None, Some(make_id))?;
        if make_created || model_created {
            bump_version(&tx)?;
        }
        tx.commit()?;
        Ok(model_id)
    }

    /// Number of entries in a dimension; ids range over `1..=len`.
    pub fn dictionary_len(&self, dimension: Dimension) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", dimension.table()), [], |r| r.get(0))?;
        Ok(count as u64)
    }

    pub fn dictionary_entries(&self, dimension: Dimension) -> Result<Vec<DictionaryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, value, description, parent_id FROM {} ORDER BY id",
            dimension.table()
        ))?;
        let rows = stmt.query_map([], |r| {
            Ok(DictionaryEntry {
                id: r.get(0)?,
                value: r.get(1)?,
                description: r.get(2)?,
                parent_id: r.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Transaction-scoped resolver used by the ingestion writer.
///
/// Keeps a key→id map across batches. Ids created inside a batch are tracked
/// until the batch commits; if it rolls back they are forgotten, since SQLite
/// discards the rows and may hand the same ids out again.
#[derive(Debug, Default)]
pub(crate) struct DictionaryWriter {
    ids: HashMap<(Dimension, i64), HashMap<String, i64>>,
    pending: Vec<(Dimension, i64, String)>,
    created: u64,
}

impl DictionaryWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn resolve_or_create(
        &mut self,
        conn: &Connection,
        dimension: Dimension,
        scope: i64,
        value: &str,
        description: Option<&str>,
        parent_id: Option<i64>,
    ) -> rusqlite::Result<i64> {
        if let Some(id) = self
            .ids
            .get(&(dimension, scope))
            .and_then(|values| values.get(value))
        {
            return Ok(*id);
        }

        let (id, created) = lookup_or_insert(conn, dimension, scope, value, description, parent_id)?;
        if created {
            self.created += 1;
            self.pending.push((dimension, scope, value.to_string()));
        }
        self.ids
            .entry((dimension, scope))
            .or_default()
            .insert(value.to_string(), id);
        Ok(id)
    }

    /// Resolve a raw extract value, normalizing geography. Empty values stay null.
    pub(crate) fn resolve_raw(
        &mut self,
        conn: &Connection,
        dimension: Dimension,
        raw: Option<&str>,
        parent_id: Option<i64>,
    ) -> rusqlite::Result<Option<i64>> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        let (value, description) = normalize_value(dimension, raw);
        if value.is_empty() {
            return Ok(None);
        }
        self.resolve_or_create(conn, dimension, NO_SCOPE, &value, description.as_deref(), parent_id)
            .map(Some)
    }

    pub(crate) fn commit(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn rollback(&mut self) {
        for (dimension, scope, value) in self.pending.drain(..) {
            if let Some(values) = self.ids.get_mut(&(dimension, scope)) {
                values.remove(&value);
            }
            self.created = self.created.saturating_sub(1);
        }
    }

    /// Entries created so far and still committed or pending.
    pub(crate) fn created(&self) -> u64 {
        self.created
    }
}
