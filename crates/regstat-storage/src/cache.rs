use crate::schema;
use crate::storage::{read_version, Result, Storage};
use lru::LruCache;
use regstat_model::{DataKind, Dimension};
use rusqlite::Connection;
use serde::Serialize;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// One selectable value of a dimension.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DimensionValue {
    pub value: String,
    pub description: Option<String>,
    /// Make for models, parent code for districts and municipalities.
    pub parent: Option<String>,
}

type CacheKey = (Dimension, DataKind, bool);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilterCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Snapshot of currently valid values per dimension.
///
/// Entries are tagged with the store version they were computed at and the
/// whole cache is dropped as soon as the store version moves. It is never
/// authoritative: clearing it only costs a recomputation.
pub struct FilterCache {
    entries: LruCache<CacheKey, Arc<Vec<DimensionValue>>>,
    version: Option<u64>,
    stats: FilterCacheStats,
}

impl fmt::Debug for FilterCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterCache")
            .field("entries", &self.entries.len())
            .field("version", &self.version)
            .field("stats", &self.stats)
            .finish()
    }
}

impl FilterCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            version: None,
            stats: FilterCacheStats::default(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.version = None;
    }

    fn sync_version(&mut self, version: u64) {
        if self.version != Some(version) {
            if self.version.is_some() {
                log::debug!(
                    "filter cache invalidated (version {:?} -> {version})",
                    self.version
                );
                self.stats.invalidations += 1;
            }
            self.entries.clear();
            self.version = Some(version);
        }
    }
}

impl Storage {
    /// Values of `dimension` present in the `kind` fact table.
    ///
    /// With `curated_only`, only rows from the configured curated years count.
    /// Results come from the filter cache, which notices imports on its own by
    /// comparing the store version.
    pub fn available_values(
        &self,
        dimension: Dimension,
        kind: DataKind,
        curated_only: bool,
    ) -> Result<Arc<Vec<DimensionValue>>> {
        if !dimension.applies_to(kind) {
            return Ok(Arc::new(Vec::new()));
        }
        let conn = self.lock()?;
        let version = read_version(&conn)?;
        let key = (dimension, kind, curated_only);
        {
            let mut cache = self.cache.lock().expect("filter cache mutex poisoned");
            cache.sync_version(version);
            let hit = cache.entries.get(&key).cloned();
            if let Some(hit) = hit {
                cache.stats.hits += 1;
                return Ok(hit);
            }
            cache.stats.misses += 1;
        }

        let curated: Vec<i32> = if curated_only {
            self.config().curated_years.iter().copied().collect()
        } else {
            Vec::new()
        };
        let values = Arc::new(load_values(&conn, dimension, kind, &curated)?);
        drop(conn);

        let mut cache = self.cache.lock().expect("filter cache mutex poisoned");
        if cache.version == Some(version) {
            cache.entries.put(key, values.clone());
        }
        Ok(values)
    }

    pub fn filter_cache_stats(&self) -> FilterCacheStats {
        self.cache.lock().expect("filter cache mutex poisoned").stats
    }
}

fn load_values(
    conn: &Connection,
    dimension: Dimension,
    kind: DataKind,
    curated_years: &[i32],
) -> rusqlite::Result<Vec<DimensionValue>> {
    let table = schema::fact_table(kind);
    let column = dimension.fact_column();
    let year_filter = if curated_years.is_empty() {
        String::new()
    } else {
        let placeholders = vec!["?"; curated_years.len()].join(", ");
        format!(
            " WHERE f.year_id IN (SELECT id FROM dim_year WHERE CAST(value AS INTEGER) IN ({placeholders}))"
        )
    };
    let parent_join = match dimension.parent() {
        Some(parent) => format!("LEFT JOIN {} p ON p.id = d.parent_id", parent.table()),
        None => "LEFT JOIN (SELECT NULL AS id, NULL AS value) p ON 0".to_string(),
    };
    let order = if dimension == Dimension::Year
        || dimension == Dimension::ModelYear
        || dimension == Dimension::CylinderCount
        || dimension == Dimension::AxleCount
    {
        "ORDER BY CAST(d.value AS INTEGER), d.value"
    } else {
        "ORDER BY p.value, d.value"
    };
    let sql = format!(
        r#"
        SELECT d.value, d.description, p.value
        FROM {dim_table} d
        {parent_join}
        WHERE d.id IN (SELECT DISTINCT f.{column} FROM {table} f{year_filter})
        {order}
        "#,
        dim_table = dimension.table(),
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(curated_years.iter()), |r| {
        Ok(DimensionValue {
            value: r.get(0)?,
            description: r.get(1)?,
            parent: r.get(2)?,
        })
    })?;
    rows.collect()
}
