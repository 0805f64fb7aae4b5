use crate::cache::FilterCache;
use crate::config::StorageConfig;
use crate::schema;
use regstat_model::{DataKind, Dimension, ParseError};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store is not connected")]
    NotConnected,
    #[error("query failed: {0}")]
    QueryFailed(String),
    #[error("import failed: {0}")]
    ImportFailed(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Handle to one persisted store.
///
/// All access goes through a single connection guarded by a mutex, which makes
/// the storage engine single-writer: a bulk import holds the connection for its
/// write phase and concurrent readers queue behind it rather than observing a
/// half-populated dictionary.
#[derive(Debug, Clone)]
pub struct Storage {
    conn: Arc<Mutex<Option<Connection>>>,
    path: Option<PathBuf>,
    config: Arc<StorageConfig>,
    pub(crate) cache: Arc<Mutex<FilterCache>>,
}

impl Storage {
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_path_with_config(path, StorageConfig::default())
    }

    pub fn open_path_with_config(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        Self::from_connection(conn, Some(path), config)
    }

    /// Open a store that must already exist on disk.
    pub fn open_existing(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(StorageError::NotConnected);
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .map_err(|_| StorageError::NotConnected)?;
        Self::from_connection(conn, Some(path.to_path_buf()), config)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(StorageConfig::default())
    }

    pub fn open_in_memory_with_config(config: StorageConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, None, config)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>, config: StorageConfig) -> Result<Self> {
        let config = config.normalized();
        conn.busy_timeout(config.busy_timeout())?;
        schema::init(&conn)?;
        let cache = FilterCache::new(config.filter_cache_entries);
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path,
            config: Arc::new(config),
            cache: Arc::new(Mutex::new(cache)),
        })
    }

    fn open_file(&self, path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(self.config.busy_timeout())?;
        schema::init(&conn)?;
        Ok(conn)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Location of the store file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Close the connection. Every later operation fails with `NotConnected`.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().expect("storage mutex poisoned");
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, err)| StorageError::Sqlite(err))?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.conn.lock().expect("storage mutex poisoned").is_some()
    }

    pub(crate) fn lock(&self) -> Result<ConnGuard<'_>> {
        let guard = self.conn.lock().expect("storage mutex poisoned");
        if guard.is_none() {
            return Err(StorageError::NotConnected);
        }
        Ok(ConnGuard { guard })
    }

    /// Monotonically increasing stamp advanced by every mutating operation.
    pub fn version(&self) -> Result<u64> {
        let conn = self.lock()?;
        Ok(read_version(&conn)?)
    }

    pub fn row_count(&self, kind: DataKind) -> Result<u64> {
        let conn = self.lock()?;
        Ok(fact_row_count(&conn, kind)?)
    }

    pub fn year_row_count(&self, kind: DataKind, year: i32) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {table} f JOIN dim_year y ON y.id = f.year_id WHERE y.value = ?1",
                table = schema::fact_table(kind)
            ),
            params![year.to_string()],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// Years present in the fact table of `kind`, ascending.
    pub fn years(&self, kind: DataKind) -> Result<Vec<i32>> {
        let conn = self.lock()?;
        Ok(years_for(&conn, kind)?)
    }

    pub fn contains_kind(&self, kind: DataKind) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM {} LIMIT 1", schema::fact_table(kind)),
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Write a compacted copy of the whole store to `dest`.
    pub fn export_to(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        if dest.exists() {
            return Err(StorageError::ValidationFailed(format!(
                "export destination already exists: {}",
                dest.display()
            )));
        }
        let dest_str = dest.to_str().ok_or_else(|| {
            StorageError::ValidationFailed(format!("non UTF-8 path: {}", dest.display()))
        })?;
        let conn = self.lock()?;
        conn.execute("VACUUM INTO ?1", params![dest_str])?;
        log::info!("exported store to {}", dest.display());
        Ok(())
    }

    /// Replace this store's file with `source` and reopen it.
    ///
    /// Dictionaries are read afresh from the new file and the filter cache is
    /// dropped. The version stamp keeps increasing across the swap.
    pub fn reload_from(&self, source: impl AsRef<Path>) -> Result<()> {
        let source = source.as_ref();
        let Some(path) = self.path.as_deref() else {
            return Err(StorageError::ValidationFailed(
                "in-memory stores cannot be reloaded from a file".to_string(),
            ));
        };
        if !source.is_file() {
            return Err(StorageError::ValidationFailed(format!(
                "store file not found: {}",
                source.display()
            )));
        }
        validate_store_file(source)?;

        // Staged before the live connection is touched; a failed copy leaves it open.
        let staged = path.with_extension("incoming");
        if let Err(err) = std::fs::copy(source, &staged) {
            let _ = std::fs::remove_file(&staged);
            return Err(err.into());
        }

        let mut guard = self.conn.lock().expect("storage mutex poisoned");
        let previous_version = match guard.as_ref() {
            Some(conn) => read_version(conn)?,
            None => 0,
        };
        if let Some(conn) = guard.take() {
            if let Err((conn, err)) = conn.close() {
                *guard = Some(conn);
                let _ = std::fs::remove_file(&staged);
                return Err(StorageError::Sqlite(err));
            }
        }

        let swapped = std::fs::rename(&staged, path)
            .map_err(StorageError::from)
            .and_then(|()| self.open_file(path));
        let conn = match swapped {
            Ok(conn) => conn,
            Err(err) => {
                let _ = std::fs::remove_file(&staged);
                *guard = Some(self.open_file(path)?);
                log::warn!("reload from {} failed: {err}", source.display());
                return Err(err);
            }
        };
        let bumped = read_version(&conn).and_then(|file_version| {
            conn.execute(
                "UPDATE store_meta SET value = ?1 WHERE key = 'version'",
                params![(previous_version.max(file_version) + 1) as i64],
            )
        });
        *guard = Some(conn);
        drop(guard);
        self.cache.lock().expect("filter cache mutex poisoned").clear();
        bumped?;

        log::info!("reloaded store from {}", source.display());
        Ok(())
    }

    pub fn statistics(&self) -> Result<StoreStatistics> {
        let conn = self.lock()?;
        let mut kinds = Vec::new();
        for kind in DataKind::ALL {
            let table = schema::fact_table(kind);
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT CAST(y.value AS INTEGER), COUNT(*)
                FROM {table} f JOIN dim_year y ON y.id = f.year_id
                GROUP BY f.year_id
                ORDER BY 1
                "#
            ))?;
            let years = stmt
                .query_map([], |r| {
                    Ok(YearRows {
                        year: r.get(0)?,
                        rows: r.get::<_, i64>(1)? as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            kinds.push(KindStatistics {
                kind,
                rows: years.iter().map(|y| y.rows).sum(),
                years,
            });
        }

        let mut dictionaries = BTreeMap::new();
        for dim in Dimension::ALL {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", dim.table()), [], |r| r.get(0))?;
            dictionaries.insert(dim, count as u64);
        }

        let regularization_rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM regularization", [], |r| r.get(0))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT year, data_kind, file_name, total, success, error, status, duration_ms, imported_at
            FROM import_log
            ORDER BY id
            "#,
        )?;
        let imports = stmt
            .query_map([], |r| {
                Ok(ImportLogEntry {
                    year: r.get(0)?,
                    data_kind: r.get(1)?,
                    file_name: r.get(2)?,
                    total: r.get::<_, i64>(3)? as u64,
                    success: r.get::<_, i64>(4)? as u64,
                    error: r.get::<_, i64>(5)? as u64,
                    status: r.get(6)?,
                    duration_ms: r.get::<_, i64>(7)? as u64,
                    imported_at: r.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(StoreStatistics {
            version: read_version(&conn)?,
            kinds,
            dictionaries,
            regularization_rows: regularization_rows as u64,
            imports,
        })
    }
}

/// Locked, connected store connection.
pub(crate) struct ConnGuard<'a> {
    guard: MutexGuard<'a, Option<Connection>>,
}

impl std::ops::Deref for ConnGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.guard.as_ref().expect("connection checked on lock")
    }
}

impl std::ops::DerefMut for ConnGuard<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.guard.as_mut().expect("connection checked on lock")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct YearRows {
    pub year: i32,
    pub rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindStatistics {
    pub kind: DataKind,
    pub rows: u64,
    pub years: Vec<YearRows>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportLogEntry {
    pub year: i32,
    pub data_kind: String,
    pub file_name: Option<String>,
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub status: String,
    pub duration_ms: u64,
    pub imported_at: Option<String>,
}

/// Summary of a store's contents, suitable for a package manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub version: u64,
    pub kinds: Vec<KindStatistics>,
    pub dictionaries: BTreeMap<Dimension, u64>,
    pub regularization_rows: u64,
    pub imports: Vec<ImportLogEntry>,
}

impl StoreStatistics {
    pub fn kind(&self, kind: DataKind) -> Option<&KindStatistics> {
        self.kinds.iter().find(|k| k.kind == kind)
    }
}

pub(crate) fn read_version(conn: &Connection) -> rusqlite::Result<u64> {
    let version: i64 = conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'version'",
        [],
        |r| r.get(0),
    )?;
    Ok(version as u64)
}

pub(crate) fn bump_version(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE store_meta SET value = value + 1 WHERE key = 'version'",
        [],
    )?;
    Ok(())
}

pub(crate) fn fact_row_count(conn: &Connection, kind: DataKind) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", schema::fact_table(kind)),
        [],
        |r| r.get(0),
    )?;
    Ok(count as u64)
}

pub(crate) fn years_for(conn: &Connection, kind: DataKind) -> rusqlite::Result<Vec<i32>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT DISTINCT CAST(y.value AS INTEGER)
        FROM dim_year y
        WHERE y.id IN (SELECT DISTINCT year_id FROM {table})
        ORDER BY 1
        "#,
        table = schema::fact_table(kind)
    ))?;
    let rows = stmt.query_map([], |r| r.get(0))?;
    rows.collect()
}

/// Reject files that are not a store before swapping them in.
fn validate_store_file(path: &Path) -> Result<()> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| StorageError::ValidationFailed(format!("cannot open {}: {e}", path.display())))?;
    let tables: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('vehicles', 'licenses', 'store_meta', 'dim_year')",
            [],
            |r| r.get(0),
        )
        .map_err(|e| StorageError::ValidationFailed(format!("{} is not a store: {e}", path.display())))?;
    if tables != 4 {
        return Err(StorageError::ValidationFailed(format!(
            "{} is not a store",
            path.display()
        )));
    }
    Ok(())
}
