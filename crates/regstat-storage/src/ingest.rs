//! Yearly extract ingestion.
//!
//! One import runs `Preparing → Parsing → Writing → Indexing` while holding the
//! store's connection, so it is the only writer and readers wait for it.

use crate::dictionary::{DictionaryWriter, NO_SCOPE};
use crate::schema;
use crate::storage::{bump_version, fact_row_count, Result, Storage, StorageError};
use regstat_model::{
    read_extract, DataKind, Dimension, ImportControl, ImportPhase, LicenseRecord,
    ProgressReporter, Record, VehicleRecord,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub path: PathBuf,
    pub year: i32,
    pub data_kind: DataKind,
    /// Replace an already imported year instead of rejecting the import.
    pub allow_replace: bool,
}

impl ImportRequest {
    pub fn new(path: impl Into<PathBuf>, year: i32, data_kind: DataKind) -> Self {
        Self {
            path: path.into(),
            year,
            data_kind,
            allow_replace: false,
        }
    }

    pub fn replace(mut self, allow_replace: bool) -> Self {
        self.allow_replace = allow_replace;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ImportStatus {
    Completed,
    /// Stopped by the caller; batches committed before the stop are kept.
    Cancelled,
    /// A batch failed and was rolled back; earlier batches are kept.
    Aborted(String),
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Completed => "completed",
            ImportStatus::Cancelled => "cancelled",
            ImportStatus::Aborted(_) => "aborted",
        }
    }
}

/// How filter indexes were handled around the write phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStrategy {
    /// Indexes dropped before writing and rebuilt afterwards.
    Rebuild,
    /// Indexes kept live; only planner statistics refreshed.
    AnalyzeOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportResult {
    pub year: i32,
    pub data_kind: DataKind,
    /// Data rows in the extract, valid or not.
    pub total: u64,
    pub success: u64,
    /// Malformed rows plus rows rejected at insert time.
    pub error: u64,
    /// Parse-stage share of `error`.
    pub malformed: u64,
    pub duration: Duration,
    pub phase_reached: ImportPhase,
    pub status: ImportStatus,
    pub index_strategy: IndexStrategy,
    pub replaced_rows: u64,
    pub dictionary_entries_created: u64,
}

impl ImportResult {
    pub fn is_complete(&self) -> bool {
        self.status == ImportStatus::Completed
    }
}

#[derive(Debug, Default)]
struct WriteOutcome {
    success: u64,
    rejected: u64,
    replaced: u64,
    status: Option<ImportStatus>,
}

/// Durability settings in force before a bulk load.
struct Durability {
    synchronous: i64,
    cache_size: i64,
}

fn relax_durability(conn: &Connection) -> rusqlite::Result<Durability> {
    let synchronous: i64 = conn.pragma_query_value(None, "synchronous", |r| r.get(0))?;
    let cache_size: i64 = conn.pragma_query_value(None, "cache_size", |r| r.get(0))?;
    conn.pragma_update(None, "synchronous", "OFF")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    // Negative values are KiB: 256 MiB of page cache for the bulk load.
    conn.pragma_update(None, "cache_size", -262_144)?;
    Ok(Durability {
        synchronous,
        cache_size,
    })
}

fn restore_durability(conn: &Connection, prior: &Durability) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", prior.synchronous)?;
    conn.pragma_update(None, "temp_store", "DEFAULT")?;
    conn.pragma_update(None, "cache_size", prior.cache_size)?;
    Ok(())
}

fn is_row_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation || e.code == ErrorCode::TooBig
    )
}

impl Storage {
    /// Import one yearly extract.
    pub fn import(&self, request: ImportRequest) -> Result<ImportResult> {
        self.import_with_control(&request, &ImportControl::new())
    }

    pub fn import_file(
        &self,
        path: impl AsRef<Path>,
        year: i32,
        data_kind: DataKind,
        allow_replace: bool,
    ) -> Result<ImportResult> {
        self.import(ImportRequest::new(path.as_ref(), year, data_kind).replace(allow_replace))
    }

    /// Import with a caller-held control for cancellation and progress.
    ///
    /// Cancellation is honoured between batches and before a batch commits. An
    /// existing year without `allow_replace` fails before the file is read.
    pub fn import_with_control(
        &self,
        request: &ImportRequest,
        control: &ImportControl,
    ) -> Result<ImportResult> {
        if !(1900..=2100).contains(&request.year) {
            return Err(StorageError::ImportFailed(format!(
                "year out of range: {}",
                request.year
            )));
        }

        let started = Instant::now();
        control.set_phase(ImportPhase::Preparing);
        let label = format!("{} {}", request.data_kind, request.year);
        let reporter = ProgressReporter::spawn(
            control.clone(),
            self.config().progress_interval(),
            move |sample| {
                log::debug!(
                    "import {label}: {:?} parsed {}/{} written {}",
                    sample.phase,
                    sample.parsed_rows,
                    sample.total_rows,
                    sample.written_rows
                );
            },
        );

        let result = self.run_import(request, control, started);
        control.set_phase(ImportPhase::Idle);
        reporter.finish();

        match &result {
            Ok(r) => log::info!(
                "imported {} {}: {} ok, {} errors of {} rows in {:?} ({})",
                r.data_kind,
                r.year,
                r.success,
                r.error,
                r.total,
                r.duration,
                r.status.as_str()
            ),
            Err(err) => log::warn!(
                "import of {} {} failed: {err}",
                request.data_kind,
                request.year
            ),
        }
        result
    }

    fn run_import(
        &self,
        request: &ImportRequest,
        control: &ImportControl,
        started: Instant,
    ) -> Result<ImportResult> {
        let kind = request.data_kind;
        let table = schema::fact_table(kind);
        let mut conn = self.lock()?;

        // Preparing
        let existing_year_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM dim_year WHERE scope_id = 0 AND value = ?1",
                params![request.year.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        let existing_rows = match existing_year_id {
            Some(year_id) => conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE year_id = ?1"),
                params![year_id],
                |r| r.get::<_, i64>(0),
            )? as u64,
            None => 0,
        };
        if existing_rows > 0 && !request.allow_replace {
            return Err(StorageError::ImportFailed(format!(
                "{kind} data for {} is already imported",
                request.year
            )));
        }
        let store_rows = fact_row_count(&conn, kind)?;
        let index_strategy = if store_rows < self.config().index_rebuild_threshold_rows {
            IndexStrategy::Rebuild
        } else {
            IndexStrategy::AnalyzeOnly
        };
        log::info!("import {kind} {}: {store_rows} rows in store, indexes {index_strategy:?}", request.year);

        // Parsing
        control.set_phase(ImportPhase::Parsing);
        log::info!("import {kind} {}: parsing", request.year);
        let parsed = read_extract(&request.path, kind, &self.config().parse_options(), control)
            .map_err(|err| {
                StorageError::ImportFailed(format!("{}: {err}", request.path.display()))
            })?;
        log::debug!(
            "parsed {} rows ({} malformed) from {} as {} using {} workers over {} chunks",
            parsed.total_rows(),
            parsed.malformed.len(),
            request.path.display(),
            parsed.encoding.name(),
            parsed.workers,
            parsed.chunks
        );
        let mismatched = parsed
            .records
            .iter()
            .filter(|r| r.year().is_some_and(|y| y != request.year))
            .count();
        if mismatched > 0 {
            log::warn!(
                "{mismatched} rows carry a year other than {}; stored under {}",
                request.year,
                request.year
            );
        }

        let total = parsed.total_rows() as u64;
        let malformed = parsed.malformed.len() as u64;
        let mut result = ImportResult {
            year: request.year,
            data_kind: kind,
            total,
            success: 0,
            error: malformed,
            malformed,
            duration: Duration::ZERO,
            phase_reached: ImportPhase::Parsing,
            status: ImportStatus::Completed,
            index_strategy,
            replaced_rows: 0,
            dictionary_entries_created: 0,
        };
        if control.is_cancelled() {
            result.status = ImportStatus::Cancelled;
            result.duration = started.elapsed();
            return Ok(result);
        }

        // Writing
        control.set_phase(ImportPhase::Writing);
        log::info!("import {kind} {}: writing", request.year);
        result.phase_reached = ImportPhase::Writing;
        let mut writer = DictionaryWriter::new();
        let durability = relax_durability(&conn)?;
        let replace_year_id = existing_year_id.filter(|_| existing_rows > 0);

        let written = (|| -> Result<WriteOutcome> {
            if index_strategy == IndexStrategy::Rebuild {
                schema::drop_filter_indexes(&conn, kind)?;
            }
            write_batches(
                &mut conn,
                &mut writer,
                WriteTarget {
                    kind,
                    year: request.year,
                    replace_year_id,
                },
                &parsed.records,
                self.config().batch_size,
                control,
            )
        })();

        // Indexes and durability come back even when writing failed.
        control.set_phase(ImportPhase::Indexing);
        log::info!("import {kind} {}: indexing", request.year);
        let indexed = match index_strategy {
            IndexStrategy::Rebuild => schema::create_filter_indexes(&conn, kind),
            IndexStrategy::AnalyzeOnly => conn.execute_batch(&format!("ANALYZE {table};")),
        };
        if let Err(err) = restore_durability(&conn, &durability) {
            log::warn!("failed to restore durability settings: {err}");
        }
        let outcome = written?;
        indexed?;
        result.phase_reached = ImportPhase::Indexing;

        result.success = outcome.success;
        result.replaced_rows = outcome.replaced;
        result.error += outcome.rejected;
        result.status = outcome.status.unwrap_or(ImportStatus::Completed);
        result.dictionary_entries_created = writer.created();
        result.duration = started.elapsed();

        conn.execute(
            r#"
            INSERT INTO import_log (year, data_kind, file_name, total, success, error, status, duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                request.year,
                kind.as_str(),
                request
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned()),
                result.total as i64,
                result.success as i64,
                result.error as i64,
                result.status.as_str(),
                result.duration.as_millis() as i64,
            ],
        )?;
        bump_version(&conn)?;
        Ok(result)
    }
}

struct WriteTarget {
    kind: DataKind,
    year: i32,
    /// Year whose existing rows go away with the first committed batch.
    replace_year_id: Option<i64>,
}

fn write_batches(
    conn: &mut Connection,
    writer: &mut DictionaryWriter,
    target: WriteTarget,
    records: &[Record],
    batch_size: usize,
    control: &ImportControl,
) -> Result<WriteOutcome> {
    let WriteTarget {
        kind,
        year,
        mut replace_year_id,
    } = target;
    let mut outcome = WriteOutcome::default();
    let year_value = year.to_string();

    // An extract with no valid rows still replaces the year.
    let batches: Vec<&[Record]> = if records.is_empty() {
        vec![records]
    } else {
        records.chunks(batch_size.max(1)).collect()
    };

    for batch in batches {
        if control.is_cancelled() {
            outcome.status = Some(ImportStatus::Cancelled);
            break;
        }

        let tx = conn.transaction()?;
        let replaced = match replace_year_id {
            Some(year_id) => tx.execute(
                &format!("DELETE FROM {} WHERE year_id = ?1", schema::fact_table(kind)),
                params![year_id],
            )? as u64,
            None => 0,
        };
        let mut ok = 0u64;
        let mut rejected = 0u64;
        let mut failure = None;
        for record in batch {
            let inserted = writer
                .resolve_or_create(&tx, Dimension::Year, NO_SCOPE, &year_value, None, None)
                .and_then(|year_id| insert_record(&tx, writer, year_id, record));
            match inserted {
                Ok(()) => ok += 1,
                Err(err) if is_row_error(&err) => {
                    log::debug!("row {} rejected: {err}", record.sequence());
                    rejected += 1;
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            drop(tx);
            writer.rollback();
            log::warn!("batch rolled back: {err}");
            outcome.status = Some(ImportStatus::Aborted(err.to_string()));
            break;
        }
        if control.is_cancelled() {
            drop(tx);
            writer.rollback();
            outcome.status = Some(ImportStatus::Cancelled);
            break;
        }

        tx.commit()?;
        writer.commit();
        if replace_year_id.take().is_some() {
            log::info!("replaced {replaced} existing {kind} rows for {year}");
            outcome.replaced = replaced;
        }
        outcome.success += ok;
        outcome.rejected += rejected;
        control.add_written(batch.len() as u64);
    }

    if outcome.status.is_none() {
        log::debug!("wrote {} {kind} rows for {year}", outcome.success);
    }
    Ok(outcome)
}

fn insert_record(
    conn: &Connection,
    writer: &mut DictionaryWriter,
    year_id: i64,
    record: &Record,
) -> rusqlite::Result<()> {
    match record {
        Record::Vehicle(v) => insert_vehicle(conn, writer, year_id, v),
        Record::License(l) => insert_license(conn, writer, year_id, l),
    }
}

fn resolve_number(
    conn: &Connection,
    writer: &mut DictionaryWriter,
    dimension: Dimension,
    value: Option<i32>,
) -> rusqlite::Result<Option<i64>> {
    let value = value.map(|v| v.to_string());
    writer.resolve_raw(conn, dimension, value.as_deref(), None)
}

fn insert_vehicle(
    conn: &Connection,
    writer: &mut DictionaryWriter,
    year_id: i64,
    v: &VehicleRecord,
) -> rusqlite::Result<()> {
    let make_id = writer.resolve_raw(conn, Dimension::Make, v.make.as_deref(), None)?;
    let model_id = match (make_id, v.model.as_deref().map(str::trim)) {
        (Some(make_id), Some(model)) if !model.is_empty() => Some(writer.resolve_or_create(
            conn,
            Dimension::Model,
            make_id,
            model,
            None,
            Some(make_id),
        )?),
        _ => None,
    };
    let region_id = writer.resolve_raw(conn, Dimension::Region, v.region.as_deref(), None)?;
    let district_id = writer.resolve_raw(conn, Dimension::District, v.district.as_deref(), region_id)?;
    let municipality_id =
        writer.resolve_raw(conn, Dimension::Municipality, v.municipality.as_deref(), district_id)?;

    let ids = [
        writer.resolve_raw(conn, Dimension::Classification, v.classification.as_deref(), None)?,
        writer.resolve_raw(conn, Dimension::VehicleType, v.vehicle_type.as_deref(), None)?,
        make_id,
        model_id,
        resolve_number(conn, writer, Dimension::ModelYear, v.model_year)?,
        writer.resolve_raw(conn, Dimension::Color, v.color.as_deref(), None)?,
        writer.resolve_raw(conn, Dimension::FuelType, v.fuel_type.as_deref(), None)?,
        resolve_number(conn, writer, Dimension::CylinderCount, v.cylinder_count)?,
        resolve_number(conn, writer, Dimension::AxleCount, v.axle_count)?,
        region_id,
        district_id,
        municipality_id,
    ];

    conn.prepare_cached(
        r#"
        INSERT INTO vehicles (
          year_id, sequence, classification_id, vehicle_type_id, make_id, model_id,
          model_year_id, color_id, fuel_type_id, cylinder_count_id, axle_count_id,
          region_id, district_id, municipality_id, net_mass, displacement, axle_count, model_year
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
        "#,
    )?
    .execute(params![
        year_id,
        v.sequence,
        ids[0],
        ids[1],
        ids[2],
        ids[3],
        ids[4],
        ids[5],
        ids[6],
        ids[7],
        ids[8],
        ids[9],
        ids[10],
        ids[11],
        v.net_mass,
        v.displacement,
        v.axle_count,
        v.model_year,
    ])?;
    Ok(())
}

fn insert_license(
    conn: &Connection,
    writer: &mut DictionaryWriter,
    year_id: i64,
    l: &LicenseRecord,
) -> rusqlite::Result<()> {
    let region_id = writer.resolve_raw(conn, Dimension::Region, l.region.as_deref(), None)?;
    let district_id = writer.resolve_raw(conn, Dimension::District, l.district.as_deref(), region_id)?;
    let license_type_id =
        writer.resolve_raw(conn, Dimension::LicenseType, l.license_type.as_deref(), None)?;
    let age_group_id = writer.resolve_raw(conn, Dimension::AgeGroup, l.age_group.as_deref(), None)?;
    let gender_id = writer.resolve_raw(conn, Dimension::Gender, l.gender.as_deref(), None)?;
    let experience_id =
        writer.resolve_raw(conn, Dimension::Experience, l.experience.as_deref(), None)?;

    conn.prepare_cached(
        r#"
        INSERT INTO licenses (
          year_id, sequence, license_type_id, age_group_id, gender_id, experience_id,
          region_id, district_id, is_probationary
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )?
    .execute(params![
        year_id,
        l.sequence,
        license_type_id,
        age_group_id,
        gender_id,
        experience_id,
        region_id,
        district_id,
        l.is_probationary,
    ])?;
    Ok(())
}
