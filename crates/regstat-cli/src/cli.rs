use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use regstat_model::year_from_file_name;
use regstat_storage::{
    DataKind, Dimension, FilterSpec, ImportControl, ImportRequest, Storage, StorageConfig,
};
use serde::Serialize;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Vehicle,
    License,
}

impl From<KindArg> for DataKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Vehicle => DataKind::Vehicle,
            KindArg::License => DataKind::License,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "regstat",
    about = "Import, query and package yearly vehicle-registration and driver's-license extracts."
)]
pub struct Args {
    /// Store file.
    #[arg(long, global = true, default_value = "regstat.db")]
    db: PathBuf,

    /// JSON storage configuration (missing keys take their defaults).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import one yearly extract.
    Import {
        file: PathBuf,

        #[arg(long, value_enum)]
        kind: KindArg,

        /// Extract year; taken from the file name when omitted.
        #[arg(long)]
        year: Option<i32>,

        /// Replace the year if it is already imported.
        #[arg(long)]
        replace: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Run a filter spec (JSON) and print its time series.
    Query {
        spec: PathBuf,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List the selectable values of a dimension.
    Values {
        dimension: String,

        #[arg(long, value_enum)]
        kind: KindArg,

        /// Only values seen in curated years.
        #[arg(long)]
        curated_only: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Rebuild the regularization table from curated years.
    Regularize {
        /// Curated years (repeatable); defaults to the configured curated years.
        #[arg(long = "curated", num_args = 1..)]
        curated: Vec<i32>,
    },
    /// Summarize the store.
    Stats {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Write a compacted copy of the store.
    Export { dest: PathBuf },
}

pub fn run() -> Result<()> {
    run_with_args(Args::parse())
}

pub fn run_with_args(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => StorageConfig::load(path)
            .with_context(|| format!("read config {}", path.display()))?,
        None => StorageConfig::default(),
    };

    match args.command {
        Command::Import {
            file,
            kind,
            year,
            replace,
            format,
        } => {
            let year = match year {
                Some(year) => year,
                None => infer_year(&file)?,
            };
            let storage = open(&args.db, config)?;
            let request = ImportRequest::new(&file, year, kind.into()).replace(replace);
            let result = storage
                .import_with_control(&request, &ImportControl::new())
                .with_context(|| format!("import {}", file.display()))?;
            emit(format, &result, |out| {
                writeln!(out, "Imported {} {}", result.data_kind, result.year)?;
                writeln!(out, "  status:   {}", result.status.as_str())?;
                writeln!(out, "  rows:     {}", result.total)?;
                writeln!(out, "  success:  {}", result.success)?;
                writeln!(out, "  errors:   {} ({} malformed)", result.error, result.malformed)?;
                if result.replaced_rows > 0 {
                    writeln!(out, "  replaced: {}", result.replaced_rows)?;
                }
                writeln!(out, "  duration: {:.2?}", result.duration)
            })
        }
        Command::Query { spec, format } => {
            let text = std::fs::read_to_string(&spec)
                .with_context(|| format!("read filter spec {}", spec.display()))?;
            let filter: FilterSpec = serde_json::from_str(&text)
                .with_context(|| format!("parse filter spec {}", spec.display()))?;
            let storage = open_existing(&args.db, config)?;
            let series = storage.run_query(&filter)?;
            emit(format, &series, |out| {
                if series.is_empty() {
                    return writeln!(out, "No data.");
                }
                for (year, value) in &series.points {
                    writeln!(out, "{year}\t{value}")?;
                }
                Ok(())
            })
        }
        Command::Values {
            dimension,
            kind,
            curated_only,
            format,
        } => {
            let dimension: Dimension = dimension.parse()?;
            let storage = open_existing(&args.db, config)?;
            let values = storage.available_values(dimension, kind.into(), curated_only)?;
            emit(format, values.as_slice(), |out| {
                for value in values.iter() {
                    match (&value.parent, &value.description) {
                        (Some(parent), _) => writeln!(out, "{parent}\t{}", value.value)?,
                        (None, Some(description)) => {
                            writeln!(out, "{}\t{description}", value.value)?
                        }
                        (None, None) => writeln!(out, "{}", value.value)?,
                    }
                }
                Ok(())
            })
        }
        Command::Regularize { curated } => {
            let storage = open_existing(&args.db, config)?;
            let curated: std::collections::BTreeSet<i32> = if curated.is_empty() {
                storage.config().curated_years.clone()
            } else {
                curated.into_iter().collect()
            };
            if curated.is_empty() {
                bail!("no curated years given (use --curated or set curated_years in the config)");
            }
            let summary = storage.rebuild_regularization(&curated)?;
            emit(OutputFormat::Text, &summary, |out| {
                writeln!(
                    out,
                    "Regularization rebuilt from {} curated years: {} vehicle type rows, {} fuel type rows",
                    curated.len(),
                    summary.vehicle_type_rows,
                    summary.fuel_type_rows
                )
            })
        }
        Command::Stats { format } => {
            let storage = open_existing(&args.db, config)?;
            let stats = storage.statistics()?;
            emit(format, &stats, |out| {
                writeln!(out, "Store {} (version {})", args.db.display(), stats.version)?;
                for kind in &stats.kinds {
                    writeln!(out, "  {}: {} rows", kind.kind, kind.rows)?;
                    for year in &kind.years {
                        writeln!(out, "    {}: {}", year.year, year.rows)?;
                    }
                }
                writeln!(out, "  regularization: {} rows", stats.regularization_rows)?;
                writeln!(out, "  imports: {}", stats.imports.len())
            })
        }
        Command::Export { dest } => {
            let storage = open_existing(&args.db, config)?;
            storage.export_to(&dest)?;
            log::info!("exported {} to {}", args.db.display(), dest.display());
            Ok(())
        }
    }
}

fn open(db: &Path, config: StorageConfig) -> Result<Storage> {
    Storage::open_path_with_config(db, config).with_context(|| format!("open store {}", db.display()))
}

fn open_existing(db: &Path, config: StorageConfig) -> Result<Storage> {
    Storage::open_existing(db, config).with_context(|| format!("open store {}", db.display()))
}

fn infer_year(file: &Path) -> Result<i32> {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match year_from_file_name(&name) {
        Some(year) => Ok(year),
        None => bail!("cannot infer the year from '{name}' (pass --year)"),
    }
}

/// Print `value` as JSON or through `text`; a closed stdout is not an error.
fn emit<T, F>(format: OutputFormat, value: &T, text: F) -> Result<()>
where
    T: Serialize + ?Sized,
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let written = match format {
        OutputFormat::Text => text(&mut handle),
        OutputFormat::Json => serde_json::to_writer(&mut handle, value)
            .map_err(io::Error::from)
            .and_then(|()| handle.write_all(b"\n")),
    };
    match written.and_then(|()| handle.flush()) {
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => Ok(other?),
    }
}
