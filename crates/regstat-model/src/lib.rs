//! Data model for the regstat registration/licence analytics engine.
//!
//! This crate has no storage dependency. It provides:
//! - dimensions and record kinds, with their dictionary/fact column names
//! - extract layouts and typed records
//! - text-encoding detection and parallel, chunked extract parsing
//! - import progress/cancellation primitives
//! - the filter specification and time-series types consumed by the query compiler

mod dimension;
mod filter;
mod import;
mod parallel;
mod progress;
mod record;
mod series;

pub use dimension::{split_geographic_value, DataKind, Dimension, UnknownName};
pub use filter::{
    AgeRange, CoverageField, FilterSpec, Measure, Metric, ModelSelection, RegularizationOptions,
    RoadWearMode,
};
pub use import::{
    decode_extract, detect_encoding, parse_extract, read_extract, MalformedRow, ParseError,
    ParseOptions, ParsedExtract, TextEncoding,
};
pub use parallel::available_workers;
pub use progress::{ImportControl, ImportPhase, ProgressReporter, ProgressSnapshot};
pub use record::{
    columns_for, year_from_file_name, ColumnMap, LicenseRecord, Record, VehicleRecord,
    LICENSE_COLUMNS, VEHICLE_COLUMNS,
};
pub use series::TimeSeries;
