//! SQLite-backed store for yearly vehicle-registration and driver's-license extracts.
//!
//! Categorical columns are dictionary encoded (one table per dimension) and
//! every fact row carries ids. The crate exposes:
//! - store lifecycle and store-file primitives (export, reload, statistics)
//! - the dictionary store and geographic seeding
//! - single-writer bulk ingestion with cancellation and progress
//! - regularization of vehicle type / fuel type for uncurated years
//! - the query compiler producing per-year time series
//! - a version-stamped cache of selectable filter values

mod cache;
mod config;
mod dictionary;
mod geo;
mod ingest;
mod query;
mod queue;
mod regularization;
mod schema;
pub mod storage;

pub use cache::{DimensionValue, FilterCacheStats};
pub use config::StorageConfig;
pub use dictionary::DictionaryEntry;
pub use geo::{GeographicAttributes, GeographicEntity};
pub use ingest::{ImportRequest, ImportResult, ImportStatus, IndexStrategy};
pub use queue::ImportQueue;
pub use regularization::{
    Expansion, RegularizationMapping, RegularizationSummary, RegularizedAttribute,
};
pub use storage::{
    ImportLogEntry, KindStatistics, Result, Storage, StorageError, StoreStatistics, YearRows,
};

pub use regstat_model::{
    AgeRange, CoverageField, DataKind, Dimension, FilterSpec, ImportControl, ImportPhase, Measure,
    Metric, ModelSelection, ProgressSnapshot, RegularizationOptions, RoadWearMode, TimeSeries,
};
