use regstat_model::ParseOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::storage::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Rows written per transaction during an import (default: 50 000).
    pub batch_size: usize,
    /// Lower bound on rows per parse chunk (default: 10 000).
    pub min_chunk_rows: usize,
    /// Upper bound on rows per parse chunk (default: 50 000).
    pub max_chunk_rows: usize,
    /// Cap on parse workers (default: available parallelism).
    pub max_parse_workers: Option<usize>,
    /// Fact tables smaller than this drop their filter indexes for a bulk load and
    /// rebuild them afterwards; larger ones keep indexes live and only refresh
    /// planner statistics (default: 5 000 000 rows).
    pub index_rebuild_threshold_rows: u64,
    /// SQLite busy timeout (default: 5 000 ms).
    pub busy_timeout_ms: u64,
    /// Capacity of the available-values cache (default: 256 entries).
    pub filter_cache_entries: usize,
    /// Sampling period of the import progress reporter (default: 500 ms).
    pub progress_interval_ms: u64,
    /// Years whose vehicle-type and fuel-type columns are fully populated.
    /// Empty means every year is curated.
    pub curated_years: BTreeSet<i32>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_size: 50_000,
            min_chunk_rows: 10_000,
            max_chunk_rows: 50_000,
            max_parse_workers: None,
            index_rebuild_threshold_rows: 5_000_000,
            busy_timeout_ms: 5_000,
            filter_cache_entries: 256,
            progress_interval_ms: 500,
            curated_years: BTreeSet::new(),
        }
    }
}

impl StorageConfig {
    /// Read a JSON config file; missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: StorageConfig = serde_json::from_str(&text)?;
        Ok(config.normalized())
    }

    /// Clamp values into their usable ranges.
    pub fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.min_chunk_rows = self.min_chunk_rows.max(1);
        self.max_chunk_rows = self.max_chunk_rows.max(self.min_chunk_rows);
        self.max_parse_workers = self.max_parse_workers.map(|n| n.max(1));
        self.filter_cache_entries = self.filter_cache_entries.max(1);
        self.progress_interval_ms = self.progress_interval_ms.max(10);
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            min_chunk_rows: self.min_chunk_rows,
            max_chunk_rows: self.max_chunk_rows,
            max_workers: self.max_parse_workers,
        }
    }

    pub fn is_curated(&self, year: i32) -> bool {
        self.curated_years.is_empty() || self.curated_years.contains(&year)
    }
}
