use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::dimension::{DataKind, Dimension};

/// Native numeric measures stored on fact rows, plus the derived vehicle age.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    NetMass,
    Displacement,
    AxleCount,
    ModelYear,
    /// `year - model_year`.
    Age,
}

impl Measure {
    pub fn applies_to(self, kind: DataKind) -> bool {
        kind == DataKind::Vehicle
    }
}

/// Column whose population is measured by [`Metric::Coverage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageField {
    Dimension(Dimension),
    Measure(Measure),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoadWearMode {
    #[default]
    Sum,
    Average,
}

/// Aggregation computed per year.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Metric {
    #[default]
    Count,
    Sum { measure: Measure },
    Average { measure: Measure },
    Min { measure: Measure },
    Max { measure: Measure },
    Median { measure: Measure },
    /// Row count of this filter as a percentage of the baseline filter's row count.
    Percentage { baseline: Box<FilterSpec> },
    /// `non-null / total * 100` when `as_percentage`, otherwise the null count.
    Coverage {
        field: CoverageField,
        #[serde(default = "default_true")]
        as_percentage: bool,
    },
    /// Fourth-power road wear of net mass, weighted by axle count.
    RoadWearIndex {
        #[serde(default)]
        mode: RoadWearMode,
    },
}

fn default_true() -> bool {
    true
}

/// Inclusive vehicle age bounds; an absent bound is open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeRange {
    #[serde(default)]
    pub min: Option<i32>,
    #[serde(default)]
    pub max: Option<i32>,
}

/// Opt-in inference of vehicle type / fuel type for uncurated years.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularizationOptions {
    /// Years whose vehicle-type and fuel-type columns are trustworthy; every other
    /// year is treated as uncurated. An empty set disables inference.
    pub curated_years: BTreeSet<i32>,
    /// Keep make and model expansion paired instead of widening each on its own.
    #[serde(default = "default_true")]
    pub coupling: bool,
}

impl RegularizationOptions {
    pub fn is_curated(&self, year: i32) -> bool {
        self.curated_years.contains(&year)
    }
}

/// A single model selection. Models are only meaningful within their make.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelSelection {
    pub make: String,
    pub model: String,
}

impl ModelSelection {
    pub fn new(make: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            make: make.into(),
            model: model.into(),
        }
    }
}

/// Declarative description of one time-series query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    pub data_kind: DataKind,
    /// Years to include; empty means every year.
    pub years: BTreeSet<i32>,
    /// Selected external values per dimension; an absent or empty set does not filter.
    pub selections: BTreeMap<Dimension, BTreeSet<String>>,
    /// Selected `(make, model)` pairs.
    pub models: BTreeSet<ModelSelection>,
    pub metric: Metric,
    /// Vehicle age ranges, OR-ed together.
    pub age_ranges: Vec<AgeRange>,
    pub regularization: Option<RegularizationOptions>,
    /// Divide every value by the first year's value.
    pub normalize_to_first_year: bool,
    /// Replace the series by its running sum (after normalization).
    pub cumulative_sum: bool,
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self::new(DataKind::Vehicle)
    }
}

impl FilterSpec {
    pub fn new(data_kind: DataKind) -> Self {
        Self {
            data_kind,
            years: BTreeSet::new(),
            selections: BTreeMap::new(),
            models: BTreeSet::new(),
            metric: Metric::Count,
            age_ranges: Vec::new(),
            regularization: None,
            normalize_to_first_year: false,
            cumulative_sum: false,
        }
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_years(mut self, years: impl IntoIterator<Item = i32>) -> Self {
        self.years.extend(years);
        self
    }

    pub fn select<I, S>(mut self, dimension: Dimension, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selections
            .entry(dimension)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn select_model(mut self, make: impl Into<String>, model: impl Into<String>) -> Self {
        self.models.insert(ModelSelection::new(make, model));
        self
    }

    pub fn with_age_range(mut self, min: Option<i32>, max: Option<i32>) -> Self {
        self.age_ranges.push(AgeRange { min, max });
        self
    }

    pub fn with_regularization(mut self, options: RegularizationOptions) -> Self {
        self.regularization = Some(options);
        self
    }
}
