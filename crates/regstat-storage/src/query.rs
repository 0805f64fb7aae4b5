//! Query compiler: `FilterSpec` → predicate tree → one aggregation statement.
//!
//! Every user-supplied value is resolved to a dictionary id before lowering,
//! and ids travel as bound parameters. Only identifiers from closed enums are
//! spliced into the SQL text.

use crate::dictionary::{lookup, normalize_value, NO_SCOPE};
use crate::regularization::{self, RegularizedAttribute};
use crate::schema;
use crate::storage::{years_for, Result, Storage, StorageError};
use regstat_model::{
    CoverageField, DataKind, Dimension, FilterSpec, Measure, Metric, RoadWearMode, TimeSeries,
};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::BTreeSet;

/// Column reference usable in a predicate or aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Column {
    Dimension(Dimension),
    Measure(Measure),
}

impl Column {
    fn sql(self) -> String {
        match self {
            Column::Dimension(dim) => format!("f.{}", dim.fact_column()),
            Column::Measure(measure) => measure_sql(measure).to_string(),
        }
    }
}

fn measure_sql(measure: Measure) -> &'static str {
    match measure {
        Measure::NetMass => "f.net_mass",
        Measure::Displacement => "f.displacement",
        Measure::AxleCount => "f.axle_count",
        Measure::ModelYear => "f.model_year",
        Measure::Age => "(CAST(y.value AS INTEGER) - f.model_year)",
    }
}

/// Row-exact regularization test against the mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RegularizationMatch {
    pub attribute: RegularizedAttribute,
    pub targets: Vec<i64>,
    pub coupled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Predicate {
    In(Column, Vec<i64>),
    IsNull(Column),
    Range {
        column: Column,
        min: Option<i64>,
        max: Option<i64>,
    },
    Exists(RegularizationMatch),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// Matches nothing.
    Never,
}

fn slots(params: &mut Vec<Value>, ids: &[i64]) -> String {
    params.extend(ids.iter().map(|id| Value::Integer(*id)));
    vec!["?"; ids.len()].join(", ")
}

impl Predicate {
    fn in_or_never(column: Column, ids: impl IntoIterator<Item = i64>) -> Predicate {
        let ids: Vec<i64> = ids.into_iter().collect();
        if ids.is_empty() {
            Predicate::Never
        } else {
            Predicate::In(column, ids)
        }
    }

    /// Append bound values to `params` and return the SQL text.
    pub(crate) fn lower(&self, params: &mut Vec<Value>) -> String {
        match self {
            Predicate::In(_, ids) if ids.is_empty() => "0".to_string(),
            Predicate::In(column, ids) => format!("{} IN ({})", column.sql(), slots(params, ids)),
            Predicate::IsNull(column) => format!("{} IS NULL", column.sql()),
            Predicate::Range { column, min, max } => {
                let col = column.sql();
                let mut parts = Vec::new();
                if let Some(min) = min {
                    params.push(Value::Integer(*min));
                    parts.push(format!("{col} >= ?"));
                }
                if let Some(max) = max {
                    params.push(Value::Integer(*max));
                    parts.push(format!("{col} <= ?"));
                }
                if parts.is_empty() {
                    "1".to_string()
                } else {
                    format!("({})", parts.join(" AND "))
                }
            }
            Predicate::Exists(m) => lower_exists(m, params),
            Predicate::And(children) => lower_joined(children, " AND ", "1", params),
            Predicate::Or(children) => lower_joined(children, " OR ", "0", params),
            Predicate::Never => "0".to_string(),
        }
    }
}

fn lower_joined(children: &[Predicate], sep: &str, empty: &str, params: &mut Vec<Value>) -> String {
    match children {
        [] => empty.to_string(),
        [only] => only.lower(params),
        _ => {
            let parts: Vec<String> = children.iter().map(|c| c.lower(params)).collect();
            format!("({})", parts.join(sep))
        }
    }
}

fn lower_exists(m: &RegularizationMatch, params: &mut Vec<Value>) -> String {
    if m.targets.is_empty() {
        return "0".to_string();
    }
    let year_match = if m.attribute.matches_model_year() {
        " AND r.model_year_id = f.model_year_id"
    } else {
        " AND r.model_year_id IS NULL"
    };
    let column = m.attribute.mapping_column();
    if m.coupled {
        format!(
            "EXISTS (SELECT 1 FROM regularization r WHERE r.uncurated_make_id = f.make_id AND r.uncurated_model_id = f.model_id AND r.{column} IN ({}){year_match})",
            slots(params, &m.targets)
        )
    } else {
        let make = format!(
            "EXISTS (SELECT 1 FROM regularization r WHERE r.uncurated_make_id = f.make_id AND r.{column} IN ({}){year_match})",
            slots(params, &m.targets)
        );
        let model = format!(
            "EXISTS (SELECT 1 FROM regularization r WHERE r.uncurated_model_id = f.model_id AND r.{column} IN ({}){year_match})",
            slots(params, &m.targets)
        );
        format!("({make} AND {model})")
    }
}

fn query_failed(err: rusqlite::Error) -> StorageError {
    StorageError::QueryFailed(err.to_string())
}

fn check_measure(kind: DataKind, measure: Measure) -> Result<()> {
    if measure.applies_to(kind) {
        Ok(())
    } else {
        Err(StorageError::QueryFailed(format!(
            "measure {measure:?} is not available for {kind} data"
        )))
    }
}

fn resolve_values(
    conn: &Connection,
    dimension: Dimension,
    values: &BTreeSet<String>,
) -> Result<BTreeSet<i64>> {
    let mut ids = BTreeSet::new();
    for raw in values {
        let (value, _) = normalize_value(dimension, raw);
        match lookup(conn, dimension, NO_SCOPE, &value).map_err(query_failed)? {
            Some(id) => {
                ids.insert(id);
            }
            None => log::warn!("ignoring unknown {dimension} value {raw:?}"),
        }
    }
    Ok(ids)
}

fn resolve_year_ids(conn: &Connection, years: impl IntoIterator<Item = i32>) -> Result<BTreeSet<i64>> {
    let mut ids = BTreeSet::new();
    for year in years {
        if let Some(id) = lookup(conn, Dimension::Year, NO_SCOPE, &year.to_string()).map_err(query_failed)? {
            ids.insert(id);
        }
    }
    Ok(ids)
}

/// Build the row predicate of `spec`.
pub(crate) fn compile_predicate(conn: &Connection, spec: &FilterSpec) -> Result<Predicate> {
    let kind = spec.data_kind;
    let mut clauses = Vec::new();

    if !spec.years.is_empty() {
        let ids = resolve_year_ids(conn, spec.years.iter().copied())?;
        clauses.push(Predicate::in_or_never(Column::Dimension(Dimension::Year), ids));
    }

    let mut make_ids = BTreeSet::new();
    let mut deferred = Vec::new();
    for (&dimension, values) in &spec.selections {
        if values.is_empty() {
            continue;
        }
        if !dimension.applies_to(kind) {
            return Err(StorageError::QueryFailed(format!(
                "{dimension} does not apply to {kind} data"
            )));
        }
        if dimension.is_scoped() {
            return Err(StorageError::QueryFailed(
                "models are selected as (make, model) pairs".to_string(),
            ));
        }
        let ids = resolve_values(conn, dimension, values)?;
        if dimension == Dimension::Make {
            make_ids = ids.clone();
        }
        match RegularizedAttribute::for_dimension(dimension) {
            Some(attribute) => deferred.push((attribute, ids)),
            None => clauses.push(Predicate::in_or_never(Column::Dimension(dimension), ids)),
        }
    }

    let mut model_ids = BTreeSet::new();
    if !spec.models.is_empty() {
        if kind != DataKind::Vehicle {
            return Err(StorageError::QueryFailed(format!(
                "model does not apply to {kind} data"
            )));
        }
        for selection in &spec.models {
            let make = lookup(conn, Dimension::Make, NO_SCOPE, selection.make.trim()).map_err(query_failed)?;
            let model = match make {
                Some(make_id) => {
                    lookup(conn, Dimension::Model, make_id, selection.model.trim()).map_err(query_failed)?
                }
                None => None,
            };
            match model {
                Some(id) => {
                    model_ids.insert(id);
                }
                None => log::warn!(
                    "ignoring unknown model {:?} of make {:?}",
                    selection.model,
                    selection.make
                ),
            }
        }
        clauses.push(Predicate::in_or_never(
            Column::Dimension(Dimension::Model),
            model_ids.iter().copied(),
        ));
    }

    if !spec.age_ranges.is_empty() {
        check_measure(kind, Measure::Age)?;
        let ranges = spec
            .age_ranges
            .iter()
            .map(|r| Predicate::Range {
                column: Column::Measure(Measure::Age),
                min: r.min.map(i64::from),
                max: r.max.map(i64::from),
            })
            .collect();
        clauses.push(Predicate::Or(ranges));
    }

    for (attribute, targets) in deferred {
        clauses.push(regularized_clause(conn, spec, attribute, &targets, &make_ids, &model_ids)?);
    }

    Ok(Predicate::And(clauses))
}

/// `attribute IN targets`, plus a null-tolerant branch for uncurated years
/// when the filter enables regularization.
fn regularized_clause(
    conn: &Connection,
    spec: &FilterSpec,
    attribute: RegularizedAttribute,
    targets: &BTreeSet<i64>,
    make_ids: &BTreeSet<i64>,
    model_ids: &BTreeSet<i64>,
) -> Result<Predicate> {
    let column = Column::Dimension(attribute.dimension());
    let direct = Predicate::in_or_never(column, targets.iter().copied());
    let Some(options) = &spec.regularization else {
        return Ok(direct);
    };
    if targets.is_empty() || options.curated_years.is_empty() {
        return Ok(direct);
    }

    let queried: Vec<i32> = if spec.years.is_empty() {
        years_for(conn, spec.data_kind).map_err(query_failed)?
    } else {
        spec.years.iter().copied().collect()
    };
    let uncurated = resolve_year_ids(conn, queried.into_iter().filter(|y| !options.is_curated(*y)))?;
    if uncurated.is_empty() {
        return Ok(direct);
    }

    let expansion = regularization::expand(conn, attribute, targets, make_ids, model_ids, options.coupling)
        .map_err(query_failed)?;
    if expansion.is_empty() {
        return Ok(direct);
    }
    log::debug!(
        "regularizing {} over {} uncurated years with {} makes and {} models",
        attribute.dimension(),
        uncurated.len(),
        expansion.make_ids.len(),
        expansion.model_ids.len()
    );

    Ok(Predicate::Or(vec![
        direct,
        Predicate::And(vec![
            Predicate::IsNull(column),
            Predicate::In(Column::Dimension(Dimension::Year), uncurated.into_iter().collect()),
            Predicate::In(Column::Dimension(Dimension::Make), expansion.make_ids.into_iter().collect()),
            Predicate::In(Column::Dimension(Dimension::Model), expansion.model_ids.into_iter().collect()),
            Predicate::Exists(RegularizationMatch {
                attribute,
                targets: targets.iter().copied().collect(),
                coupled: options.coupling,
            }),
        ]),
    ]))
}

/// Fourth-power road wear weight: `net_mass^4 * k(axles)`.
const ROAD_WEAR_WEIGHT: &str = "(CAST(f.net_mass AS REAL) * f.net_mass * f.net_mass * f.net_mass * CASE \
     WHEN f.axle_count IS NULL OR f.axle_count <= 2 THEN 0.1325 \
     WHEN f.axle_count = 3 THEN 0.0381 \
     WHEN f.axle_count = 4 THEN 0.0156 \
     WHEN f.axle_count = 5 THEN 0.0080 \
     ELSE 1.0 / (CAST(f.axle_count AS REAL) * f.axle_count * f.axle_count) END)";

fn aggregate_expr(kind: DataKind, metric: &Metric) -> Result<String> {
    let expr = match metric {
        Metric::Count | Metric::Percentage { .. } => "COUNT(*)".to_string(),
        Metric::Sum { measure } => {
            check_measure(kind, *measure)?;
            format!("SUM({})", measure_sql(*measure))
        }
        Metric::Average { measure } => {
            check_measure(kind, *measure)?;
            format!("AVG({})", measure_sql(*measure))
        }
        Metric::Min { measure } => {
            check_measure(kind, *measure)?;
            format!("MIN({})", measure_sql(*measure))
        }
        Metric::Max { measure } => {
            check_measure(kind, *measure)?;
            format!("MAX({})", measure_sql(*measure))
        }
        Metric::Coverage {
            field,
            as_percentage,
        } => {
            let column = match field {
                CoverageField::Dimension(dim) => {
                    if !dim.applies_to(kind) {
                        return Err(StorageError::QueryFailed(format!(
                            "{dim} does not apply to {kind} data"
                        )));
                    }
                    Column::Dimension(*dim).sql()
                }
                CoverageField::Measure(measure) => {
                    check_measure(kind, *measure)?;
                    measure_sql(*measure).to_string()
                }
            };
            if *as_percentage {
                format!("COUNT({column}) * 100.0 / COUNT(*)")
            } else {
                format!("COUNT(*) - COUNT({column})")
            }
        }
        Metric::RoadWearIndex { mode } => {
            if kind != DataKind::Vehicle {
                return Err(StorageError::QueryFailed(format!(
                    "road wear index is not available for {kind} data"
                )));
            }
            match mode {
                RoadWearMode::Sum => format!("SUM({ROAD_WEAR_WEIGHT})"),
                RoadWearMode::Average => format!("AVG({ROAD_WEAR_WEIGHT})"),
            }
        }
        Metric::Median { .. } => unreachable!("median is compiled separately"),
    };
    Ok(expr)
}

fn aggregation_sql(spec: &FilterSpec, metric: &Metric, filter: &str) -> Result<String> {
    let table = schema::fact_table(spec.data_kind);
    if let Metric::Median { measure } = metric {
        check_measure(spec.data_kind, *measure)?;
        let value = measure_sql(*measure);
        return Ok(format!(
            r#"
            WITH m AS (
              SELECT f.year_id AS year_id, {value} AS v
              FROM {table} f JOIN dim_year y ON y.id = f.year_id
              WHERE {filter} AND {value} IS NOT NULL
            ),
            ranked AS (
              SELECT year_id, v,
                     ROW_NUMBER() OVER (PARTITION BY year_id ORDER BY v) AS rn,
                     COUNT(*) OVER (PARTITION BY year_id) AS cnt
              FROM m
            )
            SELECT CAST(y.value AS INTEGER) AS year, AVG(ranked.v) AS value
            FROM ranked JOIN dim_year y ON y.id = ranked.year_id
            WHERE ranked.rn IN ((ranked.cnt + 1) / 2, (ranked.cnt + 2) / 2)
            GROUP BY ranked.year_id
            ORDER BY year
            "#
        ));
    }

    let expr = aggregate_expr(spec.data_kind, metric)?;
    Ok(format!(
        r#"
        SELECT CAST(y.value AS INTEGER) AS year, {expr} AS value
        FROM {table} f JOIN dim_year y ON y.id = f.year_id
        WHERE {filter}
        GROUP BY f.year_id
        ORDER BY year
        "#
    ))
}

/// Per-year values of `metric` over the rows selected by `spec`.
///
/// Years whose aggregate is null (no non-null measure) are left out.
fn aggregate(conn: &Connection, spec: &FilterSpec, metric: &Metric) -> Result<TimeSeries> {
    let predicate = compile_predicate(conn, spec)?;
    let mut params = Vec::new();
    let filter = predicate.lower(&mut params);
    let sql = aggregation_sql(spec, metric, &filter)?;

    let mut stmt = conn.prepare(&sql).map_err(query_failed)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |r| {
            Ok((r.get::<_, i32>(0)?, r.get::<_, Option<f64>>(1)?))
        })
        .map_err(query_failed)?;
    let mut points = Vec::new();
    for row in rows {
        let (year, value) = row.map_err(query_failed)?;
        if let Some(value) = value.filter(|v| v.is_finite()) {
            points.push((year, value));
        }
    }
    Ok(TimeSeries::new(points))
}

/// `numerator / baseline * 100` over the union of both series' years.
fn percentage(numerator: &TimeSeries, baseline: &TimeSeries) -> TimeSeries {
    let years: BTreeSet<i32> = numerator
        .years()
        .into_iter()
        .chain(baseline.years())
        .collect();
    years
        .into_iter()
        .map(|year| {
            let num = numerator.value_for(year).unwrap_or(0.0);
            let base = baseline.value_for(year).unwrap_or(0.0);
            let value = if base > 0.0 { num / base * 100.0 } else { 0.0 };
            (year, value)
        })
        .collect()
}

impl Storage {
    /// Compile and run one time-series query.
    pub fn run_query(&self, spec: &FilterSpec) -> Result<TimeSeries> {
        let conn = self.lock()?;
        let mut series = match &spec.metric {
            Metric::Percentage { baseline } => {
                let numerator = aggregate(&conn, spec, &Metric::Count)?;
                let base = aggregate(&conn, baseline, &Metric::Count)?;
                percentage(&numerator, &base)
            }
            metric => aggregate(&conn, spec, metric)?,
        };
        drop(conn);

        if spec.normalize_to_first_year && !series.normalize_to_first() {
            log::warn!("first value is zero; series left unnormalized");
        }
        if spec.cumulative_sum {
            series.accumulate();
        }
        Ok(series)
    }
}
