//! Metric aggregations: their SQL columns and their response shapes.

use super::values::{
    as_count, as_f64, date_string, first_element, number, optional_number,
    percent_label, to_millis,
};
use crate::{
    expr::{Direction, Expr},
    time::{self, CalendarUnit, Interval},
};
use serde_json::{json, Map, Value};

/// Default `percents` of a `percentiles` aggregation.
pub const DEFAULT_PERCENTS: [f64; 7] = [1.0, 5.0, 25.0, 50.0, 75.0, 95.0, 99.0];

/// Quantile levels are capped just below 1.
pub const MAX_QUANTILE: f64 = 0.999999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleValue {
    Sum,
    Min,
    Max,
    Avg,
}

impl SingleValue {
    fn function(self) -> &'static str {
        match self {
            SingleValue::Sum => "sumOrNull",
            SingleValue::Min => "minOrNull",
            SingleValue::Max => "maxOrNull",
            SingleValue::Avg => "avgOrNull",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopHits {
    pub size: usize,
    /// `_source` field names, one column each.
    pub fields: Vec<String>,
    pub sort: Vec<(Expr, Direction)>,
    pub index: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopMetrics {
    pub size: usize,
    pub metrics: Vec<String>,
    pub sort: Option<(Expr, Direction)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl RateUnit {
    pub fn parse(raw: &str) -> Option<Self> {
        let unit = match raw {
            "second" => RateUnit::Second,
            "minute" => RateUnit::Minute,
            "hour" => RateUnit::Hour,
            "day" => RateUnit::Day,
            "week" => RateUnit::Week,
            "month" => RateUnit::Month,
            "quarter" => RateUnit::Quarter,
            "year" => RateUnit::Year,
            _ => return None,
        };
        Some(unit)
    }

    fn nominal_ms(self) -> i64 {
        match self {
            RateUnit::Second => time::SECOND_MS,
            RateUnit::Minute => time::MINUTE_MS,
            RateUnit::Hour => time::HOUR_MS,
            RateUnit::Day => time::DAY_MS,
            RateUnit::Week => CalendarUnit::Week.nominal_ms(),
            RateUnit::Month => CalendarUnit::Month.nominal_ms(),
            RateUnit::Quarter => CalendarUnit::Quarter.nominal_ms(),
            RateUnit::Year => CalendarUnit::Year.nominal_ms(),
        }
    }

    fn months(self) -> Option<u32> {
        match self {
            RateUnit::Month => Some(1),
            RateUnit::Quarter => Some(3),
            RateUnit::Year => Some(12),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateMode {
    Sum,
    ValueCount,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rate {
    pub unit: RateUnit,
    pub mode: RateMode,
    pub has_field: bool,
    /// Interval of the enclosing `date_histogram`.
    pub interval: Option<Interval>,
}

impl Rate {
    /// Converts a per-bucket total into a per-`unit` rate.
    pub fn scale(&self, total: f64, bucket_key_ms: Option<i64>) -> Option<f64> {
        match self.interval? {
            Interval::Fixed { ms } => Some(total * self.unit.nominal_ms() as f64 / ms as f64),
            Interval::Calendar(bucket_unit) => {
                let bucket_months = match bucket_unit {
                    CalendarUnit::Month => Some(1),
                    CalendarUnit::Quarter => Some(3),
                    CalendarUnit::Year => Some(12),
                    CalendarUnit::Week => None,
                };
                if let (Some(unit_months), Some(bucket_months)) = (self.unit.months(), bucket_months)
                {
                    return Some(total * f64::from(unit_months) / f64::from(bucket_months));
                }
                // Months differ in length, so use the actual bucket.
                let bucket_ms = bucket_key_ms
                    .and_then(time::from_millis)
                    .map(|start| {
                        (bucket_unit.advance(start) - start).num_milliseconds()
                    })
                    .filter(|ms| *ms > 0)
                    .unwrap_or_else(|| bucket_unit.nominal_ms());
                Some(total * self.unit.nominal_ms() as f64 / bucket_ms as f64)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    SingleValue { op: SingleValue, date: bool },
    ValueCount,
    Cardinality,
    Stats,
    ExtendedStats { sigma: f64 },
    Percentiles { percents: Vec<f64>, keyed: bool },
    PercentileRanks { values: Vec<f64>, keyed: bool },
    GeoCentroid,
    TopHits(TopHits),
    TopMetrics(TopMetrics),
    Rate(Rate),
    /// Hidden document count backing `hits.total`.
    TotalHits,
}

/// Context of the bucket a metric is rendered in.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParentBucket {
    pub key_ms: Option<i64>,
    pub doc_count: Option<u64>,
}

/// Values of a metric's columns for one bucket.
#[derive(Debug, Clone, Copy)]
pub struct MetricInput<'a> {
    /// First row, one value per selected column.
    pub values: &'a [Value],
    /// Every row of the bucket; only hit-returning metrics use more than one.
    pub rows: &'a [Vec<Value>],
    pub parent: ParentBucket,
}

impl MetricKind {
    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::SingleValue { op, .. } => match op {
                SingleValue::Sum => "sum",
                SingleValue::Min => "min",
                SingleValue::Max => "max",
                SingleValue::Avg => "avg",
            },
            MetricKind::ValueCount => "value_count",
            MetricKind::Cardinality => "cardinality",
            MetricKind::Stats => "stats",
            MetricKind::ExtendedStats { .. } => "extended_stats",
            MetricKind::Percentiles { .. } => "percentiles",
            MetricKind::PercentileRanks { .. } => "percentile_ranks",
            MetricKind::GeoCentroid => "geo_centroid",
            MetricKind::TopHits(_) => "top_hits",
            MetricKind::TopMetrics(_) => "top_metrics",
            MetricKind::Rate(_) => "rate",
            MetricKind::TotalHits => "total_hits",
        }
    }

    /// Metrics answered from per-document rows instead of aggregates.
    pub fn returns_hits(&self) -> bool {
        matches!(self, MetricKind::TopHits(_) | MetricKind::TopMetrics(_))
    }

    /// Number of values the metric selects per row.
    pub fn render(&self, input: &MetricInput<'_>) -> Value {
        let value = |idx: usize| input.values.get(idx).unwrap_or(&Value::Null);
        let float = |idx: usize| as_f64(value(idx));

        match self {
            MetricKind::SingleValue { op, date } => {
                if *date && matches!(op, SingleValue::Min | SingleValue::Max) {
                    return match to_millis(value(0)) {
                        Some(ms) => json!({
                            "value": ms,
                            "value_as_string": date_string(ms),
                        }),
                        None => json!({ "value": null }),
                    };
                }
                let result = match op {
                    SingleValue::Sum => float(0).or(Some(0.0)),
                    _ => float(0),
                };
                json!({ "value": optional_number(result) })
            }
            MetricKind::ValueCount | MetricKind::Cardinality | MetricKind::TotalHits => {
                json!({ "value": as_count(value(0)) })
            }
            MetricKind::Stats => stats(input.values),
            MetricKind::ExtendedStats { sigma } => extended_stats(input.values, *sigma),
            MetricKind::Percentiles { percents, keyed } => {
                let entries = percents
                    .iter()
                    .enumerate()
                    .map(|(idx, percent)| (*percent, as_f64(first_element(value(idx)))));
                percentile_values(entries, *keyed)
            }
            MetricKind::PercentileRanks { values, keyed } => {
                let entries = values
                    .iter()
                    .enumerate()
                    .map(|(idx, threshold)| (*threshold, float(idx)));
                percentile_values(entries, *keyed)
            }
            MetricKind::GeoCentroid => {
                let count = as_count(value(2));
                if count == 0 {
                    return json!({ "count": 0 });
                }
                json!({
                    "location": {
                        "lat": optional_number(float(0)),
                        "lon": optional_number(float(1)),
                    },
                    "count": count,
                })
            }
            MetricKind::TopHits(top_hits) => top_hits.render(input.rows),
            MetricKind::TopMetrics(top_metrics) => top_metrics.render(input.rows),
            MetricKind::Rate(rate) => {
                let total = if rate.has_field {
                    float(0).or(Some(0.0))
                } else {
                    input.parent.doc_count.map(|count| count as f64)
                };
                let scaled = total.and_then(|total| rate.scale(total, input.parent.key_ms));
                json!({ "value": optional_number(scaled) })
            }
        }
    }
}

/// SQL columns of a single-field metric.
pub fn field_columns(kind: &MetricKind, field: &Expr) -> Vec<Expr> {
    let call = |name: &str| Expr::function(name, vec![field.clone()]);
    match kind {
        MetricKind::SingleValue { op, .. } => vec![call(op.function())],
        MetricKind::ValueCount => vec![call("count")],
        MetricKind::Cardinality => vec![call("uniq")],
        MetricKind::Stats => stats_columns(field),
        MetricKind::ExtendedStats { .. } => {
            let mut columns = stats_columns(field);
            columns.push(Expr::function(
                "sumOrNull",
                vec![Expr::infix(field.clone(), "*", field.clone())],
            ));
            for name in ["varPop", "varSamp", "stddevPop", "stddevSamp"] {
                columns.push(call(name));
            }
            columns
        }
        MetricKind::Percentiles { percents, .. } => percents
            .iter()
            .map(|percent| {
                Expr::multi_function(
                    "quantiles",
                    vec![Expr::float((percent / 100.0).min(MAX_QUANTILE))],
                    vec![field.clone()],
                )
            })
            .collect(),
        MetricKind::PercentileRanks { values, .. } => values
            .iter()
            .map(|threshold| {
                let below = Expr::function(
                    "if",
                    vec![
                        Expr::infix(field.clone(), "<=", Expr::float(*threshold)),
                        Expr::int(1),
                        Expr::null(),
                    ],
                );
                Expr::infix(
                    Expr::infix(
                        Expr::function("count", vec![below]),
                        "/",
                        Expr::count_all(),
                    ),
                    "*",
                    Expr::int(100),
                )
            })
            .collect(),
        MetricKind::GeoCentroid => {
            let name = field
                .as_column()
                .map(|col| col.name.clone())
                .unwrap_or_else(|| field.to_sql());
            let coordinate = |suffix: &str| {
                Expr::function(
                    "avgOrNull",
                    vec![Expr::function(
                        "CAST",
                        vec![Expr::column(format!("{name}::{suffix}")), Expr::string("Float64")],
                    )],
                )
            };
            vec![coordinate("lat"), coordinate("lon"), Expr::count_rows()]
        }
        MetricKind::Rate(rate) => match rate.mode {
            RateMode::Sum => vec![call("sumOrNull")],
            RateMode::ValueCount => vec![call("count")],
        },
        MetricKind::TotalHits => vec![Expr::count_all()],
        MetricKind::TopHits(_) | MetricKind::TopMetrics(_) => Vec::new(),
    }
}

fn stats_columns(field: &Expr) -> Vec<Expr> {
    ["count", "minOrNull", "maxOrNull", "avgOrNull", "sumOrNull"]
        .into_iter()
        .map(|name| Expr::function(name, vec![field.clone()]))
        .collect()
}

fn stats(values: &[Value]) -> Value {
    Value::Object(stats_map(values))
}

fn stats_map(values: &[Value]) -> Map<String, Value> {
    let float = |idx: usize| values.get(idx).and_then(as_f64);
    let count = values.first().map(as_count).unwrap_or(0);
    let mut map = Map::new();
    map.insert("count".into(), count.into());
    if count == 0 {
        for key in ["min", "max", "avg"] {
            map.insert(key.into(), Value::Null);
        }
        map.insert("sum".into(), number(0.0));
    } else {
        map.insert("min".into(), optional_number(float(1)));
        map.insert("max".into(), optional_number(float(2)));
        map.insert("avg".into(), optional_number(float(3)));
        map.insert("sum".into(), optional_number(float(4)));
    }
    map
}

fn extended_stats(values: &[Value], sigma: f64) -> Value {
    let float = |idx: usize| values.get(idx).and_then(as_f64);
    let mut map = stats_map(values);
    let count = values.first().map(as_count).unwrap_or(0);

    if count == 0 {
        map.insert("sum_of_squares".into(), Value::Null);
        for key in [
            "variance",
            "variance_population",
            "variance_sampling",
            "std_deviation",
            "std_deviation_population",
            "std_deviation_sampling",
        ] {
            map.insert(key.into(), Value::Null);
        }
        map.insert(
            "std_deviation_bounds".into(),
            json!({
                "upper": null, "lower": null,
                "upper_population": null, "lower_population": null,
                "upper_sampling": null, "lower_sampling": null,
            }),
        );
        return Value::Object(map);
    }

    let avg = float(3);
    let std_population = float(8);
    let std_sampling = float(9);
    let bound = |std: Option<f64>, sign: f64| match (avg, std) {
        (Some(avg), Some(std)) => number(avg + sign * sigma * std),
        _ => Value::Null,
    };

    map.insert("sum_of_squares".into(), optional_number(float(5)));
    map.insert("variance".into(), optional_number(float(6)));
    map.insert("variance_population".into(), optional_number(float(6)));
    map.insert("variance_sampling".into(), optional_number(float(7)));
    map.insert("std_deviation".into(), optional_number(std_population));
    map.insert("std_deviation_population".into(), optional_number(std_population));
    map.insert("std_deviation_sampling".into(), optional_number(std_sampling));
    map.insert(
        "std_deviation_bounds".into(),
        json!({
            "upper": bound(std_population, 1.0),
            "lower": bound(std_population, -1.0),
            "upper_population": bound(std_population, 1.0),
            "lower_population": bound(std_population, -1.0),
            "upper_sampling": bound(std_sampling, 1.0),
            "lower_sampling": bound(std_sampling, -1.0),
        }),
    );
    Value::Object(map)
}

fn percentile_values(entries: impl Iterator<Item = (f64, Option<f64>)>, keyed: bool) -> Value {
    if keyed {
        let values: Map<String, Value> = entries
            .map(|(percent, value)| (percent_label(percent), optional_number(value)))
            .collect();
        json!({ "values": values })
    } else {
        let values: Vec<Value> = entries
            .map(|(percent, value)| json!({ "key": percent, "value": optional_number(value) }))
            .collect();
        json!({ "values": values })
    }
}

impl TopHits {
    /// Columns fetched per hit: the `_source` fields, then the sort values.
    pub fn columns(&self, resolve: impl Fn(&str) -> Expr) -> Vec<Expr> {
        self.fields
            .iter()
            .map(|field| resolve(field))
            .chain(self.sort.iter().map(|(expr, _)| expr.clone()))
            .collect()
    }

    fn render(&self, rows: &[Vec<Value>]) -> Value {
        let hits: Vec<Value> = rows
            .iter()
            .filter(|row| row.iter().any(|value| !value.is_null()))
            .take(self.size)
            .map(|row| {
                let source: Map<String, Value> = self
                    .fields
                    .iter()
                    .zip(row.iter())
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect();
                let mut hit = json!({
                    "_index": self.index,
                    "_id": "",
                    "_score": 1.0,
                    "_source": source,
                });
                if !self.sort.is_empty() {
                    let sort: Vec<Value> = row.iter().skip(self.fields.len()).cloned().collect();
                    hit["sort"] = Value::Array(sort);
                    hit["_score"] = Value::Null;
                }
                hit
            })
            .collect();

        json!({
            "hits": {
                "total": { "value": hits.len(), "relation": "eq" },
                "max_score": if self.sort.is_empty() { json!(1.0) } else { Value::Null },
                "hits": hits,
            }
        })
    }
}

impl TopMetrics {
    pub fn columns(&self, resolve: impl Fn(&str) -> Expr) -> Vec<Expr> {
        self.metrics
            .iter()
            .map(|metric| resolve(metric))
            .chain(self.sort.iter().map(|(expr, _)| expr.clone()))
            .collect()
    }

    fn render(&self, rows: &[Vec<Value>]) -> Value {
        let top: Vec<Value> = rows
            .iter()
            .filter(|row| row.iter().any(|value| !value.is_null()))
            .take(self.size)
            .map(|row| {
                let metrics: Map<String, Value> = self
                    .metrics
                    .iter()
                    .zip(row.iter())
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                let sort: Vec<Value> = row.iter().skip(self.metrics.len()).cloned().collect();
                json!({ "sort": sort, "metrics": metrics })
            })
            .collect();
        json!({ "top": top })
    }
}

/// Single number a pipeline reads from a rendered metric, e.g. `stats.avg`
/// or `load_time_outlier[99]`.
pub fn metric_value(rendered: &Value, property: Option<&str>) -> Option<f64> {
    match property {
        None => rendered.get("value").and_then(as_f64),
        Some(property) => {
            if let Some(direct) = rendered.get(property).and_then(as_f64) {
                return Some(direct);
            }
            match rendered.get("values")? {
                Value::Object(values) => {
                    let wanted = property
                        .parse::<f64>()
                        .map(percent_label)
                        .unwrap_or_else(|_| property.to_string());
                    values.get(&wanted).and_then(as_f64)
                }
                Value::Array(values) => {
                    let wanted = property.parse::<f64>().ok()?;
                    values
                        .iter()
                        .find(|entry| entry.get("key").and_then(as_f64) == Some(wanted))
                        .and_then(|entry| entry.get("value"))
                        .and_then(as_f64)
                }
                _ => None,
            }
        }
    }
}
