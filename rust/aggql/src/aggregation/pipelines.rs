//! Pipeline aggregations: computed from already-rendered buckets, never from
//! SQL.

use super::values::{float_label, number, optional_number};
use serde_json::{json, Value};

pub const DEFAULT_MOVING_AVG_WINDOW: usize = 5;
pub const DEFAULT_SERIAL_DIFF_LAG: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOp {
    Derivative,
    CumulativeSum,
    MovingAvg { window: usize },
    SerialDiff { lag: usize },
    /// Only the `_value` pass-through of `_count`.
    BucketScript,
    AvgBucket,
    SumBucket,
    MinBucket,
    MaxBucket,
    StatsBucket,
}

/// `buckets_path` split into aggregation segments and an optional metric
/// property: `histo>stats.avg` is `["histo", "stats"]` plus `avg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketsPath {
    pub raw: String,
    pub segments: Vec<String>,
    pub property: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineKind {
    pub op: PipelineOp,
    pub buckets_path: BucketsPath,
}

impl PipelineOp {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineOp::Derivative => "derivative",
            PipelineOp::CumulativeSum => "cumulative_sum",
            PipelineOp::MovingAvg { .. } => "moving_avg",
            PipelineOp::SerialDiff { .. } => "serial_diff",
            PipelineOp::BucketScript => "bucket_script",
            PipelineOp::AvgBucket => "avg_bucket",
            PipelineOp::SumBucket => "sum_bucket",
            PipelineOp::MinBucket => "min_bucket",
            PipelineOp::MaxBucket => "max_bucket",
            PipelineOp::StatsBucket => "stats_bucket",
        }
    }

    /// Parent pipelines add a value to every bucket of the enclosing
    /// histogram; sibling pipelines summarise a sibling's buckets.
    pub fn is_parent(&self) -> bool {
        matches!(
            self,
            PipelineOp::Derivative
                | PipelineOp::CumulativeSum
                | PipelineOp::MovingAvg { .. }
                | PipelineOp::SerialDiff { .. }
                | PipelineOp::BucketScript
        )
    }

    /// One output per input bucket; `None` leaves the bucket without a value.
    pub fn apply_parent(&self, inputs: &[Option<f64>]) -> Vec<Option<Value>> {
        let value = |result: Option<f64>| Some(json!({ "value": optional_number(result) }));
        match self {
            PipelineOp::Derivative => lagged(inputs, 1, value),
            PipelineOp::SerialDiff { lag } => lagged(inputs, *lag, value),
            PipelineOp::CumulativeSum => {
                let mut total = 0.0;
                inputs
                    .iter()
                    .map(|input| {
                        total += input.unwrap_or(0.0);
                        value(Some(total))
                    })
                    .collect()
            }
            PipelineOp::MovingAvg { window } => (0..inputs.len())
                .map(|idx| {
                    let from = idx.saturating_sub(*window);
                    let previous: Vec<f64> = inputs[from..idx].iter().flatten().copied().collect();
                    if previous.is_empty() {
                        return None;
                    }
                    value(Some(previous.iter().sum::<f64>() / previous.len() as f64))
                })
                .collect(),
            PipelineOp::BucketScript => inputs.iter().map(|input| value(*input)).collect(),
            _ => vec![None; inputs.len()],
        }
    }

    /// Summary over `(bucket label, value)` pairs.
    pub fn apply_sibling(&self, inputs: &[(String, Option<f64>)]) -> Value {
        let present: Vec<(&str, f64)> = inputs
            .iter()
            .filter_map(|(label, value)| value.map(|value| (label.as_str(), value)))
            .collect();
        let sum: f64 = present.iter().map(|(_, value)| value).sum();
        let avg = (!present.is_empty()).then(|| sum / present.len() as f64);
        let min = present.iter().map(|(_, value)| *value).reduce(f64::min);
        let max = present.iter().map(|(_, value)| *value).reduce(f64::max);

        match self {
            PipelineOp::AvgBucket => json!({ "value": optional_number(avg) }),
            PipelineOp::SumBucket => json!({ "value": number(sum) }),
            PipelineOp::MinBucket | PipelineOp::MaxBucket => {
                let extreme = if matches!(self, PipelineOp::MinBucket) {
                    min
                } else {
                    max
                };
                let keys: Vec<&str> = match extreme {
                    Some(extreme) => present
                        .iter()
                        .filter(|(_, value)| *value == extreme)
                        .map(|(label, _)| *label)
                        .collect(),
                    None => Vec::new(),
                };
                json!({ "value": optional_number(extreme), "keys": keys })
            }
            PipelineOp::StatsBucket => json!({
                "count": present.len(),
                "min": optional_number(min),
                "max": optional_number(max),
                "avg": optional_number(avg),
                "sum": number(sum),
            }),
            _ => Value::Null,
        }
    }
}

fn lagged(
    inputs: &[Option<f64>],
    lag: usize,
    value: impl Fn(Option<f64>) -> Option<Value>,
) -> Vec<Option<Value>> {
    (0..inputs.len())
        .map(|idx| {
            if lag == 0 || idx < lag {
                return None;
            }
            match (inputs[idx], inputs[idx - lag]) {
                (Some(current), Some(previous)) => value(Some(current - previous)),
                _ => value(None),
            }
        })
        .collect()
}

impl PipelineKind {
    pub fn name(&self) -> &'static str {
        self.op.name()
    }
}

impl BucketsPath {
    pub fn parse(raw: &str) -> Self {
        let mut segments: Vec<String> = raw.split('>').map(|part| part.trim().to_string()).collect();
        let mut property = None;
        if let Some(last) = segments.last_mut() {
            if let Some((name, rest)) = last.split_once('[') {
                property = Some(rest.trim_end_matches(']').to_string());
                *last = name.to_string();
            } else if !last.starts_with('_') {
                if let Some((name, rest)) = last.split_once('.') {
                    property = Some(rest.to_string());
                    *last = name.to_string();
                }
            }
        }
        Self {
            raw: raw.to_string(),
            segments,
            property,
        }
    }

    /// The aggregation this path reads first; a dependency for ordering.
    pub fn head(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or("")
    }

    /// Normalised percentile property (`99` reads the `99.0` entry).
    pub fn percentile_property(&self) -> Option<String> {
        let property = self.property.as_deref()?;
        property.parse::<f64>().ok().map(float_label)
    }
}
