//! Parser for the `aggs` section of a search request.
//!
//! Unknown aggregation types and malformed parameters never abort a request:
//! the former drop their subtree, the latter fall back to defaults. Both are
//! logged. Only constructs that would otherwise be silently mistranslated
//! (an unsupported `bucket_script`) are errors here.

use super::{
    buckets::{
        geotile_columns, BucketKind, CompositeSource, CompositeSourceKind, DateHistogram,
        DateRangeInterval, Histogram, IpPrefix, IpRangeInterval, RangeInterval,
    },
    metrics::{
        field_columns, MetricKind, Rate, RateMode, RateUnit, SingleValue, TopHits, TopMetrics,
        DEFAULT_PERCENTS,
    },
    pipelines::{
        BucketsPath, PipelineKind, PipelineOp, DEFAULT_MOVING_AVG_WINDOW, DEFAULT_SERIAL_DIFF_LAG,
    },
    values::as_f64,
    AggregationNode, AggregationTree, QueryType,
};
use crate::{
    error::{Result, ServiceError},
    expr::{
        passes::{timestamp_lower_bound, TimestampLiteralRewriter},
        Direction, Expr, OrderByExpr,
    },
    filter::{self, FilterTranslator},
    schema::{field_column, DateTimeKind, FieldRegistry, FieldType},
    time::{self, Interval, TimeZoneSpec},
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

const METRIC_KEYS: &[&str] = &[
    "sum",
    "min",
    "max",
    "avg",
    "value_count",
    "cardinality",
    "stats",
    "extended_stats",
    "percentiles",
    "percentile_ranks",
    "geo_centroid",
    "top_hits",
    "top_metrics",
    "rate",
];

const PIPELINE_KEYS: &[&str] = &[
    "derivative",
    "cumulative_sum",
    "moving_avg",
    "serial_diff",
    "bucket_script",
    "avg_bucket",
    "sum_bucket",
    "min_bucket",
    "max_bucket",
    "stats_bucket",
];

const BUCKET_KEYS: &[&str] = &[
    "terms",
    "significant_terms",
    "multi_terms",
    "histogram",
    "date_histogram",
    "auto_date_histogram",
    "range",
    "date_range",
    "ip_range",
    "ip_prefix",
    "geotile_grid",
    "composite",
    "filter",
    "filters",
    "sampler",
    "random_sampler",
];

const DEFAULT_TERMS_SIZE: usize = 10;
const DEFAULT_COMPOSITE_SIZE: usize = 10;
const DEFAULT_GEOTILE_SIZE: usize = 10_000;
const DEFAULT_GEOTILE_PRECISION: u32 = 7;
const MAX_GEOTILE_PRECISION: u32 = 29;
const DEFAULT_SHARD_SIZE: usize = 100;
const DEFAULT_AUTO_BUCKETS: usize = 10;
const DEFAULT_DATE_INTERVAL_MS: i64 = 30_000;
const DEFAULT_OTHER_BUCKET_KEY: &str = "_other_";

/// Collaborators and request-independent inputs of the parser.
#[derive(Clone, Copy)]
pub struct ParseContext<'a> {
    pub registry: &'a dyn FieldRegistry,
    pub filters: &'a dyn FilterTranslator,
    /// Anchor for `now`-relative date math.
    pub now: DateTime<Utc>,
    /// Reported as `_index` of returned hits.
    pub index: &'a str,
}

#[derive(Debug, Clone, Copy, Default)]
struct Scope {
    /// Interval of the closest enclosing `date_histogram`.
    interval: Option<Interval>,
}

enum OrderSpec {
    Resolved(OrderByExpr),
    MetricPath(String, Direction),
}

struct BucketSpec {
    kind: BucketKind,
    columns: Vec<Expr>,
    order: Vec<OrderSpec>,
    limit: Option<usize>,
    keyed: bool,
    filter_out_empty_key: bool,
    child_scope: Scope,
}

impl BucketSpec {
    fn new(kind: BucketKind, columns: Vec<Expr>) -> Self {
        Self {
            kind,
            columns,
            order: Vec::new(),
            limit: None,
            keyed: false,
            filter_out_empty_key: false,
            child_scope: Scope::default(),
        }
    }
}

pub struct AggregationParser<'a> {
    ctx: ParseContext<'a>,
    where_clause: Option<Expr>,
}

impl<'a> AggregationParser<'a> {
    pub fn new(ctx: ParseContext<'a>) -> Self {
        Self {
            ctx,
            where_clause: None,
        }
    }

    pub fn parse_request(mut self, body: &Value) -> Result<AggregationTree> {
        let Value::Object(body) = body else {
            return Err(ServiceError::invalid("request body must be a JSON object"));
        };

        let where_clause = match body.get("query") {
            Some(query) => self.ctx.filters.translate(query)?,
            None => None,
        };
        self.where_clause = where_clause.map(|clause| self.type_timestamps(clause));

        for ignored in ["size", "sort", "runtime_mappings", "_source"] {
            if body.contains_key(ignored) {
                debug!(parameter = ignored, "ignoring hits-only request parameter");
            }
        }

        let children = match body.get("aggs").or_else(|| body.get("aggregations")) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(aggs)) => self.parse_children(aggs, Scope::default())?,
            Some(other) => {
                return Err(ServiceError::invalid(format!(
                    "aggs must be an object, got {other}"
                )))
            }
        };

        let track_total_hits = matches!(
            body.get("track_total_hits"),
            Some(Value::Bool(true)) | Some(Value::Number(_))
        );

        Ok(AggregationTree {
            where_clause: self.where_clause,
            children,
            track_total_hits,
        })
    }

    fn parse_children(&self, aggs: &Map<String, Value>, scope: Scope) -> Result<Vec<AggregationNode>> {
        let mut children = Vec::with_capacity(aggs.len());
        for (name, definition) in aggs {
            if let Some(node) = self.parse_node(name, definition, scope)? {
                children.push(node);
            }
        }
        Ok(children)
    }

    fn parse_node(&self, name: &str, definition: &Value, scope: Scope) -> Result<Option<AggregationNode>> {
        let Value::Object(definition) = definition else {
            warn!(aggregation = name, "aggregation definition is not an object, dropping it");
            return Ok(None);
        };

        let sub_aggs = definition
            .get("aggs")
            .or_else(|| definition.get("aggregations"))
            .and_then(Value::as_object);
        let kinds: Vec<(&str, &Value)> = definition
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "aggs" | "aggregations" | "meta"))
            .map(|(key, value)| (key.as_str(), value))
            .collect();
        let pick = |known: &[&str]| kinds.iter().find(|(key, _)| known.contains(key)).copied();

        let mut node = if let Some((key, params)) = pick(METRIC_KEYS) {
            let Some((kind, columns)) = self.metric(name, key, params, scope) else {
                return Ok(None);
            };
            let mut node = AggregationNode::new(name, QueryType::Metric(kind));
            node.selected_columns = columns;
            if let Some(sub_aggs) = sub_aggs {
                node.children = self.parse_children(sub_aggs, scope)?;
            }
            node
        } else if let Some((key, params)) = pick(PIPELINE_KEYS) {
            let Some(kind) = self.pipeline(name, key, params)? else {
                return Ok(None);
            };
            let mut node = AggregationNode::new(name, QueryType::Pipeline(kind));
            if let Some(sub_aggs) = sub_aggs {
                node.children = self.parse_children(sub_aggs, scope)?;
            }
            node
        } else if let Some((key, params)) = pick(BUCKET_KEYS) {
            let Some(spec) = self.bucket(name, key, params)? else {
                return Ok(None);
            };
            let children = match sub_aggs {
                Some(sub_aggs) => self.parse_children(sub_aggs, spec.child_scope)?,
                None => Vec::new(),
            };
            let order_by = resolve_order(name, spec.order, &children);
            let mut node = AggregationNode::new(name, QueryType::Bucket(spec.kind));
            node.selected_columns = spec.columns;
            node.order_by = order_by;
            node.limit = spec.limit;
            node.keyed = spec.keyed;
            node.filter_out_empty_key = spec.filter_out_empty_key;
            node.children = children;
            node
        } else {
            let keys: Vec<&str> = kinds.iter().map(|(key, _)| *key).collect();
            warn!(aggregation = name, ?keys, "unsupported aggregation type, dropping subtree");
            return Ok(None);
        };

        node.metadata = definition.get("meta").cloned();
        Ok(Some(node))
    }

    fn metric(
        &self,
        name: &str,
        key: &str,
        params: &Value,
        scope: Scope,
    ) -> Option<(MetricKind, Vec<Expr>)> {
        let Some(params) = params.as_object() else {
            warn!(aggregation = name, kind = key, "metric parameters are not an object");
            return None;
        };

        let single = |op: SingleValue| {
            let (field, field_type) = self.field(name, key, params)?;
            let date = matches!(field_type, Some(FieldType::Date | FieldType::DateSeconds));
            let kind = MetricKind::SingleValue { op, date };
            let columns = field_columns(&kind, &field);
            Some((kind, columns))
        };
        let on_field = |kind: MetricKind| {
            let (field, _) = self.field(name, key, params)?;
            let columns = field_columns(&kind, &field);
            Some((kind, columns))
        };

        match key {
            "sum" => single(SingleValue::Sum),
            "min" => single(SingleValue::Min),
            "max" => single(SingleValue::Max),
            "avg" => single(SingleValue::Avg),
            "value_count" => on_field(MetricKind::ValueCount),
            "cardinality" => on_field(MetricKind::Cardinality),
            "stats" => on_field(MetricKind::Stats),
            "extended_stats" => on_field(MetricKind::ExtendedStats {
                sigma: f64_param(name, params, "sigma", 2.0),
            }),
            "percentiles" => {
                let percents = match params.get("percents") {
                    None => DEFAULT_PERCENTS.to_vec(),
                    Some(raw) => numbers(raw).unwrap_or_else(|| {
                        warn!(aggregation = name, %raw, "malformed percents, using defaults");
                        DEFAULT_PERCENTS.to_vec()
                    }),
                };
                on_field(MetricKind::Percentiles {
                    percents,
                    keyed: bool_param(name, params, "keyed", true),
                })
            }
            "percentile_ranks" => {
                let Some(values) = params.get("values").and_then(numbers) else {
                    warn!(aggregation = name, "percentile_ranks requires numeric values");
                    return None;
                };
                on_field(MetricKind::PercentileRanks {
                    values,
                    keyed: bool_param(name, params, "keyed", true),
                })
            }
            "geo_centroid" => on_field(MetricKind::GeoCentroid),
            "top_hits" => {
                let mut fields = source_fields(params.get("_source"));
                if fields.is_empty() {
                    fields = self.ctx.registry.field_names();
                }
                if fields.is_empty() {
                    warn!(aggregation = name, "top_hits without _source fields, dropping it");
                    return None;
                }
                let top_hits = TopHits {
                    size: usize_param(name, params, "size", 1),
                    fields,
                    sort: self.sort_fields(params.get("sort")),
                    index: self.ctx.index.to_string(),
                };
                let columns = top_hits.columns(|field| self.column(field).0);
                Some((MetricKind::TopHits(top_hits), columns))
            }
            "top_metrics" => {
                let metrics: Vec<String> = match params.get("metrics") {
                    Some(Value::Array(items)) => items.iter().filter_map(metric_field).collect(),
                    Some(single) => metric_field(single).into_iter().collect(),
                    None => Vec::new(),
                };
                if metrics.is_empty() {
                    warn!(aggregation = name, "top_metrics requires metrics, dropping it");
                    return None;
                }
                let top_metrics = TopMetrics {
                    size: usize_param(name, params, "size", 1),
                    metrics,
                    sort: self.sort_fields(params.get("sort")).into_iter().next(),
                };
                let columns = top_metrics.columns(|field| self.column(field).0);
                Some((MetricKind::TopMetrics(top_metrics), columns))
            }
            "rate" => {
                let Some(unit) = params
                    .get("unit")
                    .and_then(Value::as_str)
                    .and_then(RateUnit::parse)
                else {
                    warn!(aggregation = name, "rate requires a valid unit, dropping it");
                    return None;
                };
                let mode = match params.get("mode").and_then(Value::as_str) {
                    None | Some("sum") => RateMode::Sum,
                    Some("value_count") => RateMode::ValueCount,
                    Some(other) => {
                        warn!(aggregation = name, mode = other, "unknown rate mode, using sum");
                        RateMode::Sum
                    }
                };
                if scope.interval.is_none() {
                    warn!(aggregation = name, "rate outside of a date_histogram renders null");
                }
                let has_field = params.contains_key("field");
                let kind = MetricKind::Rate(Rate {
                    unit,
                    mode,
                    has_field,
                    interval: scope.interval,
                });
                let columns = if has_field {
                    let (field, _) = self.field(name, key, params)?;
                    field_columns(&kind, &field)
                } else {
                    Vec::new()
                };
                Some((kind, columns))
            }
            _ => None,
        }
    }

    fn pipeline(&self, name: &str, key: &str, params: &Value) -> Result<Option<PipelineKind>> {
        let Some(params) = params.as_object() else {
            warn!(aggregation = name, kind = key, "pipeline parameters are not an object");
            return Ok(None);
        };

        let path = match params.get("buckets_path") {
            Some(Value::String(path)) => Some(path.clone()),
            Some(Value::Object(paths)) => paths.values().find_map(|path| path.as_str()).map(str::to_string),
            _ => None,
        };
        let Some(path) = path else {
            if key == "bucket_script" {
                return Err(ServiceError::unsupported(format!(
                    "bucket_script '{name}' without a buckets_path"
                )));
            }
            warn!(aggregation = name, kind = key, "pipeline without buckets_path, dropping it");
            return Ok(None);
        };

        let op = match key {
            "derivative" => PipelineOp::Derivative,
            "cumulative_sum" => PipelineOp::CumulativeSum,
            "moving_avg" => PipelineOp::MovingAvg {
                window: usize_param(name, params, "window", DEFAULT_MOVING_AVG_WINDOW),
            },
            "serial_diff" => PipelineOp::SerialDiff {
                lag: usize_param(name, params, "lag", DEFAULT_SERIAL_DIFF_LAG),
            },
            "bucket_script" => {
                check_bucket_script(name, &path, params.get("script"))?;
                PipelineOp::BucketScript
            }
            "avg_bucket" => PipelineOp::AvgBucket,
            "sum_bucket" => PipelineOp::SumBucket,
            "min_bucket" => PipelineOp::MinBucket,
            "max_bucket" => PipelineOp::MaxBucket,
            "stats_bucket" => PipelineOp::StatsBucket,
            _ => return Ok(None),
        };

        Ok(Some(PipelineKind {
            op,
            buckets_path: BucketsPath::parse(&path),
        }))
    }

    fn bucket(&self, name: &str, key: &str, params: &Value) -> Result<Option<BucketSpec>> {
        // `filter` takes a bare query as its parameters.
        if key == "filter" {
            let predicate = self.predicate(params)?;
            return Ok(Some(BucketSpec::new(BucketKind::Filter { predicate }, Vec::new())));
        }

        let Some(params) = params.as_object() else {
            warn!(aggregation = name, kind = key, "bucket parameters are not an object");
            return Ok(None);
        };

        let spec = match key {
            "terms" | "significant_terms" => self.terms(name, key, params),
            "multi_terms" => self.multi_terms(name, params),
            "histogram" => self.histogram(name, params),
            "date_histogram" => self.date_histogram(name, params),
            "auto_date_histogram" => self.auto_date_histogram(name, params),
            "range" => self.range(name, params),
            "date_range" => self.date_range(name, params),
            "ip_range" => self.ip_range(name, params),
            "ip_prefix" => self.ip_prefix(name, params),
            "geotile_grid" => self.geotile_grid(name, params),
            "composite" => self.composite(name, params),
            "filters" => self.filters(name, params)?,
            "sampler" => Some(BucketSpec::new(
                BucketKind::Sampler {
                    shard_size: usize_param(name, params, "shard_size", DEFAULT_SHARD_SIZE),
                },
                Vec::new(),
            )),
            "random_sampler" => Some(BucketSpec::new(
                BucketKind::RandomSampler {
                    probability: f64_param(name, params, "probability", 1.0),
                    seed: params.get("seed").and_then(Value::as_i64).unwrap_or(0),
                },
                Vec::new(),
            )),
            _ => None,
        };
        Ok(spec)
    }

    fn terms(&self, name: &str, key: &str, params: &Map<String, Value>) -> Option<BucketSpec> {
        let (field, _) = self.field(name, key, params)?;
        let (column, restricted) = include_exclude(name, field, params);
        let mut spec = BucketSpec::new(
            BucketKind::Terms {
                significant: key == "significant_terms",
            },
            vec![column.clone()],
        );
        spec.order = order_spec(name, params, &[column]);
        spec.limit = Some(usize_param(name, params, "size", DEFAULT_TERMS_SIZE));
        spec.filter_out_empty_key = !params.contains_key("missing") || restricted;
        Some(spec)
    }

    fn multi_terms(&self, name: &str, params: &Map<String, Value>) -> Option<BucketSpec> {
        let Some(terms) = params.get("terms").and_then(Value::as_array) else {
            warn!(aggregation = name, "multi_terms requires a terms array");
            return None;
        };
        let mut columns = Vec::with_capacity(terms.len());
        let mut all_missing = true;
        for term in terms {
            let term = term.as_object()?;
            all_missing &= term.contains_key("missing");
            columns.push(self.field(name, "multi_terms", term)?.0);
        }
        let mut spec = BucketSpec::new(BucketKind::MultiTerms, columns.clone());
        spec.order = order_spec(name, params, &columns);
        spec.limit = Some(usize_param(name, params, "size", DEFAULT_TERMS_SIZE));
        spec.filter_out_empty_key = !all_missing;
        Some(spec)
    }

    fn histogram(&self, name: &str, params: &Map<String, Value>) -> Option<BucketSpec> {
        let (field, _) = self.field(name, "histogram", params)?;
        let interval = histogram_interval(name, params);
        let extended_bounds = params
            .get("extended_bounds")
            .and_then(Value::as_object)
            .and_then(|bounds| {
                Some((
                    bounds.get("min").and_then(as_f64)?,
                    bounds.get("max").and_then(as_f64)?,
                ))
            });
        let histogram = Histogram {
            interval,
            min_doc_count: usize_param(name, params, "min_doc_count", 0) as u64,
            extended_bounds,
        };
        let column = histogram.key_expr(field);
        let mut spec = BucketSpec::new(BucketKind::Histogram(histogram), vec![column.clone()]);
        spec.order = key_order(name, params, column);
        spec.keyed = bool_param(name, params, "keyed", false);
        spec.filter_out_empty_key = !params.contains_key("missing");
        Some(spec)
    }

    fn date_histogram(&self, name: &str, params: &Map<String, Value>) -> Option<BucketSpec> {
        let (field, _) = self.field(name, "date_histogram", params)?;
        let interval = self.interval(name, params);
        let time_zone = params
            .get("time_zone")
            .and_then(Value::as_str)
            .map(TimeZoneSpec::parse)
            .unwrap_or(TimeZoneSpec::Utc);
        let extended_bounds = params
            .get("extended_bounds")
            .and_then(Value::as_object)
            .and_then(|bounds| {
                let bound = |key: &str| {
                    let raw = bounds.get(key)?;
                    match time::parse_date_value(raw, self.ctx.now) {
                        Ok(instant) => Some(instant.timestamp_millis()),
                        Err(err) => {
                            warn!(aggregation = name, error = %err, "ignoring extended_bounds");
                            None
                        }
                    }
                };
                Some((bound("min")?, bound("max")?))
            });

        let histogram = DateHistogram {
            interval,
            time_zone,
            min_doc_count: usize_param(name, params, "min_doc_count", 0) as u64,
            extended_bounds,
            column_kind: self.ctx.registry.date_time_kind(&field),
        };
        let column = histogram.key_expr(field);
        let mut spec = BucketSpec::new(BucketKind::DateHistogram(histogram), vec![column.clone()]);
        spec.order = key_order(name, params, column);
        spec.keyed = bool_param(name, params, "keyed", false);
        spec.filter_out_empty_key = !params.contains_key("missing");
        spec.child_scope = Scope {
            interval: Some(interval),
        };
        Some(spec)
    }

    fn interval(&self, name: &str, params: &Map<String, Value>) -> Interval {
        let parsed = if let Some(raw) = params.get("fixed_interval").and_then(Value::as_str) {
            Interval::parse_fixed(raw)
        } else if let Some(raw) = params.get("calendar_interval").and_then(Value::as_str) {
            Interval::parse_calendar(raw)
        } else if let Some(raw) = params.get("interval").and_then(Value::as_str) {
            Interval::parse_legacy(raw)
        } else {
            warn!(aggregation = name, "date_histogram without an interval, using 30s");
            return Interval::Fixed {
                ms: DEFAULT_DATE_INTERVAL_MS,
            };
        };
        parsed.unwrap_or_else(|err| {
            warn!(aggregation = name, error = %err, "invalid interval, using 30s");
            Interval::Fixed {
                ms: DEFAULT_DATE_INTERVAL_MS,
            }
        })
    }

    fn auto_date_histogram(&self, name: &str, params: &Map<String, Value>) -> Option<BucketSpec> {
        let (field, _) = self.field(name, "auto_date_histogram", params)?;
        let lower_bound = match (field.as_column(), &self.where_clause) {
            (Some(column), Some(where_clause)) => timestamp_lower_bound(column, where_clause),
            _ => None,
        };
        if lower_bound.is_none() {
            warn!(aggregation = name, "no lower time bound in the query for auto_date_histogram");
        }
        Some(BucketSpec::new(
            BucketKind::AutoDateHistogram {
                buckets: usize_param(name, params, "buckets", DEFAULT_AUTO_BUCKETS),
                lower_bound: lower_bound.map(|instant| instant.timestamp_millis()),
            },
            Vec::new(),
        ))
    }

    fn range(&self, name: &str, params: &Map<String, Value>) -> Option<BucketSpec> {
        let (field, _) = self.field(name, "range", params)?;
        let intervals: Vec<RangeInterval> = ranges(name, params)?
            .iter()
            .map(|range| RangeInterval {
                from: range.get("from").and_then(as_f64),
                to: range.get("to").and_then(as_f64),
                key: range.get("key").and_then(Value::as_str).map(str::to_string),
            })
            .collect();
        let mut spec = BucketSpec::new(BucketKind::Range { field, intervals }, Vec::new());
        spec.keyed = bool_param(name, params, "keyed", false);
        Some(spec)
    }

    fn date_range(&self, name: &str, params: &Map<String, Value>) -> Option<BucketSpec> {
        let (field, _) = self.field(name, "date_range", params)?;
        let bound = |range: &Map<String, Value>, key: &str| {
            let raw = range.get(key).filter(|raw| !raw.is_null())?;
            match time::parse_date_value(raw, self.ctx.now) {
                Ok(instant) => Some(instant),
                Err(err) => {
                    warn!(aggregation = name, error = %err, "ignoring unparsable date_range bound");
                    None
                }
            }
        };
        let intervals: Vec<DateRangeInterval> = ranges(name, params)?
            .iter()
            .map(|range| DateRangeInterval {
                from: bound(range, "from"),
                to: bound(range, "to"),
                key: range.get("key").and_then(Value::as_str).map(str::to_string),
            })
            .collect();
        let kind = self.ctx.registry.date_time_kind(&field);
        let mut spec = BucketSpec::new(
            BucketKind::DateRange {
                field,
                kind,
                intervals,
            },
            Vec::new(),
        );
        spec.keyed = bool_param(name, params, "keyed", false);
        Some(spec)
    }

    fn ip_range(&self, name: &str, params: &Map<String, Value>) -> Option<BucketSpec> {
        let (field, _) = self.field(name, "ip_range", params)?;
        let mut intervals = Vec::new();
        for range in ranges(name, params)? {
            let key = range.get("key").and_then(Value::as_str).map(str::to_string);
            if let Some(mask) = range.get("mask").and_then(Value::as_str) {
                let Some((from, to)) = cidr_bounds(mask) else {
                    warn!(aggregation = name, mask, "invalid CIDR mask, skipping range");
                    continue;
                };
                intervals.push(IpRangeInterval {
                    from: Some(from),
                    to,
                    key: key.or_else(|| Some(mask.to_string())),
                });
                continue;
            }
            let bound = |key: &str| range.get(key).and_then(Value::as_str).map(str::to_string);
            intervals.push(IpRangeInterval {
                from: bound("from"),
                to: bound("to"),
                key,
            });
        }
        let mut spec = BucketSpec::new(BucketKind::IpRange { field, intervals }, Vec::new());
        spec.keyed = bool_param(name, params, "keyed", false);
        Some(spec)
    }

    fn ip_prefix(&self, name: &str, params: &Map<String, Value>) -> Option<BucketSpec> {
        let (field, _) = self.field(name, "ip_prefix", params)?;
        let is_ipv6 = bool_param(name, params, "is_ipv6", false);
        let max = if is_ipv6 { 128 } else { 32 };
        let Some(prefix_length) = params
            .get("prefix_length")
            .and_then(Value::as_u64)
            .and_then(|length| u32::try_from(length).ok())
            .filter(|length| *length <= max)
        else {
            warn!(aggregation = name, "ip_prefix requires prefix_length in [0, {max}]");
            return None;
        };
        let prefix = IpPrefix {
            prefix_length,
            is_ipv6,
            append_prefix_length: bool_param(name, params, "append_prefix_length", false),
        };
        let columns: Vec<Expr> = prefix.key_expr(field).into_iter().collect();
        let mut spec = BucketSpec::new(BucketKind::IpPrefix(prefix), columns.clone());
        spec.order = columns.into_iter().map(|column| OrderSpec::Resolved(OrderByExpr::asc(column))).collect();
        spec.keyed = bool_param(name, params, "keyed", false);
        Some(spec)
    }

    fn geotile_grid(&self, name: &str, params: &Map<String, Value>) -> Option<BucketSpec> {
        let Some(field) = params.get("field").and_then(Value::as_str) else {
            warn!(aggregation = name, "geotile_grid requires a field");
            return None;
        };
        let (column, _) = field_column(self.ctx.registry, field);
        let mut precision = usize_param(name, params, "precision", DEFAULT_GEOTILE_PRECISION as usize) as u32;
        if precision > MAX_GEOTILE_PRECISION {
            warn!(aggregation = name, precision, "geotile precision capped at {MAX_GEOTILE_PRECISION}");
            precision = MAX_GEOTILE_PRECISION;
        }
        let mut spec = BucketSpec::new(
            BucketKind::GeotileGrid { precision },
            geotile_columns(&column, precision),
        );
        spec.order = vec![OrderSpec::Resolved(OrderByExpr::desc(Expr::count_rows()))];
        spec.limit = Some(usize_param(name, params, "size", DEFAULT_GEOTILE_SIZE));
        Some(spec)
    }

    fn composite(&self, name: &str, params: &Map<String, Value>) -> Option<BucketSpec> {
        if params.contains_key("after") {
            warn!(aggregation = name, "composite 'after' is not supported, returning the first page");
        }
        let Some(raw_sources) = params.get("sources").and_then(Value::as_array) else {
            warn!(aggregation = name, "composite requires sources");
            return None;
        };

        let mut sources = Vec::with_capacity(raw_sources.len());
        let mut columns = Vec::with_capacity(raw_sources.len());
        let mut order = Vec::with_capacity(raw_sources.len());
        for raw in raw_sources {
            let Some((source_name, definition)) = raw.as_object().and_then(|raw| raw.iter().next()) else {
                warn!(aggregation = name, %raw, "malformed composite source, skipping it");
                continue;
            };
            let Some((kind_name, source)) = definition
                .as_object()
                .and_then(|definition| definition.iter().next())
                .and_then(|(kind, source)| Some((kind.as_str(), source.as_object()?)))
            else {
                warn!(aggregation = name, source = %source_name, "malformed composite source, skipping it");
                continue;
            };
            let Some((field, _)) = self.field(name, kind_name, source) else {
                continue;
            };
            let (kind, column) = match kind_name {
                "terms" => (CompositeSourceKind::Terms, field),
                "histogram" => {
                    let interval = histogram_interval(name, source);
                    let histogram = Histogram {
                        interval,
                        min_doc_count: 1,
                        extended_bounds: None,
                    };
                    (CompositeSourceKind::Histogram { interval }, histogram.key_expr(field))
                }
                "date_histogram" => {
                    let histogram = DateHistogram {
                        interval: self.interval(name, source),
                        time_zone: source
                            .get("time_zone")
                            .and_then(Value::as_str)
                            .map(TimeZoneSpec::parse)
                            .unwrap_or(TimeZoneSpec::Utc),
                        min_doc_count: 1,
                        extended_bounds: None,
                        column_kind: self.ctx.registry.date_time_kind(&field),
                    };
                    let column = histogram.key_expr(field);
                    (CompositeSourceKind::DateHistogram(histogram), column)
                }
                other => {
                    warn!(aggregation = name, kind = other, "unsupported composite source, skipping it");
                    continue;
                }
            };
            let direction = source
                .get("order")
                .and_then(Value::as_str)
                .and_then(Direction::parse)
                .unwrap_or(Direction::Asc);
            order.push(OrderSpec::Resolved(OrderByExpr::new(column.clone(), direction)));
            columns.push(column);
            sources.push(CompositeSource {
                name: source_name.clone(),
                kind,
            });
        }
        if sources.is_empty() {
            return None;
        }

        let mut spec = BucketSpec::new(BucketKind::Composite { sources }, columns);
        spec.order = order;
        spec.limit = Some(usize_param(name, params, "size", DEFAULT_COMPOSITE_SIZE));
        Some(spec)
    }

    fn filters(&self, name: &str, params: &Map<String, Value>) -> Result<Option<BucketSpec>> {
        let (filters, keyed) = match params.get("filters") {
            Some(Value::Object(named)) => {
                let mut filters = Vec::with_capacity(named.len());
                for (key, query) in named {
                    filters.push((key.clone(), self.predicate(query)?));
                }
                filters.sort_by(|a, b| a.0.cmp(&b.0));
                (filters, true)
            }
            Some(Value::Array(anonymous)) => {
                let mut filters = Vec::with_capacity(anonymous.len());
                for (idx, query) in anonymous.iter().enumerate() {
                    filters.push((idx.to_string(), self.predicate(query)?));
                }
                (filters, false)
            }
            _ => {
                warn!(aggregation = name, "filters requires an object or array of queries");
                return Ok(None);
            }
        };

        let other_bucket_key = match params.get("other_bucket_key").and_then(Value::as_str) {
            Some(key) => Some(key.to_string()),
            None if bool_param(name, params, "other_bucket", false) => {
                Some(DEFAULT_OTHER_BUCKET_KEY.to_string())
            }
            None => None,
        };

        let mut spec = BucketSpec::new(
            BucketKind::Filters {
                filters,
                other_bucket_key,
            },
            Vec::new(),
        );
        spec.keyed = bool_param(name, params, "keyed", keyed);
        Ok(Some(spec))
    }

    /// Translated query used as a combinator predicate; "match everything"
    /// becomes `true`.
    fn predicate(&self, query: &Value) -> Result<Expr> {
        Ok(self
            .ctx
            .filters
            .translate(query)?
            .map(|predicate| self.type_timestamps(predicate))
            .unwrap_or_else(Expr::truth))
    }

    fn type_timestamps(&self, expr: Expr) -> Expr {
        expr.rewrite(&mut TimestampLiteralRewriter::new(self.ctx.registry))
    }

    fn column(&self, field: &str) -> (Expr, Option<FieldType>) {
        let (column, field_type) = field_column(self.ctx.registry, field);
        (Expr::column(column), field_type)
    }

    /// The `field` parameter as a column, with `missing` folded in.
    fn field(&self, name: &str, kind: &str, params: &Map<String, Value>) -> Option<(Expr, Option<FieldType>)> {
        let Some(field) = params.get("field").and_then(Value::as_str) else {
            if params.contains_key("script") {
                warn!(aggregation = name, kind, "script-based aggregations are not supported");
            } else {
                warn!(aggregation = name, kind, "aggregation requires a field");
            }
            return None;
        };
        let (column, field_type) = self.column(field);
        let Some(missing) = params.get("missing") else {
            return Some((column, field_type));
        };

        let replacement = match (field_type, missing) {
            (Some(FieldType::Date | FieldType::DateSeconds), Value::String(raw)) => {
                let function = match self.ctx.registry.date_time_kind(&column) {
                    DateTimeKind::DateTime => "parseDateTimeBestEffort",
                    _ => "parseDateTime64BestEffort",
                };
                Expr::function(function, vec![Expr::string(raw.clone())])
            }
            _ => match filter::literal(missing) {
                Ok(literal) => literal,
                Err(err) => {
                    warn!(aggregation = name, error = %err, "ignoring malformed missing value");
                    return Some((column, field_type));
                }
            },
        };
        Some((Expr::function("COALESCE", vec![column, replacement]), field_type))
    }

    fn sort_fields(&self, raw: Option<&Value>) -> Vec<(Expr, Direction)> {
        let entries: Vec<&Value> = match raw {
            None => return Vec::new(),
            Some(Value::Array(items)) => items.iter().collect(),
            Some(single) => vec![single],
        };
        let mut sort = Vec::new();
        for entry in entries {
            let (field, direction) = match entry {
                Value::String(field) => (field.as_str(), Direction::Asc),
                Value::Object(spec) => {
                    let Some((field, order)) = spec.iter().next() else {
                        continue;
                    };
                    let order = match order {
                        Value::String(order) => Some(order.as_str()),
                        Value::Object(options) => options.get("order").and_then(Value::as_str),
                        _ => None,
                    };
                    let direction = order.and_then(Direction::parse).unwrap_or(Direction::Asc);
                    (field.as_str(), direction)
                }
                _ => continue,
            };
            if field.starts_with('_') {
                debug!(field, "ignoring meta-field sort");
                continue;
            }
            sort.push((self.column(field).0, direction));
        }
        sort
    }
}

fn histogram_interval(name: &str, params: &Map<String, Value>) -> f64 {
    let interval = f64_param(name, params, "interval", 1.0);
    if interval <= 0.0 {
        warn!(aggregation = name, interval, "non-positive histogram interval, using 1");
        return 1.0;
    }
    interval
}

fn check_bucket_script(name: &str, path: &str, script: Option<&Value>) -> Result<()> {
    if !path.ends_with("_count") {
        return Err(ServiceError::unsupported(format!(
            "bucket_script '{name}' only supports buckets_path '_count', got '{path}'"
        )));
    }
    let source = match script {
        Some(Value::String(source)) => Some(source.as_str()),
        Some(Value::Object(script)) => script.get("source").and_then(Value::as_str),
        _ => None,
    };
    match source.map(str::trim) {
        Some("_value" | "params._value") => Ok(()),
        other => Err(ServiceError::unsupported(format!(
            "bucket_script '{name}' only supports the '_value' script, got {other:?}"
        ))),
    }
}

/// Wraps a terms key in `if(cond, key, NULL)` for `include`/`exclude`.
fn include_exclude(name: &str, field: Expr, params: &Map<String, Value>) -> (Expr, bool) {
    let mut conditions = Vec::new();
    for (key, negate) in [("include", false), ("exclude", true)] {
        if let Some(raw) = params.get(key) {
            match term_condition(&field, raw, negate) {
                Some(condition) => conditions.push(condition),
                None => warn!(aggregation = name, parameter = key, %raw, "ignoring unsupported terms filter"),
            }
        }
    }
    match Expr::and(conditions) {
        Some(condition) => (Expr::function("if", vec![condition, field, Expr::null()]), true),
        None => (field, false),
    }
}

fn term_condition(field: &Expr, raw: &Value, negate: bool) -> Option<Expr> {
    match raw {
        Value::Array(items) => {
            let literals = items
                .iter()
                .map(filter::literal)
                .collect::<Result<Vec<_>>>()
                .ok()?;
            if literals.is_empty() {
                return None;
            }
            let op = if negate { "NOT IN" } else { "IN" };
            Some(Expr::infix(field.clone(), op, Expr::function("tuple", literals)))
        }
        Value::String(pattern) if looks_like_regex(pattern) => {
            let matched = Expr::function(
                "match",
                vec![field.clone(), Expr::string(format!("^(?:{pattern})$"))],
            );
            Some(if negate {
                Expr::prefix("NOT", vec![matched])
            } else {
                matched
            })
        }
        Value::Object(_) | Value::Null => None,
        scalar => {
            let op = if negate { "!=" } else { "=" };
            Some(Expr::infix(field.clone(), op, filter::literal(scalar).ok()?))
        }
    }
}

fn looks_like_regex(pattern: &str) -> bool {
    pattern
        .chars()
        .any(|ch| matches!(ch, '.' | '*' | '+' | '?' | '[' | ']' | '(' | ')' | '{' | '}' | '|' | '\\' | '^' | '$'))
}

/// `order` of terms-like aggregations. Defaults to document count
/// descending; the generator adds the key as tie breaker.
fn order_spec(name: &str, params: &Map<String, Value>, keys: &[Expr]) -> Vec<OrderSpec> {
    let default = || vec![OrderSpec::Resolved(OrderByExpr::desc(Expr::count_rows()))];
    let entries: Vec<&Map<String, Value>> = match params.get("order") {
        None => return default(),
        Some(Value::Object(single)) => vec![single],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).collect(),
        Some(other) => {
            warn!(aggregation = name, order = %other, "malformed order, using default");
            return default();
        }
    };

    let mut order = Vec::new();
    for entry in entries {
        for (target, direction) in entry {
            let Some(direction) = direction.as_str().and_then(Direction::parse) else {
                warn!(aggregation = name, %direction, "order direction must be asc or desc");
                continue;
            };
            match target.as_str() {
                "_key" | "_term" => order.extend(
                    keys.iter()
                        .map(|key| OrderSpec::Resolved(OrderByExpr::new(key.clone(), direction))),
                ),
                "_count" => order.push(OrderSpec::Resolved(OrderByExpr::new(
                    Expr::count_rows(),
                    direction,
                ))),
                path => order.push(OrderSpec::MetricPath(path.to_string(), direction)),
            }
        }
    }
    if order.is_empty() {
        default()
    } else {
        order
    }
}

/// Histograms are ordered by key unless the request says otherwise.
fn key_order(name: &str, params: &Map<String, Value>, key: Expr) -> Vec<OrderSpec> {
    if params.contains_key("order") {
        return order_spec(name, params, &[key]);
    }
    vec![OrderSpec::Resolved(OrderByExpr::asc(key))]
}

fn resolve_order(name: &str, specs: Vec<OrderSpec>, children: &[AggregationNode]) -> Vec<OrderByExpr> {
    specs
        .into_iter()
        .map(|spec| match spec {
            OrderSpec::Resolved(order_by) => order_by,
            OrderSpec::MetricPath(path, direction) => match metric_order_expr(&path, children) {
                Some(expr) => OrderByExpr::new(expr, direction),
                None => {
                    warn!(aggregation = name, path, "cannot order by this path, using document count");
                    OrderByExpr::desc(Expr::count_rows())
                }
            },
        })
        .collect()
}

/// Column of a child metric named by an order path (`m`, `m.avg`, `m[99]`).
fn metric_order_expr(path: &str, children: &[AggregationNode]) -> Option<Expr> {
    let path = BucketsPath::parse(path);
    if path.segments.len() != 1 {
        return None;
    }
    let child = children.iter().find(|child| child.name == path.head())?;
    let QueryType::Metric(kind) = &child.query_type else {
        return None;
    };
    let property = path.property.as_deref();
    let idx = match (kind, property) {
        (MetricKind::Stats | MetricKind::ExtendedStats { .. }, Some(stat)) => match stat {
            "count" => 0,
            "min" => 1,
            "max" => 2,
            "avg" => 3,
            "sum" => 4,
            "sum_of_squares" => 5,
            "variance" | "variance_population" => 6,
            "variance_sampling" => 7,
            "std_deviation" | "std_deviation_population" => 8,
            "std_deviation_sampling" => 9,
            _ => return None,
        },
        (MetricKind::Percentiles { percents: wanted, .. }, Some(_))
        | (MetricKind::PercentileRanks { values: wanted, .. }, Some(_)) => {
            let target: f64 = path.percentile_property()?.parse().ok()?;
            wanted.iter().position(|candidate| *candidate == target)?
        }
        (MetricKind::Percentiles { percents: wanted, .. }, None) if wanted.len() == 1 => 0,
        (
            MetricKind::SingleValue { .. }
            | MetricKind::ValueCount
            | MetricKind::Cardinality
            | MetricKind::Rate(_),
            None | Some("value"),
        ) => 0,
        _ => return None,
    };
    child.selected_columns.get(idx).cloned()
}

fn ranges<'v>(name: &str, params: &'v Map<String, Value>) -> Option<Vec<&'v Map<String, Value>>> {
    let ranges: Vec<&Map<String, Value>> = params
        .get("ranges")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default();
    if ranges.is_empty() {
        warn!(aggregation = name, "range aggregation without ranges, dropping it");
        return None;
    }
    Some(ranges)
}

/// First address of a CIDR block and the first address after it (`None`
/// when the block reaches the end of the address space).
fn cidr_bounds(mask: &str) -> Option<(String, Option<String>)> {
    let (address, length) = mask.split_once('/')?;
    let length: u32 = length.trim().parse().ok()?;
    match address.trim().parse::<IpAddr>().ok()? {
        IpAddr::V4(address) => {
            if length > 32 {
                return None;
            }
            let size = 1u64 << (32 - length);
            let start = u64::from(u32::from(address)) / size * size;
            let end = start + size;
            let start = Ipv4Addr::from(start as u32).to_string();
            let end = u32::try_from(end).ok().map(|end| Ipv4Addr::from(end).to_string());
            Some((start, end))
        }
        IpAddr::V6(address) => {
            if length > 128 {
                return None;
            }
            let host_bits = 128 - length;
            let mask = u128::MAX.checked_shl(host_bits).unwrap_or(0);
            let start = u128::from(address) & mask;
            let end = 1u128
                .checked_shl(host_bits)
                .and_then(|size| start.checked_add(size))
                .map(|end| Ipv6Addr::from(end).to_string());
            Some((Ipv6Addr::from(start).to_string(), end))
        }
    }
}

fn source_fields(raw: Option<&Value>) -> Vec<String> {
    let strings = |value: &Value| -> Vec<String> {
        match value {
            Value::String(single) => vec![single.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    };
    match raw {
        Some(Value::Object(source)) => source.get("includes").map(strings).unwrap_or_default(),
        Some(other) => strings(other),
        None => Vec::new(),
    }
}

fn metric_field(raw: &Value) -> Option<String> {
    raw.get("field").and_then(Value::as_str).map(str::to_string)
}

fn numbers(raw: &Value) -> Option<Vec<f64>> {
    let items = raw.as_array()?;
    items.iter().map(as_f64).collect()
}

fn usize_param(name: &str, params: &Map<String, Value>, key: &str, default: usize) -> usize {
    match params.get(key) {
        None | Some(Value::Null) => default,
        Some(raw) => match as_f64(raw) {
            Some(value) if value >= 0.0 && value.fract() == 0.0 => value as usize,
            _ => {
                warn!(aggregation = name, parameter = key, %raw, default, "malformed parameter, using default");
                default
            }
        },
    }
}

fn f64_param(name: &str, params: &Map<String, Value>, key: &str, default: f64) -> f64 {
    match params.get(key) {
        None | Some(Value::Null) => default,
        Some(raw) => as_f64(raw).unwrap_or_else(|| {
            warn!(aggregation = name, parameter = key, %raw, default, "malformed parameter, using default");
            default
        }),
    }
}

fn bool_param(name: &str, params: &Map<String, Value>, key: &str, default: bool) -> bool {
    match params.get(key) {
        None | Some(Value::Null) => default,
        Some(Value::Bool(flag)) => *flag,
        Some(raw) => {
            warn!(aggregation = name, parameter = key, %raw, default, "malformed parameter, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::DslFilterTranslator,
        schema::StaticFieldRegistry,
    };
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> StaticFieldRegistry {
        StaticFieldRegistry::new()
            .with_column("@timestamp", "timestamp", FieldType::Date)
            .with_field("host.name", FieldType::Keyword)
            .with_field("bytes", FieldType::Long)
            .with_field("latency", FieldType::Double)
            .with_field("client_ip", FieldType::Ip)
    }

    fn parse(body: Value) -> Result<AggregationTree> {
        let registry = registry();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let filters = DslFilterTranslator::new(&registry, now);
        let ctx = ParseContext {
            registry: &registry,
            filters: &filters,
            now,
            index: "logs",
        };
        AggregationParser::new(ctx).parse_request(&body)
    }

    fn sql(exprs: &[Expr]) -> Vec<String> {
        exprs.iter().map(Expr::to_sql).collect()
    }

    #[test]
    fn terms_defaults() {
        let tree = parse(json!({ "aggs": { "0": { "terms": { "field": "host.name" } } } })).unwrap();
        let node = &tree.children[0];
        assert_eq!(sql(&node.selected_columns), vec![r#""host.name""#]);
        assert_eq!(node.limit, Some(10));
        assert!(node.filter_out_empty_key);
        assert_eq!(node.order_by, vec![OrderByExpr::desc(Expr::count_rows())]);
    }

    #[test]
    fn unknown_aggregations_are_dropped() {
        let tree = parse(json!({
            "aggs": {
                "bogus": { "frobnicate": { "field": "x" } },
                "total": { "sum": { "field": "bytes" } },
            }
        }))
        .unwrap();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].name, "total");
        assert_eq!(sql(&tree.children[0].selected_columns), vec![r#"sumOrNull("bytes")"#]);
    }

    #[test]
    fn terms_order_by_child_metric() {
        let tree = parse(json!({
            "aggs": { "hosts": {
                "terms": { "field": "host.name", "order": { "lat.avg": "asc" } },
                "aggs": { "lat": { "stats": { "field": "latency" } } },
            }}
        }))
        .unwrap();
        assert_eq!(
            tree.children[0].order_by,
            vec![OrderByExpr::asc(Expr::function("avgOrNull", vec![Expr::column("latency")]))]
        );
    }

    #[test]
    fn terms_exclude_wraps_the_key() {
        let tree = parse(json!({
            "aggs": { "0": { "terms": { "field": "host.name", "exclude": ["a", "b"], "missing": "n/a" } } }
        }))
        .unwrap();
        let node = &tree.children[0];
        assert_eq!(
            sql(&node.selected_columns),
            vec![r#"if(COALESCE("host.name",'n/a') NOT IN tuple('a','b'),COALESCE("host.name",'n/a'),NULL)"#]
        );
        assert!(node.filter_out_empty_key);
    }

    #[test]
    fn rate_sees_the_enclosing_interval() {
        let tree = parse(json!({
            "aggs": { "per_day": {
                "date_histogram": { "field": "@timestamp", "calendar_interval": "1M" },
                "aggs": { "r": { "rate": { "unit": "day" } } },
            }}
        }))
        .unwrap();
        let QueryType::Metric(MetricKind::Rate(rate)) = &tree.children[0].children[0].query_type else {
            panic!("expected a rate metric");
        };
        assert_eq!(
            rate.interval,
            Some(Interval::Calendar(crate::time::CalendarUnit::Month))
        );
        assert!(!rate.has_field);
    }

    #[test]
    fn date_histogram_with_legacy_interval() {
        let tree = parse(json!({
            "aggs": { "0": { "date_histogram": { "field": "@timestamp", "interval": "30s" } } }
        }))
        .unwrap();
        let node = &tree.children[0];
        assert_eq!(
            sql(&node.selected_columns),
            vec![r#"toInt64(toUnixTimestamp64Milli("timestamp")/30000)"#]
        );
        assert_eq!(node.limit, None);
    }

    #[test]
    fn unsupported_bucket_script_fails_fast() {
        let err = parse(json!({
            "aggs": { "h": {
                "histogram": { "field": "bytes", "interval": 10 },
                "aggs": { "s": { "bucket_script": {
                    "buckets_path": { "x": "lat" },
                    "script": "params.x * 2",
                }}},
            }}
        }))
        .unwrap_err();
        assert!(matches!(err, ServiceError::Unsupported(_)));

        let tree = parse(json!({
            "aggs": { "h": {
                "histogram": { "field": "bytes", "interval": 10 },
                "aggs": { "s": { "bucket_script": {
                    "buckets_path": { "count": "_count" },
                    "script": { "source": "_value" },
                }}},
            }}
        }))
        .unwrap();
        assert_eq!(tree.children[0].children.len(), 1);

        let err = parse(json!({
            "aggs": { "h": {
                "histogram": { "field": "bytes", "interval": 10 },
                "aggs": { "s": { "bucket_script": {
                    "buckets_path": { "count": "_count" },
                    "script": "count * 1",
                }}},
            }}
        }))
        .unwrap_err();
        assert!(matches!(err, ServiceError::Unsupported(_)));
    }

    #[test]
    fn composite_histogram_rejects_zero_interval() {
        let tree = parse(json!({
            "aggs": { "c": { "composite": { "sources": [
                { "b": { "histogram": { "field": "bytes", "interval": 0 } } },
            ]}}}
        }))
        .unwrap();
        assert_eq!(sql(&tree.children[0].selected_columns), vec![r#""bytes""#]);
    }

    #[test]
    fn filters_are_sorted_and_keyed() {
        let tree = parse(json!({
            "aggs": { "f": { "filters": {
                "other_bucket": true,
                "filters": {
                    "z": { "term": { "host.name": "z" } },
                    "a": { "match_all": {} },
                },
            }}}
        }))
        .unwrap();
        let node = &tree.children[0];
        assert!(node.keyed);
        let QueryType::Bucket(BucketKind::Filters { filters, other_bucket_key }) = &node.query_type else {
            panic!("expected filters");
        };
        let names: Vec<&str> = filters.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["a", "z"]);
        assert_eq!(filters[0].1, Expr::truth());
        assert_eq!(other_bucket_key.as_deref(), Some("_other_"));
    }

    #[test]
    fn ip_range_masks_become_bounds() {
        assert_eq!(
            cidr_bounds("10.0.0.0/25"),
            Some(("10.0.0.0".to_string(), Some("10.0.0.128".to_string())))
        );
        assert_eq!(cidr_bounds("0.0.0.0/0"), Some(("0.0.0.0".to_string(), None)));
        assert_eq!(cidr_bounds("nonsense"), None);
    }

    #[test]
    fn auto_date_histogram_reads_the_query_lower_bound() {
        let tree = parse(json!({
            "query": { "range": { "@timestamp": { "gte": 1_709_290_800_000_i64 } } },
            "aggs": { "0": { "auto_date_histogram": { "field": "@timestamp" } } }
        }))
        .unwrap();
        assert_eq!(
            tree.children[0].query_type,
            QueryType::Bucket(BucketKind::AutoDateHistogram {
                buckets: 10,
                lower_bound: Some(1_709_290_800_000),
            })
        );
    }

    #[test]
    fn malformed_parameters_fall_back_to_defaults() {
        let tree = parse(json!({
            "aggs": { "0": { "terms": { "field": "host.name", "size": "many" } } }
        }))
        .unwrap();
        assert_eq!(tree.children[0].limit, Some(10));
    }

    #[test]
    fn track_total_hits_only_when_requested() {
        assert!(parse(json!({ "track_total_hits": true })).unwrap().track_total_hits);
        assert!(parse(json!({ "track_total_hits": 10000 })).unwrap().track_total_hits);
        assert!(!parse(json!({ "track_total_hits": false })).unwrap().track_total_hits);
        assert!(!parse(json!({})).unwrap().track_total_hits);
    }

    #[test]
    fn top_hits_select_source_fields_and_sort() {
        let tree = parse(json!({
            "aggs": { "last": { "top_hits": {
                "size": 2,
                "_source": { "includes": ["host.name"] },
                "sort": [{ "@timestamp": { "order": "desc" } }],
            }}}
        }))
        .unwrap();
        assert_eq!(
            sql(&tree.children[0].selected_columns),
            vec![r#""host.name""#, r#""timestamp""#]
        );
    }
}
