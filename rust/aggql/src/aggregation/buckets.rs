//! Bucket aggregations.
//!
//! A bucket kind either groups rows with `GROUP BY` (terms, histograms,
//! composite, ...) or acts as a combinator: its buckets are sub-filters
//! evaluated with `-If` aggregate functions over the same rows (filter,
//! filters, ranges). Samplers and `auto_date_histogram` produce exactly one
//! bucket.

use super::values::{
    as_f64, as_i64, as_u128, date_string, float_label, key_string, number,
};
use crate::{
    error::Result,
    expr::Expr,
    schema::DateTimeKind,
    time::{self, Interval, TimeZoneSpec},
};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub interval: f64,
    pub min_doc_count: u64,
    pub extended_bounds: Option<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DateHistogram {
    pub interval: Interval,
    pub time_zone: TimeZoneSpec,
    pub min_doc_count: u64,
    /// Epoch milliseconds.
    pub extended_bounds: Option<(i64, i64)>,
    pub column_kind: DateTimeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeInterval {
    pub from: Option<f64>,
    pub to: Option<f64>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DateRangeInterval {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpRangeInterval {
    pub from: Option<String>,
    pub to: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpPrefix {
    pub prefix_length: u32,
    pub is_ipv6: bool,
    pub append_prefix_length: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompositeSourceKind {
    Terms,
    Histogram { interval: f64 },
    DateHistogram(DateHistogram),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeSource {
    pub name: String,
    pub kind: CompositeSourceKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BucketKind {
    Terms {
        significant: bool,
    },
    MultiTerms,
    Histogram(Histogram),
    DateHistogram(DateHistogram),
    AutoDateHistogram {
        buckets: usize,
        /// Start of the only bucket, taken from the query's time filter.
        lower_bound: Option<i64>,
    },
    Range {
        field: Expr,
        intervals: Vec<RangeInterval>,
    },
    DateRange {
        field: Expr,
        kind: DateTimeKind,
        intervals: Vec<DateRangeInterval>,
    },
    IpRange {
        field: Expr,
        intervals: Vec<IpRangeInterval>,
    },
    IpPrefix(IpPrefix),
    GeotileGrid {
        precision: u32,
    },
    Composite {
        sources: Vec<CompositeSource>,
    },
    Filter {
        predicate: Expr,
    },
    Filters {
        filters: Vec<(String, Expr)>,
        other_bucket_key: Option<String>,
    },
    Sampler {
        shard_size: usize,
    },
    RandomSampler {
        probability: f64,
        seed: i64,
    },
}

/// One branch of a combinator bucket aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinatorGroup {
    /// Prepended to every column alias computed for this branch.
    pub prefix: String,
    pub key: String,
    pub predicate: Expr,
    /// Extra bucket fields such as `from`/`to`.
    pub extra: Map<String, Value>,
}

/// A bucket read back from result rows, with its sub-aggregations rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketData {
    pub keys: Vec<Value>,
    pub doc_count: u64,
    pub content: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BucketContext {
    pub keyed: bool,
    pub parent_doc_count: Option<u64>,
}

impl BucketKind {
    pub fn name(&self) -> &'static str {
        match self {
            BucketKind::Terms { significant: false } => "terms",
            BucketKind::Terms { significant: true } => "significant_terms",
            BucketKind::MultiTerms => "multi_terms",
            BucketKind::Histogram(_) => "histogram",
            BucketKind::DateHistogram(_) => "date_histogram",
            BucketKind::AutoDateHistogram { .. } => "auto_date_histogram",
            BucketKind::Range { .. } => "range",
            BucketKind::DateRange { .. } => "date_range",
            BucketKind::IpRange { .. } => "ip_range",
            BucketKind::IpPrefix(_) => "ip_prefix",
            BucketKind::GeotileGrid { .. } => "geotile_grid",
            BucketKind::Composite { .. } => "composite",
            BucketKind::Filter { .. } => "filter",
            BucketKind::Filters { .. } => "filters",
            BucketKind::Sampler { .. } => "sampler",
            BucketKind::RandomSampler { .. } => "random_sampler",
        }
    }

    /// True when the kind's keys become `GROUP BY` columns.
    pub fn has_group_by(&self) -> bool {
        match self {
            BucketKind::Terms { .. }
            | BucketKind::MultiTerms
            | BucketKind::Histogram(_)
            | BucketKind::DateHistogram(_)
            | BucketKind::GeotileGrid { .. }
            | BucketKind::Composite { .. } => true,
            BucketKind::IpPrefix(prefix) => prefix.prefix_length > 0,
            _ => false,
        }
    }

    pub fn is_combinator(&self) -> bool {
        matches!(
            self,
            BucketKind::Filter { .. }
                | BucketKind::Filters { .. }
                | BucketKind::Range { .. }
                | BucketKind::DateRange { .. }
                | BucketKind::IpRange { .. }
        )
    }

    pub fn is_sampler(&self) -> bool {
        matches!(
            self,
            BucketKind::Sampler { .. } | BucketKind::RandomSampler { .. }
        )
    }

    pub fn is_histogram(&self) -> bool {
        matches!(self, BucketKind::Histogram(_) | BucketKind::DateHistogram(_))
    }

    pub fn combinator_groups(&self) -> Vec<CombinatorGroup> {
        match self {
            BucketKind::Filter { predicate } => vec![CombinatorGroup {
                prefix: String::new(),
                key: String::new(),
                predicate: predicate.clone(),
                extra: Map::new(),
            }],
            BucketKind::Filters {
                filters,
                other_bucket_key,
            } => {
                let mut groups: Vec<CombinatorGroup> = filters
                    .iter()
                    .enumerate()
                    .map(|(idx, (name, predicate))| CombinatorGroup {
                        prefix: format!("filter_{idx}__"),
                        key: name.clone(),
                        predicate: predicate.clone(),
                        extra: Map::new(),
                    })
                    .collect();
                if let Some(other) = other_bucket_key {
                    let matched = Expr::or(filters.iter().map(|(_, predicate)| predicate.clone()));
                    let predicate = match matched {
                        Some(matched) => Expr::prefix("NOT", vec![matched]),
                        None => Expr::truth(),
                    };
                    groups.push(CombinatorGroup {
                        prefix: format!("filter_{}__", filters.len()),
                        key: other.clone(),
                        predicate,
                        extra: Map::new(),
                    });
                }
                groups
            }
            BucketKind::Range { field, intervals } => {
                let single = intervals.len() == 1;
                intervals
                    .iter()
                    .enumerate()
                    .map(|(idx, interval)| {
                        let bounds = [
                            interval
                                .from
                                .map(|from| Expr::infix(field.clone(), ">=", Expr::float(from))),
                            interval
                                .to
                                .map(|to| Expr::infix(field.clone(), "<", Expr::float(to))),
                        ];
                        let mut extra = Map::new();
                        if let Some(from) = interval.from {
                            extra.insert("from".into(), number(from));
                        }
                        if let Some(to) = interval.to {
                            extra.insert("to".into(), number(to));
                        }
                        CombinatorGroup {
                            prefix: range_prefix(single, idx),
                            key: interval.key.clone().unwrap_or_else(|| {
                                range_key(interval.from.map(float_label), interval.to.map(float_label))
                            }),
                            predicate: Expr::and(bounds.into_iter().flatten())
                                .unwrap_or_else(Expr::truth),
                            extra,
                        }
                    })
                    .collect()
            }
            BucketKind::DateRange {
                field,
                kind,
                intervals,
            } => {
                let single = intervals.len() == 1;
                intervals
                    .iter()
                    .enumerate()
                    .map(|(idx, interval)| {
                        let literal = |instant: DateTime<Utc>| {
                            crate::filter::date_literal(instant, *kind)
                        };
                        let bounds = [
                            interval
                                .from
                                .map(|from| Expr::infix(field.clone(), ">=", literal(from))),
                            interval
                                .to
                                .map(|to| Expr::infix(field.clone(), "<", literal(to))),
                        ];
                        let mut extra = Map::new();
                        let from = interval.from.map(|from| from.timestamp_millis());
                        let to = interval.to.map(|to| to.timestamp_millis());
                        if let Some(from) = from {
                            extra.insert("from".into(), number(from as f64));
                            extra.insert("from_as_string".into(), json!(date_string(from)));
                        }
                        if let Some(to) = to {
                            extra.insert("to".into(), number(to as f64));
                            extra.insert("to_as_string".into(), json!(date_string(to)));
                        }
                        CombinatorGroup {
                            prefix: range_prefix(single, idx),
                            key: interval.key.clone().unwrap_or_else(|| {
                                range_key(from.and_then(date_string), to.and_then(date_string))
                            }),
                            predicate: Expr::and(bounds.into_iter().flatten())
                                .unwrap_or_else(Expr::truth),
                            extra,
                        }
                    })
                    .collect()
            }
            BucketKind::IpRange { field, intervals } => {
                let single = intervals.len() == 1;
                intervals
                    .iter()
                    .enumerate()
                    .map(|(idx, interval)| {
                        let bounds = [
                            interval.from.as_ref().map(|from| {
                                Expr::infix(field.clone(), ">=", Expr::string(from.clone()))
                            }),
                            interval
                                .to
                                .as_ref()
                                .map(|to| Expr::infix(field.clone(), "<", Expr::string(to.clone()))),
                        ];
                        let mut extra = Map::new();
                        if let Some(from) = &interval.from {
                            extra.insert("from".into(), json!(from));
                        }
                        if let Some(to) = &interval.to {
                            extra.insert("to".into(), json!(to));
                        }
                        CombinatorGroup {
                            prefix: range_prefix(single, idx),
                            key: interval.key.clone().unwrap_or_else(|| {
                                range_key(interval.from.clone(), interval.to.clone())
                            }),
                            predicate: Expr::and(bounds.into_iter().flatten())
                                .unwrap_or_else(Expr::truth),
                            extra,
                        }
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Converts raw key columns into the values exposed as `key`.
    pub fn decode_keys(&self, raw: &[Value]) -> Vec<Value> {
        match self {
            BucketKind::Histogram(_) => raw
                .iter()
                .map(|value| as_f64(value).map(number).unwrap_or(Value::Null))
                .collect(),
            BucketKind::DateHistogram(histogram) => raw
                .iter()
                .map(|value| histogram.decode_key(value).map(Value::from).unwrap_or(Value::Null))
                .collect(),
            BucketKind::Composite { sources } => sources
                .iter()
                .zip(raw)
                .map(|(source, value)| match &source.kind {
                    CompositeSourceKind::Terms => value.clone(),
                    CompositeSourceKind::Histogram { .. } => {
                        as_f64(value).map(number).unwrap_or(Value::Null)
                    }
                    CompositeSourceKind::DateHistogram(histogram) => histogram
                        .decode_key(value)
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                })
                .collect(),
            _ => raw.to_vec(),
        }
    }

    pub fn min_doc_count(&self) -> u64 {
        match self {
            BucketKind::Histogram(histogram) => histogram.min_doc_count,
            BucketKind::DateHistogram(histogram) => histogram.min_doc_count,
            _ => 1,
        }
    }

    /// Inserts empty buckets into histogram gaps (and up to the extended
    /// bounds). `empty` renders the content of a bucket without rows.
    pub fn fill_gaps<F>(
        &self,
        buckets: Vec<BucketData>,
        max_empty: usize,
        mut empty: F,
    ) -> Result<Vec<BucketData>>
    where
        F: FnMut() -> Result<Map<String, Value>>,
    {
        match self {
            BucketKind::Histogram(histogram) => {
                let keyed: Vec<(f64, BucketData)> = buckets
                    .into_iter()
                    .filter_map(|bucket| {
                        let key = bucket.keys.first().and_then(as_f64)?;
                        Some((key, bucket))
                    })
                    .collect();
                let interval = histogram.interval;
                let bounds = histogram
                    .extended_bounds
                    .map(|(min, max)| ((min / interval).floor() * interval, max));
                fill_sequence(
                    keyed,
                    bounds,
                    max_empty,
                    |key| key + interval,
                    |a, b| (a - b).abs() < interval / 2.0,
                    |a, b| a <= b,
                    number,
                    &mut empty,
                )
            }
            BucketKind::DateHistogram(histogram) => {
                let keyed: Vec<(i64, BucketData)> = buckets
                    .into_iter()
                    .filter_map(|bucket| {
                        let key = bucket.keys.first().and_then(as_i64)?;
                        Some((key, bucket))
                    })
                    .collect();
                let bounds = histogram
                    .extended_bounds
                    .map(|(min, max)| (histogram.bucket_start(min), max));
                fill_sequence(
                    keyed,
                    bounds,
                    max_empty,
                    |key| histogram.next_key(key),
                    |a, b| a == b,
                    |a, b| a <= b,
                    Value::from,
                    &mut empty,
                )
            }
            _ => Ok(buckets),
        }
    }

    /// Wraps `GROUP BY` buckets into the aggregation's response object.
    pub fn render_buckets(&self, buckets: Vec<BucketData>, ctx: &BucketContext) -> Value {
        let doc_total: u64 = buckets.iter().map(|bucket| bucket.doc_count).sum();
        let mut keyed = Map::new();
        let mut list = Vec::with_capacity(buckets.len());
        let mut after_key = None;

        for bucket in buckets {
            let (label, mut object) = self.bucket_object(&bucket);
            if let BucketKind::Composite { .. } = self {
                after_key = object.get("key").cloned();
            }
            if let BucketKind::Terms { significant: true } = self {
                object.insert("score".into(), bucket.doc_count.into());
                object.insert("bg_count".into(), bucket.doc_count.into());
            }
            object.extend(bucket.content);
            if ctx.keyed {
                keyed.insert(label, Value::Object(object));
            } else {
                list.push(Value::Object(object));
            }
        }

        let buckets = if ctx.keyed {
            Value::Object(keyed)
        } else {
            Value::Array(list)
        };

        match self {
            BucketKind::Terms { significant: true } => {
                let parent = ctx.parent_doc_count.unwrap_or(doc_total);
                json!({ "doc_count": parent, "bg_count": parent, "buckets": buckets })
            }
            BucketKind::Terms { .. } | BucketKind::MultiTerms => {
                let other = ctx
                    .parent_doc_count
                    .map(|parent| parent.saturating_sub(doc_total))
                    .unwrap_or(0);
                json!({
                    "doc_count_error_upper_bound": 0,
                    "sum_other_doc_count": other,
                    "buckets": buckets,
                })
            }
            BucketKind::Composite { .. } => match after_key {
                Some(after_key) => json!({ "after_key": after_key, "buckets": buckets }),
                None => json!({ "buckets": buckets }),
            },
            _ => json!({ "buckets": buckets }),
        }
    }

    /// Response of a combinator kind, one bucket per group.
    pub fn render_groups(
        &self,
        groups: Vec<(CombinatorGroup, BucketData)>,
        ctx: &BucketContext,
    ) -> Value {
        if let BucketKind::Filter { .. } = self {
            let mut object = Map::new();
            let (doc_count, content) = groups
                .into_iter()
                .next()
                .map(|(_, data)| (data.doc_count, data.content))
                .unwrap_or_default();
            object.insert("doc_count".into(), doc_count.into());
            object.extend(content);
            return Value::Object(object);
        }

        let named = matches!(self, BucketKind::Filters { .. });
        let mut keyed = Map::new();
        let mut list = Vec::with_capacity(groups.len());
        for (group, data) in groups {
            let mut object = Map::new();
            if !named && !ctx.keyed {
                object.insert("key".into(), json!(group.key));
            }
            object.extend(group.extra);
            object.insert("doc_count".into(), data.doc_count.into());
            object.extend(data.content);
            if ctx.keyed {
                keyed.insert(group.key, Value::Object(object));
            } else {
                list.push(Value::Object(object));
            }
        }
        if ctx.keyed {
            json!({ "buckets": keyed })
        } else {
            json!({ "buckets": list })
        }
    }

    /// Response of a kind that always yields exactly one bucket.
    pub fn render_single(&self, data: BucketData) -> Value {
        let mut object = Map::new();
        match self {
            BucketKind::AutoDateHistogram { lower_bound, .. } => {
                let mut bucket = Map::new();
                if let Some(key) = lower_bound {
                    bucket.insert("key".into(), (*key).into());
                    bucket.insert(
                        "key_as_string".into(),
                        json!(time::format_key_as_string(*key)),
                    );
                }
                bucket.insert("doc_count".into(), data.doc_count.into());
                bucket.extend(data.content);
                object.insert("buckets".into(), json!([bucket]));
                object.insert("interval".into(), json!("100y"));
            }
            BucketKind::RandomSampler { probability, seed } => {
                object.insert("doc_count".into(), data.doc_count.into());
                object.insert("seed".into(), (*seed).into());
                object.insert("probability".into(), number(*probability));
                object.extend(data.content);
            }
            _ => {
                object.insert("doc_count".into(), data.doc_count.into());
                object.extend(data.content);
            }
        }
        Value::Object(object)
    }

    /// Label used for keyed output plus the bucket's key fields.
    fn bucket_object(&self, bucket: &BucketData) -> (String, Map<String, Value>) {
        let first = bucket.keys.first().cloned().unwrap_or(Value::Null);
        let mut object = Map::new();
        let label = match self {
            BucketKind::DateHistogram(histogram) => {
                let label = as_i64(&first)
                    .and_then(|ms| time::format_key_as_string(ms + histogram.time_zone.offset_ms()))
                    .unwrap_or_default();
                object.insert("key".into(), first);
                object.insert("key_as_string".into(), json!(label));
                label
            }
            BucketKind::Histogram(_) => {
                let label = as_f64(&first).map(float_label).unwrap_or_default();
                object.insert("key".into(), first);
                label
            }
            BucketKind::MultiTerms => {
                let label = bucket
                    .keys
                    .iter()
                    .map(key_string)
                    .collect::<Vec<_>>()
                    .join("|");
                object.insert("key".into(), Value::Array(bucket.keys.clone()));
                object.insert("key_as_string".into(), json!(label));
                label
            }
            BucketKind::GeotileGrid { .. } => {
                let parts: Vec<String> = bucket
                    .keys
                    .iter()
                    .map(|value| {
                        as_f64(value)
                            .map(|float| (float as i64).to_string())
                            .unwrap_or_default()
                    })
                    .collect();
                let label = parts.join("/");
                object.insert("key".into(), json!(label));
                label
            }
            BucketKind::IpPrefix(prefix) => {
                let (key, netmask) = prefix.describe(&first);
                let label = if prefix.append_prefix_length {
                    format!("{key}/{}", prefix.prefix_length)
                } else {
                    key
                };
                object.insert("key".into(), json!(label));
                object.insert("is_ipv6".into(), json!(prefix.is_ipv6));
                object.insert("prefix_length".into(), json!(prefix.prefix_length));
                if let Some(netmask) = netmask {
                    object.insert("netmask".into(), json!(netmask));
                }
                label
            }
            BucketKind::Composite { sources } => {
                let key: Map<String, Value> = sources
                    .iter()
                    .zip(bucket.keys.iter())
                    .map(|(source, value)| (source.name.clone(), value.clone()))
                    .collect();
                let label = Value::Object(key.clone()).to_string();
                object.insert("key".into(), Value::Object(key));
                label
            }
            _ => {
                let label = key_string(&first);
                object.insert("key".into(), first);
                label
            }
        };
        object.insert("doc_count".into(), bucket.doc_count.into());
        (label, object)
    }
}

fn range_prefix(single: bool, idx: usize) -> String {
    if single {
        String::new()
    } else {
        format!("range_{idx}__")
    }
}

fn range_key(from: Option<String>, to: Option<String>) -> String {
    format!(
        "{}-{}",
        from.unwrap_or_else(|| "*".into()),
        to.unwrap_or_else(|| "*".into())
    )
}

#[allow(clippy::too_many_arguments)]
fn fill_sequence<K, F>(
    existing: Vec<(K, BucketData)>,
    bounds: Option<(K, K)>,
    max_empty: usize,
    next: impl Fn(K) -> K,
    same: impl Fn(K, K) -> bool,
    not_after: impl Fn(K, K) -> bool,
    to_value: impl Fn(K) -> Value,
    empty: &mut F,
) -> Result<Vec<BucketData>>
where
    K: Copy + PartialOrd,
    F: FnMut() -> Result<Map<String, Value>>,
{
    let first = existing.first().map(|(key, _)| *key);
    let last = existing.last().map(|(key, _)| *key);
    let start = match (first, bounds) {
        (Some(first), Some((min, _))) if min < first => min,
        (Some(first), _) => first,
        (None, Some((min, _))) => min,
        (None, None) => return Ok(Vec::new()),
    };
    let end = match (last, bounds) {
        (Some(last), Some((_, max))) if max > last => max,
        (Some(last), _) => last,
        (None, Some((_, max))) => max,
        (None, None) => start,
    };

    let mut filled = Vec::with_capacity(existing.len());
    let mut existing = existing.into_iter().peekable();
    let mut cursor = start;
    let mut added = 0usize;
    while not_after(cursor, end) {
        match existing.peek() {
            Some((key, _)) if same(*key, cursor) => {
                if let Some((_, bucket)) = existing.next() {
                    filled.push(bucket);
                }
            }
            // Keys off the interval grid are kept as they are.
            Some((key, _)) if *key < cursor => {
                if let Some((_, bucket)) = existing.next() {
                    filled.push(bucket);
                }
                continue;
            }
            _ => {
                if added >= max_empty {
                    break;
                }
                filled.push(BucketData {
                    keys: vec![to_value(cursor)],
                    doc_count: 0,
                    content: empty()?,
                });
                added += 1;
            }
        }
        let advanced = next(cursor);
        if advanced <= cursor {
            break;
        }
        cursor = advanced;
    }
    // Anything not reached because of the cap keeps its place at the end.
    filled.extend(existing.map(|(_, bucket)| bucket));
    Ok(filled)
}

impl Histogram {
    pub fn key_expr(&self, field: Expr) -> Expr {
        if self.interval == 1.0 {
            return field;
        }
        Expr::infix(
            Expr::function(
                "floor",
                vec![Expr::infix(field, "/", Expr::float(self.interval))],
            ),
            "*",
            Expr::float(self.interval),
        )
    }
}

impl DateHistogram {
    /// Integer bucket index (fixed intervals) or bucket start in epoch
    /// seconds (calendar intervals).
    pub fn key_expr(&self, field: Expr) -> Expr {
        match self.interval {
            Interval::Fixed { ms } => {
                let offset = self.time_zone.offset_ms();
                let seconds = self.column_kind == DateTimeKind::DateTime && ms % 1000 == 0;
                let (timestamp, divisor, offset) = if seconds {
                    (
                        Expr::function("toUnixTimestamp", vec![field]),
                        ms / 1000,
                        offset / 1000,
                    )
                } else {
                    (
                        Expr::function("toUnixTimestamp64Milli", vec![field]),
                        ms,
                        offset,
                    )
                };
                let shifted = if offset == 0 {
                    timestamp
                } else {
                    Expr::paren(Expr::infix(timestamp, "+", Expr::int(offset)))
                };
                Expr::function(
                    "toInt64",
                    vec![Expr::infix(shifted, "/", Expr::int(divisor))],
                )
            }
            Interval::Calendar(unit) => {
                let local = match &self.time_zone {
                    TimeZoneSpec::Utc => field,
                    zone => Expr::function(
                        "toTimezone",
                        vec![field, Expr::string(zone.sql_name())],
                    ),
                };
                Expr::function(
                    "toInt64",
                    vec![Expr::function(
                        "toUnixTimestamp",
                        vec![Expr::function(unit.start_of_function(), vec![local])],
                    )],
                )
            }
        }
    }

    /// Bucket start in epoch milliseconds.
    pub fn decode_key(&self, raw: &Value) -> Option<i64> {
        let key = as_i64(raw)?;
        match self.interval {
            Interval::Fixed { ms } => key
                .checked_mul(ms)
                .map(|start| start - self.time_zone.offset_ms()),
            Interval::Calendar(_) => key.checked_mul(1000),
        }
    }

    pub fn bucket_start(&self, ms: i64) -> i64 {
        match self.interval {
            Interval::Fixed { ms: step } => {
                let offset = self.time_zone.offset_ms();
                (ms + offset).div_euclid(step) * step - offset
            }
            Interval::Calendar(unit) => time::from_millis(ms)
                .map(|instant| unit.truncate(instant).timestamp_millis())
                .unwrap_or(ms),
        }
    }

    pub fn next_key(&self, key: i64) -> i64 {
        match self.interval {
            Interval::Fixed { ms } => key.saturating_add(ms),
            Interval::Calendar(unit) => time::from_millis(key)
                .map(|instant| unit.advance(instant).timestamp_millis())
                .unwrap_or(i64::MAX),
        }
    }
}

impl IpPrefix {
    pub fn key_expr(&self, field: Expr) -> Option<Expr> {
        if self.prefix_length == 0 {
            return None;
        }
        let key = if self.is_ipv6 {
            let shift = 128 - self.prefix_length.min(128);
            let divisor = 1u128.checked_shl(shift).unwrap_or(0);
            Expr::function(
                "intDiv",
                vec![
                    Expr::function("toUInt128", vec![field]),
                    Expr::raw(divisor.to_string()),
                ],
            )
        } else {
            let shift = 32 - self.prefix_length.min(32);
            Expr::function("intDiv", vec![field, Expr::int(1i64 << shift)])
        };
        Some(key)
    }

    /// Network address and (for IPv4) netmask of a bucket key.
    fn describe(&self, raw: &Value) -> (String, Option<String>) {
        let key = as_u128(raw).unwrap_or(0);
        if self.is_ipv6 {
            let shift = 128 - self.prefix_length.min(128);
            let address = key.checked_shl(shift).unwrap_or(0);
            (Ipv6Addr::from(address).to_string(), None)
        } else {
            let shift = 32 - self.prefix_length.min(32);
            let address = (key as u64).checked_shl(shift).unwrap_or(0) as u32;
            let mask = u64::from(u32::MAX).checked_shl(shift).unwrap_or(0) as u32;
            (
                Ipv4Addr::from(address).to_string(),
                Some(Ipv4Addr::from(mask).to_string()),
            )
        }
    }
}

/// `zoom`, `x` and `y` tile columns of a geo point.
pub fn geotile_columns(field: &str, precision: u32) -> Vec<Expr> {
    let zoom = f64::from(precision);
    let power = || Expr::function("POWER", vec![Expr::int(2), Expr::float(zoom)]);
    let lon = Expr::function("toFloat64", vec![Expr::column(format!("{field}::lon"))]);
    let lat = Expr::function("toFloat64", vec![Expr::column(format!("{field}::lat"))]);

    let x = Expr::function(
        "FLOOR",
        vec![Expr::infix(
            Expr::paren(Expr::infix(
                Expr::paren(Expr::infix(lon, "+", Expr::float(180.0))),
                "/",
                Expr::float(360.0),
            )),
            "*",
            power(),
        )],
    );

    let radians = Expr::function("RADIANS", vec![lat]);
    let log = Expr::function(
        "LOG",
        vec![Expr::infix(
            Expr::function("TAN", vec![radians.clone()]),
            "+",
            Expr::paren(Expr::infix(
                Expr::int(1),
                "/",
                Expr::function("COS", vec![radians]),
            )),
        )],
    );
    let y = Expr::function(
        "FLOOR",
        vec![Expr::infix(
            Expr::infix(
                Expr::paren(Expr::infix(
                    Expr::infix(Expr::int(1), "-", log),
                    "/",
                    Expr::raw("PI()"),
                )),
                "/",
                Expr::float(2.0),
            ),
            "*",
            power(),
        )],
    );

    vec![
        Expr::raw(format!("CAST({zoom:.6} AS Float32)")),
        x,
        y,
    ]
}
