//! Result rows back into an aggregation response.
//!
//! Rows arrive as `alias -> value` maps in the order the SQL sorted them.
//! Every layer reads the columns it owns; bucket layers split the rows into
//! runs of equal key values and render the next layer once per run.

use super::{pipelines, BucketAgg, MetricAgg, PancakeModel};
use crate::{
    aggregation::{
        buckets::{BucketContext, BucketData},
        metrics::{MetricInput, ParentBucket},
        values::{as_count, as_i64, is_empty_key},
        BucketKind, MetricKind,
    },
    error::{Result, ServiceError},
};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

/// One result row keyed by column alias.
pub type Row = Map<String, Value>;

static NULL: Value = Value::Null;

pub struct RenderContext<'a> {
    /// Cap on buckets synthesised by histogram gap filling.
    pub max_empty_buckets: usize,
    /// `hits.total`, when the request asked for it. Seeds
    /// `sum_other_doc_count` of top-level terms.
    pub total_hits: Option<u64>,
    /// Set by the caller when the client went away.
    pub cancel: &'a AtomicBool,
}

pub struct Renderer<'a> {
    model: &'a PancakeModel,
    ctx: RenderContext<'a>,
}

impl<'a> Renderer<'a> {
    pub fn new(model: &'a PancakeModel, ctx: RenderContext<'a>) -> Self {
        Self { model, ctx }
    }

    /// The `aggregations` object of the response.
    pub fn render(&self, rows: &[Row]) -> Result<Map<String, Value>> {
        let parent = ParentBucket {
            key_ms: None,
            doc_count: self.ctx.total_hits,
        };
        self.layer(0, rows, parent)
    }

    fn layer(&self, depth: usize, rows: &[Row], parent: ParentBucket) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        let Some(layer) = self.model.layers.get(depth) else {
            return Ok(out);
        };
        self.check_cancelled()?;

        if let Some(bucket) = &layer.bucket {
            if let Some(rendered) = self.bucket(depth, bucket, rows, parent)? {
                out.insert(bucket.name.clone(), rendered);
            }
        }
        for metric in &layer.metrics {
            if metric.kind == MetricKind::TotalHits {
                continue;
            }
            let rendered = render_metric(metric, rows, parent);
            out.insert(metric.name.clone(), with_meta(rendered, &metric.metadata));
        }
        pipelines::apply_siblings(&layer.pipelines, &mut out);
        Ok(out)
    }

    /// `None` when the aggregation produced no buckets and carries no `meta`.
    fn bucket(
        &self,
        depth: usize,
        bucket: &BucketAgg,
        rows: &[Row],
        parent: ParentBucket,
    ) -> Result<Option<Value>> {
        let ctx = BucketContext {
            keyed: bucket.keyed,
            parent_doc_count: parent_count(bucket, rows).or(parent.doc_count),
        };

        let rendered = if bucket.kind.is_combinator() {
            self.combinator(depth, bucket, rows, parent)?
        } else if bucket.kind.has_group_by() {
            let buckets = self.grouped(depth, bucket, rows, parent)?;
            if buckets.is_empty() && bucket.metadata.is_none() {
                return Ok(None);
            }
            bucket.kind.render_buckets(buckets, &ctx)
        } else {
            let doc_count = rows
                .first()
                .map(|row| as_count(cell(row, &bucket.count_alias())))
                .unwrap_or(0);
            let content = self.layer(
                depth + 1,
                rows,
                ParentBucket {
                    key_ms: parent.key_ms,
                    doc_count: Some(doc_count),
                },
            )?;
            let data = BucketData {
                keys: Vec::new(),
                doc_count,
                content,
            };
            match bucket.kind {
                // A zero-length prefix is a single bucket covering every address.
                BucketKind::IpPrefix(_) => {
                    let buckets = if doc_count > 0 { vec![data] } else { Vec::new() };
                    if buckets.is_empty() && bucket.metadata.is_none() {
                        return Ok(None);
                    }
                    bucket.kind.render_buckets(buckets, &ctx)
                }
                _ => bucket.kind.render_single(data),
            }
        };
        Ok(Some(with_meta(rendered, &bucket.metadata)))
    }

    fn combinator(
        &self,
        depth: usize,
        bucket: &BucketAgg,
        rows: &[Row],
        parent: ParentBucket,
    ) -> Result<Value> {
        let count_alias = bucket.count_alias();
        let groups = bucket.kind.combinator_groups();
        let mut rendered = Vec::with_capacity(groups.len());

        for group in groups {
            self.check_cancelled()?;
            let projected: Vec<Row> = rows.iter().map(|row| project(row, &group.prefix)).collect();
            let doc_count = projected
                .first()
                .map(|row| as_count(cell(row, &count_alias)))
                .unwrap_or(0);
            let content = self.layer(
                depth + 1,
                &projected,
                ParentBucket {
                    key_ms: parent.key_ms,
                    doc_count: Some(doc_count),
                },
            )?;
            rendered.push((
                group,
                BucketData {
                    keys: Vec::new(),
                    doc_count,
                    content,
                },
            ));
        }

        Ok(bucket.kind.render_groups(
            rendered,
            &BucketContext {
                keyed: bucket.keyed,
                parent_doc_count: parent.doc_count,
            },
        ))
    }

    fn grouped(
        &self,
        depth: usize,
        bucket: &BucketAgg,
        rows: &[Row],
        parent: ParentBucket,
    ) -> Result<Vec<BucketData>> {
        let key_aliases = bucket.key_aliases();
        let count_alias = bucket.count_alias();
        let child_pipelines = self
            .model
            .layers
            .get(depth + 1)
            .map(|layer| layer.pipelines.as_slice())
            .unwrap_or(&[]);
        // Parent pipelines need every bucket, including empty ones.
        let min_doc_count = if child_pipelines.iter().any(|p| p.kind.op.is_parent()) {
            0
        } else {
            bucket.kind.min_doc_count()
        };

        let mut runs = split_runs(rows, &key_aliases);
        if bucket.filter_out_empty_key {
            if let Some(pos) = runs
                .iter()
                .position(|(keys, _)| keys.iter().any(is_empty_key))
            {
                runs.remove(pos);
            }
        }
        if let Some(limit) = bucket.limit {
            runs.truncate(limit);
        }

        let mut buckets = Vec::with_capacity(runs.len());
        for (raw, run) in runs {
            self.check_cancelled()?;
            let doc_count = run
                .first()
                .map(|row| as_count(cell(row, &count_alias)))
                .unwrap_or(0);
            if doc_count < min_doc_count {
                continue;
            }
            let keys = bucket.kind.decode_keys(&raw);
            let key_ms = match bucket.kind {
                BucketKind::DateHistogram(_) => keys.first().and_then(as_i64),
                _ => parent.key_ms,
            };
            let content = self.layer(
                depth + 1,
                run,
                ParentBucket {
                    key_ms,
                    doc_count: Some(doc_count),
                },
            )?;
            buckets.push(BucketData {
                keys,
                doc_count,
                content,
            });
        }

        if min_doc_count == 0 {
            buckets = bucket.kind.fill_gaps(buckets, self.ctx.max_empty_buckets, || {
                self.check_cancelled()?;
                self.layer(
                    depth + 1,
                    &[],
                    ParentBucket {
                        key_ms: None,
                        doc_count: Some(0),
                    },
                )
            })?;
        }

        pipelines::apply_parents(child_pipelines, &mut buckets);
        Ok(buckets)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.ctx.cancel.load(Ordering::Relaxed) {
            return Err(ServiceError::Cancelled);
        }
        Ok(())
    }
}

/// Value of the hidden document-count metric, if the model has one.
pub fn total_hits(model: &PancakeModel, rows: &[Row]) -> Option<u64> {
    let metric = model
        .layers
        .first()?
        .metrics
        .iter()
        .find(|metric| metric.kind == MetricKind::TotalHits)?;
    Some(
        rows.first()
            .map(|row| as_count(cell(row, &metric.column_alias(0))))
            .unwrap_or(0),
    )
}

/// The bucket's own parent-count column, when it selects one and the rows
/// carry it.
fn parent_count(bucket: &BucketAgg, rows: &[Row]) -> Option<u64> {
    let alias = bucket.parent_count_alias()?;
    match rows.first()?.get(&alias)? {
        Value::Null => None,
        value => Some(as_count(value)),
    }
}

fn render_metric(metric: &MetricAgg, rows: &[Row], parent: ParentBucket) -> Value {
    let aliases: Vec<String> = (0..metric.columns.len())
        .map(|idx| metric.column_alias(idx))
        .collect();
    let values: Vec<Value> = match rows.first() {
        Some(row) => aliases.iter().map(|alias| cell(row, alias).clone()).collect(),
        None => Vec::new(),
    };
    let hits: Vec<Vec<Value>> = if metric.kind.returns_hits() {
        rows.iter()
            .map(|row| aliases.iter().map(|alias| cell(row, alias).clone()).collect::<Vec<_>>())
            // Unmatched outer-join rows carry no document.
            .filter(|hit| hit.iter().any(|value| !value.is_null()))
            .collect()
    } else {
        Vec::new()
    };

    metric.kind.render(&MetricInput {
        values: &values,
        rows: &hits,
        parent,
    })
}

/// Runs of consecutive rows sharing the same key columns.
fn split_runs<'r>(rows: &'r [Row], aliases: &[String]) -> Vec<(Vec<Value>, &'r [Row])> {
    let keys = |row: &Row| -> Vec<Value> {
        aliases.iter().map(|alias| cell(row, alias).clone()).collect()
    };

    let mut runs = Vec::new();
    let mut start = 0;
    while start < rows.len() {
        let current = keys(&rows[start]);
        let mut end = start + 1;
        while end < rows.len() && keys(&rows[end]) == current {
            end += 1;
        }
        runs.push((current, &rows[start..end]));
        start = end;
    }
    runs
}

/// A row as seen from inside one combinator group: the group's prefixed
/// columns shadow the unprefixed names.
fn project(row: &Row, prefix: &str) -> Row {
    if prefix.is_empty() {
        return row.clone();
    }
    let mut projected = row.clone();
    for (alias, value) in row {
        if let Some(stripped) = alias.strip_prefix(prefix) {
            projected.insert(stripped.to_string(), value.clone());
        }
    }
    projected
}

fn cell<'r>(row: &'r Row, alias: &str) -> &'r Value {
    match row.get(alias) {
        Some(value) => value,
        None => {
            error!(column = alias, "result row is missing a column");
            &NULL
        }
    }
}

fn with_meta(mut value: Value, meta: &Option<Value>) -> Value {
    if let (Some(meta), Value::Object(object)) = (meta, &mut value) {
        object.insert("meta".into(), meta.clone());
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregation::parser::{AggregationParser, ParseContext},
        filter::DslFilterTranslator,
        pancake::PancakeTransformer,
        schema::{FieldType, StaticFieldRegistry},
    };
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn model(aggs: Value) -> PancakeModel {
        let registry = StaticFieldRegistry::new()
            .with_column("@timestamp", "timestamp", FieldType::Date)
            .with_field("host.name", FieldType::Keyword)
            .with_field("bytes", FieldType::Long)
            .with_field("status", FieldType::Long);
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let filters = DslFilterTranslator::new(&registry, now);
        let tree = AggregationParser::new(ParseContext {
            registry: &registry,
            filters: &filters,
            now,
            index: "logs",
        })
        .parse_request(&json!({ "aggs": aggs }))
        .unwrap();
        PancakeTransformer::new().transform(tree).unwrap()
    }

    fn rows(values: Value) -> Vec<Row> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row.as_object().unwrap().clone())
            .collect()
    }

    fn render(model: &PancakeModel, rows: &[Row]) -> Result<Map<String, Value>> {
        let cancel = AtomicBool::new(false);
        Renderer::new(
            model,
            RenderContext {
                max_empty_buckets: 100,
                total_hits: Some(10),
                cancel: &cancel,
            },
        )
        .render(rows)
    }

    #[test]
    fn terms_skip_the_empty_key_and_stop_at_size() {
        let model = model(json!({ "0": { "terms": { "field": "host.name", "size": 2 } } }));
        let rows = rows(json!([
            { "aggr__0__key_0": "a", "aggr__0__count": 5 },
            { "aggr__0__key_0": null, "aggr__0__count": 3 },
            { "aggr__0__key_0": "b", "aggr__0__count": 1 },
        ]));
        let rendered = render(&model, &rows).unwrap();
        assert_eq!(
            Value::Object(rendered),
            json!({ "0": {
                "doc_count_error_upper_bound": 0,
                "sum_other_doc_count": 4,
                "buckets": [
                    { "key": "a", "doc_count": 5 },
                    { "key": "b", "doc_count": 1 },
                ],
            }})
        );
    }

    #[test]
    fn terms_report_other_documents_from_the_parent_count() {
        let model = model(json!({ "h": { "terms": { "field": "host.name", "size": 1 } } }));
        let rows = rows(json!([
            { "aggr__h__parent_count": 10, "aggr__h__key_0": "a", "aggr__h__count": 5 },
            { "aggr__h__parent_count": 10, "aggr__h__key_0": "b", "aggr__h__count": 3 },
        ]));
        let cancel = AtomicBool::new(false);
        let rendered = Renderer::new(
            &model,
            RenderContext {
                max_empty_buckets: 100,
                total_hits: None,
                cancel: &cancel,
            },
        )
        .render(&rows)
        .unwrap();
        assert_eq!(rendered["h"]["sum_other_doc_count"], json!(5));
        assert_eq!(rendered["h"]["buckets"], json!([{ "key": "a", "doc_count": 5 }]));
    }

    #[test]
    fn date_histogram_keys_are_interval_multiples() {
        let model = model(json!({ "0": {
            "date_histogram": { "field": "@timestamp", "fixed_interval": "30s", "min_doc_count": 1 }
        }}));
        let rows = rows(json!([{ "aggr__0__key_0": 56962398, "aggr__0__count": 4 }]));
        let rendered = render(&model, &rows).unwrap();
        assert_eq!(
            rendered["0"]["buckets"],
            json!([{
                "key": 56962398i64 * 30000,
                "key_as_string": "2024-02-25T14:39:00.000",
                "doc_count": 4,
            }])
        );
    }

    #[test]
    fn nested_metrics_read_their_own_bucket_rows() {
        let model = model(json!({ "hosts": {
            "terms": { "field": "host.name" },
            "aggs": { "total": { "sum": { "field": "bytes" } } },
        }}));
        let rows = rows(json!([
            { "aggr__hosts__key_0": "a", "aggr__hosts__count": 2, "metric__hosts__total_col_0": 10.0 },
            { "aggr__hosts__key_0": "b", "aggr__hosts__count": 1, "metric__hosts__total_col_0": 4.0 },
        ]));
        let rendered = render(&model, &rows).unwrap();
        let buckets = rendered["hosts"]["buckets"].as_array().unwrap();
        assert_eq!(buckets[0]["total"], json!({ "value": 10.0 }));
        assert_eq!(buckets[1]["total"], json!({ "value": 4.0 }));
    }

    #[test]
    fn filters_render_one_bucket_per_group() {
        let model = model(json!({
            "f": { "filters": { "filters": {
                "errors": { "term": { "status": 500 } },
                "ok": { "term": { "status": 200 } },
            }}},
            "m": { "sum": { "field": "bytes" } },
        }));
        let rows = rows(json!([{
            "filter_0__aggr__f__count": 3,
            "filter_1__aggr__f__count": 7,
            "metric__m_col_0": 12.0,
        }]));
        let rendered = render(&model, &rows).unwrap();
        assert_eq!(
            rendered["f"],
            json!({ "buckets": { "errors": { "doc_count": 3 }, "ok": { "doc_count": 7 } } })
        );
        assert_eq!(rendered["m"], json!({ "value": 12.0 }));
    }

    #[test]
    fn empty_bucket_aggregation_is_omitted_unless_it_has_meta() {
        let plain = model(json!({ "0": { "terms": { "field": "host.name" } } }));
        assert!(render(&plain, &[]).unwrap().is_empty());

        let with_meta = model(json!({ "0": { "terms": { "field": "host.name" }, "meta": { "owner": "ops" } } }));
        let rendered = render(&with_meta, &[]).unwrap();
        assert_eq!(rendered["0"]["meta"], json!({ "owner": "ops" }));
        assert_eq!(rendered["0"]["buckets"], json!([]));
    }

    #[test]
    fn missing_columns_render_as_null() {
        let model = model(json!({ "avg": { "avg": { "field": "bytes" } } }));
        let rows = rows(json!([{ "unrelated": 1 }]));
        let rendered = render(&model, &rows).unwrap();
        assert_eq!(rendered["avg"], json!({ "value": null }));
    }

    #[test]
    fn cancellation_stops_rendering() {
        let model = model(json!({ "0": { "terms": { "field": "host.name" } } }));
        let rows = rows(json!([{ "aggr__0__key_0": "a", "aggr__0__count": 1 }]));
        let cancel = AtomicBool::new(true);
        let err = Renderer::new(
            &model,
            RenderContext {
                max_empty_buckets: 100,
                total_hits: None,
                cancel: &cancel,
            },
        )
        .render(&rows)
        .unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled));
    }

    #[test]
    fn total_hits_reads_the_hidden_metric() {
        let mut model = model(json!({ "0": { "terms": { "field": "host.name" } } }));
        let internal = "metric____aggql_total_hits".to_string();
        model.layers[0].metrics.push(MetricAgg {
            name: crate::aggregation::TOTAL_HITS_METRIC.into(),
            internal_name: internal.clone(),
            kind: MetricKind::TotalHits,
            columns: vec![crate::expr::Expr::count_all()],
            metadata: None,
        });
        let rows = rows(json!([{ "metric____aggql_total_hits_col_0": "42" }]));
        assert_eq!(total_hits(&model, &rows), Some(42));
        assert_eq!(total_hits(&model, &[]), Some(0));
    }
}
