//! Pipeline post-processing over rendered buckets.
//!
//! Parent pipelines (derivative, cumulative_sum, ...) add a value to every
//! bucket of the aggregation that encloses them. Sibling pipelines
//! (avg_bucket, ...) summarise a neighbouring multi-bucket aggregation.
//! Either kind may read another pipeline's output, so each set is evaluated
//! in dependency order.

use super::PipelineAgg;
use crate::aggregation::{
    buckets::BucketData,
    metrics::metric_value,
    pipelines::BucketsPath,
    values::{as_f64, key_string},
};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// Evaluates the parent pipelines of a bucket aggregation, storing each
/// result in the bucket's content.
pub(crate) fn apply_parents(pipelines: &[PipelineAgg], buckets: &mut [BucketData]) {
    let parents: Vec<&PipelineAgg> = pipelines
        .iter()
        .filter(|pipeline| pipeline.kind.op.is_parent())
        .collect();
    let (ordered, cyclic) = dependency_order(&parents);

    for pipeline in ordered {
        let inputs: Vec<Option<f64>> = buckets
            .iter()
            .map(|bucket| bucket_input(bucket, &pipeline.kind.buckets_path))
            .collect();
        let outputs = pipeline.kind.op.apply_parent(&inputs);
        for (bucket, output) in buckets.iter_mut().zip(outputs) {
            if let Some(output) = output {
                bucket
                    .content
                    .insert(pipeline.name.clone(), with_meta(output, pipeline));
            }
        }
    }

    for pipeline in cyclic {
        warn!(pipeline = %pipeline.name, path = %pipeline.kind.buckets_path.raw, "pipeline depends on itself");
        for bucket in buckets.iter_mut() {
            bucket
                .content
                .insert(pipeline.name.clone(), with_meta(json!({ "value": null }), pipeline));
        }
    }
}

/// Evaluates sibling pipelines against the aggregations rendered at the
/// same level.
pub(crate) fn apply_siblings(pipelines: &[PipelineAgg], content: &mut Map<String, Value>) {
    let siblings: Vec<&PipelineAgg> = pipelines
        .iter()
        .filter(|pipeline| !pipeline.kind.op.is_parent())
        .collect();
    let (ordered, cyclic) = dependency_order(&siblings);

    for pipeline in ordered {
        let result = match sibling_inputs(content, &pipeline.kind.buckets_path) {
            Some(inputs) => pipeline.kind.op.apply_sibling(&inputs),
            None => {
                warn!(
                    pipeline = %pipeline.name,
                    path = %pipeline.kind.buckets_path.raw,
                    "buckets_path does not name a multi-bucket aggregation"
                );
                json!({ "value": null })
            }
        };
        content.insert(pipeline.name.clone(), with_meta(result, pipeline));
    }

    for pipeline in cyclic {
        warn!(pipeline = %pipeline.name, path = %pipeline.kind.buckets_path.raw, "pipeline depends on itself");
        content.insert(
            pipeline.name.clone(),
            with_meta(json!({ "value": null }), pipeline),
        );
    }
}

/// Kahn's algorithm over "reads the output of" edges. Pipelines left on a
/// cycle are returned separately.
fn dependency_order<'p>(pipelines: &[&'p PipelineAgg]) -> (Vec<&'p PipelineAgg>, Vec<&'p PipelineAgg>) {
    let index: HashMap<&str, usize> = pipelines
        .iter()
        .enumerate()
        .map(|(idx, pipeline)| (pipeline.name.as_str(), idx))
        .collect();

    let mut indegree = vec![0usize; pipelines.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); pipelines.len()];
    for (idx, pipeline) in pipelines.iter().enumerate() {
        if let Some(&source) = index.get(pipeline.kind.buckets_path.head()) {
            indegree[idx] += 1;
            dependents[source].push(idx);
        }
    }

    let mut ready: VecDeque<usize> = (0..pipelines.len())
        .filter(|idx| indegree[*idx] == 0)
        .collect();
    let mut ordered = Vec::with_capacity(pipelines.len());
    while let Some(idx) = ready.pop_front() {
        ordered.push(idx);
        for &next in &dependents[idx] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    let cyclic = (0..pipelines.len())
        .filter(|idx| indegree[*idx] > 0)
        .map(|idx| pipelines[idx])
        .collect();
    (ordered.into_iter().map(|idx| pipelines[idx]).collect(), cyclic)
}

fn bucket_input(bucket: &BucketData, path: &BucketsPath) -> Option<f64> {
    match path.segments.as_slice() {
        [count] if count == "_count" => Some(bucket.doc_count as f64),
        [name] => bucket
            .content
            .get(name)
            .and_then(|value| metric_value(value, path.property.as_deref())),
        _ => None,
    }
}

/// `(label, value)` per bucket of the aggregation the path starts at.
fn sibling_inputs(content: &Map<String, Value>, path: &BucketsPath) -> Option<Vec<(String, Option<f64>)>> {
    let buckets = content.get(path.head())?.get("buckets")?;
    let rest = &path.segments[1..];
    let value_of = |bucket: &Value| -> Option<f64> {
        match rest {
            [] => bucket.get("doc_count").and_then(as_f64),
            [count] if count == "_count" => bucket.get("doc_count").and_then(as_f64),
            [name] => bucket
                .get(name)
                .and_then(|value| metric_value(value, path.property.as_deref())),
            _ => None,
        }
    };
    let label_of = |bucket: &Value| -> String {
        bucket
            .get("key_as_string")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| bucket.get("key").map(key_string))
            .unwrap_or_default()
    };

    match buckets {
        Value::Array(items) => Some(
            items
                .iter()
                .map(|bucket| (label_of(bucket), value_of(bucket)))
                .collect(),
        ),
        Value::Object(keyed) => Some(
            keyed
                .iter()
                .map(|(label, bucket)| (label.clone(), value_of(bucket)))
                .collect(),
        ),
        _ => None,
    }
}

fn with_meta(mut value: Value, pipeline: &PipelineAgg) -> Value {
    if let (Some(meta), Value::Object(object)) = (&pipeline.metadata, &mut value) {
        object.insert("meta".into(), meta.clone());
    }
    value
}
