//! Pancake model: an aggregation tree flattened into a chain of layers that
//! one SQL statement answers at once.
//!
//! Layer `i` holds the metrics and pipelines computed at nesting depth `i`
//! and the single bucket aggregation that opens depth `i + 1`. The last
//! layer never has a bucket.

pub mod generator;
pub mod names;
pub mod pipelines;
pub mod render;
pub mod top_hits;
pub mod transformer;

use crate::{
    aggregation::{BucketKind, MetricKind, PipelineKind},
    expr::{Expr, OrderByExpr},
};
use serde_json::Value;

pub use generator::SqlGenerator;
pub use names::NameRegistry;
pub use render::{RenderContext, Renderer};
pub use transformer::PancakeTransformer;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PancakeModel {
    pub layers: Vec<Layer>,
    pub where_clause: Option<Expr>,
    /// Row cap applied before aggregating, set by a top-level `sampler`.
    pub sample_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Layer {
    pub metrics: Vec<MetricAgg>,
    pub pipelines: Vec<PipelineAgg>,
    pub bucket: Option<BucketAgg>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricAgg {
    pub name: String,
    pub internal_name: String,
    pub kind: MetricKind,
    pub columns: Vec<Expr>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketAgg {
    pub name: String,
    /// Ends with `__`; column aliases are appended directly.
    pub internal_name: String,
    pub kind: BucketKind,
    pub columns: Vec<Expr>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<usize>,
    pub keyed: bool,
    pub metadata: Option<Value>,
    pub filter_out_empty_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineAgg {
    pub name: String,
    pub kind: PipelineKind,
    pub metadata: Option<Value>,
}

impl PancakeModel {
    /// Number of bucket levels that add `GROUP BY` columns.
    pub fn grouping_levels(&self) -> usize {
        self.layers
            .iter()
            .filter_map(|layer| layer.bucket.as_ref())
            .filter(|bucket| bucket.kind.has_group_by())
            .count()
    }

    /// The hit-returning metric, if any. At most one per model.
    pub fn hits_metric(&self) -> Option<&MetricAgg> {
        self.layers
            .iter()
            .flat_map(|layer| layer.metrics.iter())
            .find(|metric| metric.kind.returns_hits())
    }
}

impl MetricAgg {
    pub fn column_alias(&self, idx: usize) -> String {
        format!("{}_col_{idx}", self.internal_name)
    }
}

impl BucketAgg {
    pub fn key_alias(&self, idx: usize) -> String {
        format!("{}key_{idx}", self.internal_name)
    }

    pub fn count_alias(&self) -> String {
        format!("{}count", self.internal_name)
    }

    pub fn order_alias(&self, idx: usize) -> String {
        format!("{}order_{idx}", self.internal_name)
    }

    pub fn rank_alias(&self) -> String {
        format!("{}_rank", self.order_alias(1))
    }

    /// Documents of the enclosing bucket, which terms kinds report beside
    /// their own buckets.
    pub fn parent_count_alias(&self) -> Option<String> {
        matches!(self.kind, BucketKind::Terms { .. } | BucketKind::MultiTerms)
            .then(|| format!("{}parent_count", self.internal_name))
    }

    pub fn key_aliases(&self) -> Vec<String> {
        (0..self.columns.len()).map(|idx| self.key_alias(idx)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_aliases_extend_the_internal_name() {
        let bucket = BucketAgg {
            name: "0".into(),
            internal_name: "aggr__0__".into(),
            kind: BucketKind::Terms { significant: false },
            columns: vec![Expr::column("host.name")],
            order_by: Vec::new(),
            limit: Some(3),
            keyed: false,
            metadata: None,
            filter_out_empty_key: true,
        };
        assert_eq!(bucket.key_alias(0), "aggr__0__key_0");
        assert_eq!(bucket.count_alias(), "aggr__0__count");
        assert_eq!(bucket.order_alias(1), "aggr__0__order_1");
        assert_eq!(bucket.rank_alias(), "aggr__0__order_1_rank");
        assert_eq!(
            bucket.parent_count_alias().as_deref(),
            Some("aggr__0__parent_count")
        );
    }
}
