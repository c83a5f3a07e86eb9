//! Aggregation tree: the parsed, typed form of a request's `aggs` section.
//!
//! Each node is tagged with exactly one of three categories. Metric and
//! pipeline nodes are leaves; bucket nodes carry the children evaluated
//! once per bucket.

pub mod buckets;
pub mod metrics;
pub mod parser;
pub mod pipelines;
pub mod values;

use crate::expr::{Expr, OrderByExpr};
use serde_json::Value;

pub use buckets::BucketKind;
pub use metrics::MetricKind;
pub use parser::{AggregationParser, ParseContext};
pub use pipelines::PipelineKind;

/// Name of the hidden metric added for `track_total_hits`.
pub const TOTAL_HITS_METRIC: &str = "__aggql_total_hits";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Metric,
    Bucket,
    Pipeline,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryType {
    Metric(MetricKind),
    Bucket(BucketKind),
    Pipeline(PipelineKind),
}

impl QueryType {
    pub fn category(&self) -> Category {
        match self {
            QueryType::Metric(_) => Category::Metric,
            QueryType::Bucket(_) => Category::Bucket,
            QueryType::Pipeline(_) => Category::Pipeline,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueryType::Metric(kind) => kind.name(),
            QueryType::Bucket(kind) => kind.name(),
            QueryType::Pipeline(kind) => kind.name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationNode {
    pub name: String,
    pub query_type: QueryType,
    pub children: Vec<AggregationNode>,
    /// SQL expressions producing this node's value(s): the grouping keys of
    /// a bucket aggregation or the result columns of a metric.
    pub selected_columns: Vec<Expr>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<usize>,
    pub keyed: bool,
    pub metadata: Option<Value>,
    /// Set when documents lacking the grouping field produce a null key that
    /// must be dropped while rendering.
    pub filter_out_empty_key: bool,
}

impl AggregationNode {
    pub fn new(name: impl Into<String>, query_type: QueryType) -> Self {
        Self {
            name: name.into(),
            query_type,
            children: Vec::new(),
            selected_columns: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            keyed: false,
            metadata: None,
            filter_out_empty_key: false,
        }
    }

    pub fn category(&self) -> Category {
        self.query_type.category()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregationTree {
    pub where_clause: Option<Expr>,
    pub children: Vec<AggregationNode>,
    pub track_total_hits: bool,
}

impl AggregationTree {
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}
