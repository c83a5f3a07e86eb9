//! Aggregation tree to pancake model.
//!
//! Structural problems found here abort the whole translation: a partial
//! model would produce SQL that answers a different question.

use super::{BucketAgg, Layer, MetricAgg, NameRegistry, PancakeModel, PipelineAgg};
use crate::{
    aggregation::{
        AggregationNode, AggregationTree, BucketKind, Category, MetricKind, QueryType,
        TOTAL_HITS_METRIC,
    },
    error::{Result, ServiceError},
    expr::Expr,
};
use tracing::debug;

#[derive(Debug, Default)]
pub struct PancakeTransformer {
    names: NameRegistry,
    hits_metric: Option<String>,
}

impl PancakeTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform(mut self, tree: AggregationTree) -> Result<PancakeModel> {
        let mut model = PancakeModel {
            layers: Vec::new(),
            where_clause: tree.where_clause,
            sample_limit: None,
        };
        if tree.children.is_empty() {
            return Ok(model);
        }

        self.build_layers(tree.children, &[], false, &mut model.layers)?;

        // Hits are joined back per group of the deepest level only.
        let inner = model.layers.len().saturating_sub(1);
        if let Some(metric) = model.layers[..inner]
            .iter()
            .flat_map(|layer| layer.metrics.iter())
            .find(|metric| metric.kind.returns_hits())
        {
            return Err(ServiceError::unsupported(format!(
                "{} '{}' must be in the innermost bucket level",
                metric.kind.name(),
                metric.name
            )));
        }

        if let Some(BucketAgg {
            kind: BucketKind::Sampler { shard_size },
            ..
        }) = model.layers.first().and_then(|layer| layer.bucket.as_ref())
        {
            model.sample_limit = Some(*shard_size);
        }

        if tree.track_total_hits {
            let path = vec![TOTAL_HITS_METRIC.to_string()];
            let total = MetricAgg {
                name: TOTAL_HITS_METRIC.to_string(),
                internal_name: self.names.metric(&path),
                kind: MetricKind::TotalHits,
                columns: vec![Expr::count_all()],
                metadata: None,
            };
            if let Some(first) = model.layers.first_mut() {
                first.metrics.push(total);
            }
        }

        debug!(layers = model.layers.len(), "built pancake model");
        Ok(model)
    }

    fn build_layers(
        &mut self,
        mut nodes: Vec<AggregationNode>,
        path: &[String],
        after_combinator: bool,
        layers: &mut Vec<Layer>,
    ) -> Result<()> {
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        let mut layer = Layer::default();
        let mut next: Option<(Vec<String>, Vec<AggregationNode>, bool)> = None;

        for node in nodes {
            let mut node_path = path.to_vec();
            node_path.push(node.name.clone());

            match node.category() {
                Category::Metric => {
                    if !node.children.is_empty() {
                        return Err(ServiceError::unsupported(format!(
                            "metric aggregation '{}' cannot have sub-aggregations",
                            node.name
                        )));
                    }
                    layer.metrics.push(self.metric(node, &node_path, after_combinator)?);
                }
                Category::Pipeline => {
                    if !node.children.is_empty() {
                        return Err(ServiceError::unsupported(format!(
                            "pipeline aggregation '{}' cannot have sub-aggregations",
                            node.name
                        )));
                    }
                    let QueryType::Pipeline(kind) = node.query_type else {
                        continue;
                    };
                    layer.pipelines.push(PipelineAgg {
                        name: node.name,
                        kind,
                        metadata: node.metadata,
                    });
                }
                Category::Bucket => {
                    if let Some(existing) = &layer.bucket {
                        return Err(ServiceError::unsupported(format!(
                            "sibling bucket aggregations '{}' and '{}' cannot share one query",
                            existing.name, node.name
                        )));
                    }
                    let QueryType::Bucket(kind) = node.query_type else {
                        continue;
                    };
                    if after_combinator
                        && !(kind.is_combinator() || kind.is_sampler() || kind.is_histogram())
                    {
                        return Err(ServiceError::unsupported(format!(
                            "{} aggregation '{}' cannot be nested under filter or range buckets",
                            kind.name(),
                            node.name
                        )));
                    }
                    let combinator = kind.is_combinator();
                    layer.bucket = Some(BucketAgg {
                        name: node.name,
                        internal_name: self.names.bucket(&node_path),
                        kind,
                        columns: node.selected_columns,
                        order_by: node.order_by,
                        limit: node.limit,
                        keyed: node.keyed,
                        metadata: node.metadata,
                        filter_out_empty_key: node.filter_out_empty_key,
                    });
                    next = Some((node_path, node.children, after_combinator || combinator));
                }
            }
        }

        layers.push(layer);
        match next {
            Some((path, children, after_combinator)) => {
                self.build_layers(children, &path, after_combinator, layers)
            }
            None => Ok(()),
        }
    }

    fn metric(
        &mut self,
        node: AggregationNode,
        path: &[String],
        after_combinator: bool,
    ) -> Result<MetricAgg> {
        let QueryType::Metric(kind) = node.query_type else {
            return Err(ServiceError::unsupported(format!(
                "'{}' is not a metric aggregation",
                node.name
            )));
        };

        let internal_name = if kind.returns_hits() {
            if after_combinator {
                return Err(ServiceError::unsupported(format!(
                    "{} '{}' cannot be nested under filter or range buckets",
                    kind.name(),
                    node.name
                )));
            }
            if let Some(previous) = &self.hits_metric {
                return Err(ServiceError::unsupported(format!(
                    "only one top_hits/top_metrics aggregation per request, found '{previous}' and '{}'",
                    node.name
                )));
            }
            self.hits_metric = Some(node.name.clone());
            self.names.hits(path)
        } else {
            self.names.metric(path)
        };

        Ok(MetricAgg {
            name: node.name,
            internal_name,
            kind,
            columns: node.selected_columns,
            metadata: node.metadata,
        })
    }
}
