//! Pancake model to one `SelectCommand`.
//!
//! Every layer contributes columns to the same grouping select. Metrics of a
//! layer that still has grouping levels below it are computed per innermost
//! group and merged over their own partition with window functions, so all
//! nesting levels come back in one pass. Bucket sizes are enforced with
//! `dense_rank()` per level.

use super::{top_hits, BucketAgg, PancakeModel};
use crate::{
    aggregation::buckets::CombinatorGroup,
    error::{Result, ServiceError},
    expr::{
        passes::is_count, Expr, FunctionExpr, OrderByExpr, Rewriter, SelectCommand,
        WindowFunction,
    },
};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A `GROUP BY` expression and the alias its value is selected under.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GroupBy {
    pub expr: Expr,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Projection {
    pub expr: Expr,
    pub alias: String,
}

impl Projection {
    fn new(expr: Expr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: alias.into(),
        }
    }

    fn aliased(&self) -> Expr {
        Expr::aliased(self.expr.clone(), self.alias.clone())
    }

    fn reference(&self) -> Expr {
        Expr::alias_ref(self.alias.clone())
    }
}

struct Combinator {
    /// Index of the first select column the groups apply to.
    first_column: usize,
    groups: Vec<CombinatorGroup>,
}

#[derive(Default)]
struct Parts {
    columns: Vec<Projection>,
    group_bys: Vec<GroupBy>,
    rank_columns: Vec<Projection>,
    rank_wheres: Vec<Expr>,
    rank_order_bys: Vec<OrderByExpr>,
    combinators: Vec<Combinator>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqlGenerator;

impl SqlGenerator {
    pub fn generate(&self, model: &PancakeModel) -> Result<SelectCommand> {
        let levels = model.grouping_levels();
        let folded = folded_filter(model);
        let where_clause = match &folded {
            Some(predicate) => Expr::and(model.where_clause.clone().into_iter().chain([predicate.clone()])),
            None => model.where_clause.clone(),
        };

        let mut parts = Parts::default();
        let mut levels_so_far = 0usize;

        for (depth, layer) in model.layers.iter().enumerate() {
            for metric in &layer.metrics {
                if metric.kind.returns_hits() {
                    continue;
                }
                let has_more = levels_so_far < levels;
                let partition = alias_refs(&parts.group_bys);
                for (idx, column) in metric.columns.iter().enumerate() {
                    let expr = if has_more {
                        accumulate(column, &partition)?
                    } else {
                        column.clone()
                    };
                    parts.columns.push(Projection::new(expr, metric.column_alias(idx)));
                }
            }

            let Some(bucket) = &layer.bucket else {
                continue;
            };
            if bucket.kind.is_combinator() && !(depth == 0 && folded.is_some()) {
                parts.combinators.push(Combinator {
                    first_column: parts.columns.len(),
                    groups: bucket.kind.combinator_groups(),
                });
            }
            if bucket.kind.has_group_by() {
                levels_so_far += 1;
            }
            parts.bucket(bucket, levels_so_far < levels)?;
        }

        let combinator_wheres = parts.apply_combinators()?;

        let mut select = if levels <= 1 {
            let limit = model
                .layers
                .iter()
                .filter_map(|layer| layer.bucket.as_ref())
                .filter(|bucket| bucket.kind.has_group_by())
                .filter_map(|bucket| bucket.limit.map(|limit| (limit, bucket.filter_out_empty_key)))
                .last()
                .map(|(limit, filter_out)| if filter_out && limit != 0 { limit + 1 } else { limit });
            let order_by = match parts.rank_columns.first().map(|rank| &rank.expr) {
                Some(Expr::Window(window)) => window.order_by.clone(),
                _ => Vec::new(),
            };
            parts.rank_columns.clear();

            let (from, where_clause) = source(model, where_clause.clone());
            SelectCommand {
                columns: parts.columns.iter().map(Projection::aliased).collect(),
                from: Some(Box::new(from)),
                where_clause: where_clause.map(Box::new),
                group_by: parts.group_bys.iter().map(|group| group.expr.clone()).collect(),
                order_by,
                limit,
                ..SelectCommand::default()
            }
        } else {
            let (from, inner_where) = source(model, where_clause.clone());
            let grouping = SelectCommand {
                columns: parts.columns.iter().map(Projection::aliased).collect(),
                from: Some(Box::new(from)),
                where_clause: inner_where.map(Box::new),
                group_by: parts.group_bys.iter().map(|group| group.expr.clone()).collect(),
                ..SelectCommand::default()
            };
            let ranking = SelectCommand::new(
                parts
                    .columns
                    .iter()
                    .map(Projection::reference)
                    .chain(parts.rank_columns.iter().map(Projection::aliased))
                    .collect(),
                Expr::Select(Box::new(grouping)),
            );
            let mut outer = SelectCommand::new(
                parts.columns.iter().map(Projection::reference).collect(),
                Expr::Select(Box::new(ranking)),
            )
            .with_where(Expr::and(parts.rank_wheres.clone()));
            outer.order_by = parts.rank_order_bys.clone();
            outer
        };

        if let Some(hits) = model.hits_metric() {
            select
                .columns
                .extend(parts.rank_columns.iter().map(Projection::reference));
            select = top_hits::join_hits(
                hits,
                &top_hits::JoinInput {
                    group_bys: &parts.group_bys,
                    columns: &parts.columns,
                    combinator_wheres: &combinator_wheres,
                    where_clause: where_clause.as_ref(),
                },
                select,
            )?;
        }

        debug!(
            levels,
            combinators = parts.combinators.len(),
            "generated aggregation query"
        );
        Ok(select)
    }
}

impl Parts {
    fn bucket(&mut self, bucket: &BucketAgg, has_more: bool) -> Result<()> {
        let previous = self.group_bys.clone();
        let mut added = Vec::new();

        if let Some(alias) = bucket.parent_count_alias() {
            let parent_count = WindowFunction::new(
                "sum",
                vec![Expr::count_all()],
                alias_refs(&previous),
            );
            self.columns
                .push(Projection::new(Expr::Window(parent_count), alias));
        }

        if bucket.kind.has_group_by() {
            for (idx, column) in bucket.columns.iter().enumerate() {
                let alias = bucket.key_alias(idx);
                self.columns.push(Projection::new(column.clone(), alias.clone()));
                added.push(GroupBy {
                    expr: column.clone(),
                    alias,
                });
            }
        }

        let all: Vec<GroupBy> = previous.iter().chain(added.iter()).cloned().collect();
        let count = if has_more {
            Expr::Window(WindowFunction::new(
                "sum",
                vec![Expr::count_all()],
                alias_refs(&all),
            ))
        } else {
            Expr::count_all()
        };
        self.columns.push(Projection::new(count, bucket.count_alias()));

        if !bucket.kind.has_group_by() || bucket.order_by.is_empty() {
            return Ok(());
        }

        let mut rank_order: Vec<OrderByExpr> = Vec::with_capacity(bucket.order_by.len() + added.len());
        for (idx, order) in bucket.order_by.iter().enumerate() {
            let known = if *order.expr == Expr::count_all() {
                Some(bucket.count_alias())
            } else {
                all.iter()
                    .find(|group| group.expr == *order.expr)
                    .map(|group| group.alias.clone())
            };
            let alias = match known {
                Some(alias) => alias,
                None => {
                    let alias = bucket.order_alias(bucket.columns.len() + idx);
                    let expr = if has_more && order.expr.as_column().is_none() {
                        accumulate(&order.expr, &alias_refs(&all))?
                    } else {
                        (*order.expr).clone()
                    };
                    self.columns.push(Projection::new(expr, alias.clone()));
                    alias
                }
            };
            rank_order.push(OrderByExpr::new(Expr::alias_ref(alias), order.direction));
        }
        for group in &added {
            let reference = Expr::alias_ref(group.alias.clone());
            if !rank_order.iter().any(|order| *order.expr == reference) {
                rank_order.push(OrderByExpr::asc(reference));
            }
        }

        let mut rank = WindowFunction::new("dense_rank", Vec::new(), alias_refs(&previous));
        rank.order_by = rank_order;
        let rank_alias = bucket.rank_alias();

        if let Some(limit) = bucket.limit {
            let limit = if bucket.filter_out_empty_key { limit + 1 } else { limit };
            self.rank_wheres.push(Expr::infix(
                Expr::alias_ref(rank_alias.clone()),
                "<=",
                Expr::int(limit as i64),
            ));
        }
        self.rank_order_bys
            .push(OrderByExpr::asc(Expr::alias_ref(rank_alias.clone())));
        self.rank_columns
            .push(Projection::new(Expr::Window(rank), rank_alias));
        self.group_bys.extend(added);
        Ok(())
    }

    /// Clones the columns after each combinator once per group, innermost
    /// combinator first, and returns every group predicate.
    fn apply_combinators(&mut self) -> Result<Vec<Expr>> {
        let mut renames: Vec<(String, String)> = self
            .columns
            .iter()
            .map(|column| (column.alias.clone(), column.alias.clone()))
            .collect();
        let mut wheres = Vec::new();
        let combinators = std::mem::take(&mut self.combinators);

        for combinator in combinators.iter().rev() {
            let after = self.columns.split_off(combinator.first_column.min(self.columns.len()));
            let targets: HashSet<String> = after.iter().map(|column| column.alias.clone()).collect();

            for group in &combinator.groups {
                wheres.push(group.predicate.clone());
                let mut prefixer = AliasPrefixer {
                    prefix: &group.prefix,
                    targets: &targets,
                };
                for column in &after {
                    let expr = if self.group_bys.iter().any(|group| group.expr == column.expr) {
                        column.expr.clone()
                    } else {
                        add_if(&column.expr, &group.predicate)?
                    };
                    self.columns.push(Projection::new(
                        expr.rewrite(&mut prefixer),
                        format!("{}{}", group.prefix, column.alias),
                    ));
                }
            }

            // Rankings and group aliases follow the first group's columns.
            if let Some(first) = combinator.groups.first() {
                for (_, current) in renames.iter_mut() {
                    if targets.contains(current.as_str()) {
                        *current = format!("{}{current}", first.prefix);
                    }
                }
            }
        }

        self.combinators = combinators;

        let renames: HashMap<String, String> = renames
            .into_iter()
            .filter(|(original, current)| original != current)
            .collect();
        if !renames.is_empty() {
            let mut renamer = AliasRenamer { renames: &renames };
            for group in &mut self.group_bys {
                if let Some(current) = renames.get(&group.alias) {
                    group.alias = current.clone();
                }
            }
            for rank in &mut self.rank_columns {
                rank.expr = rank.expr.rewrite(&mut renamer);
            }
        }
        Ok(wheres)
    }
}

/// A top-level `filter` with nothing else computed beside it is just an
/// extra `WHERE` condition.
fn folded_filter(model: &PancakeModel) -> Option<Expr> {
    let first = model.layers.first()?;
    match &first.bucket {
        Some(BucketAgg {
            kind: crate::aggregation::BucketKind::Filter { predicate },
            ..
        }) if first.metrics.is_empty() && first.pipelines.is_empty() => Some(predicate.clone()),
        _ => None,
    }
}

/// `FROM` target and the `WHERE` clause left for the grouping select.
fn source(model: &PancakeModel, where_clause: Option<Expr>) -> (Expr, Option<Expr>) {
    match model.sample_limit {
        Some(limit) => {
            let mut sample = SelectCommand::new(vec![Expr::wildcard()], Expr::table_placeholder())
                .with_where(where_clause);
            sample.limit = Some(limit);
            (Expr::Select(Box::new(sample)), None)
        }
        None => (Expr::table_placeholder(), where_clause),
    }
}

fn alias_refs(group_bys: &[GroupBy]) -> Vec<Expr> {
    group_bys
        .iter()
        .map(|group| Expr::alias_ref(group.alias.clone()))
        .collect()
}

/// Rewrites a per-group aggregate so that its value is merged over the
/// enclosing partition.
pub(crate) fn accumulate(expr: &Expr, partition: &[Expr]) -> Result<Expr> {
    match expr {
        Expr::Function(function) => {
            let window = match function.name.as_str() {
                "sum" | "sumOrNull" | "min" | "max" | "minOrNull" | "maxOrNull" => {
                    WindowFunction::new(function.name.clone(), vec![expr.clone()], partition.to_vec())
                }
                "count" | "countIf" => {
                    WindowFunction::new("sum", vec![expr.clone()], partition.to_vec())
                }
                "avg" | "avgOrNull" | "varPop" | "varSamp" | "stddevPop" | "stddevSamp" | "uniq" => {
                    WindowFunction::new(
                        format!("{}Merge", function.name),
                        vec![Expr::function(
                            format!("{}State", function.name),
                            function.args.clone(),
                        )],
                        partition.to_vec(),
                    )
                }
                _ => return Err(not_mergeable(expr)),
            };
            Ok(Expr::Window(window))
        }
        Expr::MultiFunction(function) if function.name == "quantiles" => {
            let mut window = WindowFunction::new(
                "quantilesMerge",
                vec![Expr::multi_function(
                    "quantilesState",
                    function.params.clone(),
                    function.args.clone(),
                )],
                partition.to_vec(),
            );
            window.params = function.params.clone();
            Ok(Expr::Window(window))
        }
        Expr::Infix(infix) => Ok(Expr::infix(
            accumulate(&infix.left, partition)?,
            infix.op.clone(),
            accumulate(&infix.right, partition)?,
        )),
        Expr::Literal(_) => Ok(expr.clone()),
        _ => Err(not_mergeable(expr)),
    }
}

fn not_mergeable(expr: &Expr) -> ServiceError {
    ServiceError::unsupported(format!(
        "cannot merge {} across nested buckets",
        expr.to_sql()
    ))
}

/// Restricts an aggregate to the rows matching `predicate` with ClickHouse's
/// `-If` combinator.
pub(crate) fn add_if(expr: &Expr, predicate: &Expr) -> Result<Expr> {
    match expr {
        Expr::Function(function) if is_count(function) => {
            Ok(Expr::function("countIf", vec![predicate.clone()]))
        }
        Expr::Function(function) => {
            let (name, args) = conditional(&function.name, &function.args, predicate);
            Ok(Expr::Function(FunctionExpr { name, args }))
        }
        Expr::MultiFunction(function) => {
            let (name, args) = conditional(&function.name, &function.args, predicate);
            Ok(Expr::multi_function(name, function.params.clone(), args))
        }
        Expr::Window(window) => {
            let args = window
                .args
                .iter()
                .map(|arg| add_if(arg, predicate))
                .collect::<Result<Vec<_>>>()?;
            // The merge has to name the same function as the state it reads.
            let name = match window.name.strip_suffix("Merge") {
                Some(base) => format!("{}Merge", conditional_name(base).0),
                None => window.name.clone(),
            };
            Ok(Expr::Window(WindowFunction {
                name,
                params: window.params.clone(),
                args,
                partition_by: window.partition_by.clone(),
                order_by: window.order_by.clone(),
            }))
        }
        Expr::Infix(infix) => Ok(Expr::infix(
            add_if(&infix.left, predicate)?,
            infix.op.clone(),
            add_if(&infix.right, predicate)?,
        )),
        Expr::Literal(_) => Ok(expr.clone()),
        _ => Err(ServiceError::unsupported(format!(
            "cannot restrict {} to a filter or range bucket",
            expr.to_sql()
        ))),
    }
}

/// `sumOrNull` -> `sumOrNullIf`, `avgState` -> `avgIfState`. The flag is set
/// when the function already takes a condition.
fn conditional_name(name: &str) -> (String, bool) {
    if let Some(base) = name.strip_suffix("State") {
        let (base, conditional) = conditional_name(base);
        return (format!("{base}State"), conditional);
    }
    if name.ends_with("If") {
        (name.to_string(), true)
    } else {
        (format!("{name}If"), false)
    }
}

fn conditional(name: &str, args: &[Expr], predicate: &Expr) -> (String, Vec<Expr>) {
    let (name, already) = conditional_name(name);
    let mut args = args.to_vec();
    match args.last_mut() {
        Some(last) if already => {
            *last = Expr::infix(last.clone(), "AND", predicate.clone());
        }
        _ => args.push(predicate.clone()),
    }
    (name, args)
}

/// Points alias references at a combinator group's copies.
struct AliasPrefixer<'a> {
    prefix: &'a str,
    targets: &'a HashSet<String>,
}

impl Rewriter for AliasPrefixer<'_> {
    fn alias_ref(&mut self, alias: &str) -> Expr {
        if self.targets.contains(alias) {
            Expr::alias_ref(format!("{}{alias}", self.prefix))
        } else {
            Expr::alias_ref(alias)
        }
    }
}

struct AliasRenamer<'a> {
    renames: &'a HashMap<String, String>,
}

impl Rewriter for AliasRenamer<'_> {
    fn alias_ref(&mut self, alias: &str) -> Expr {
        match self.renames.get(alias) {
            Some(renamed) => Expr::alias_ref(renamed.clone()),
            None => Expr::alias_ref(alias),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregation::{
            buckets::{BucketKind, Histogram},
            MetricKind, PipelineKind,
        },
        expr::passes::PlaceholderSubstitution,
        pancake::{Layer, MetricAgg},
    };
    use pretty_assertions::assert_eq;

    fn terms(internal: &str, field: &str, limit: usize) -> BucketAgg {
        BucketAgg {
            name: internal.trim_start_matches("aggr__").trim_end_matches("__").into(),
            internal_name: internal.into(),
            kind: BucketKind::Terms { significant: false },
            columns: vec![Expr::column(field)],
            order_by: vec![OrderByExpr::desc(Expr::count_rows())],
            limit: Some(limit),
            keyed: false,
            metadata: None,
            filter_out_empty_key: true,
        }
    }

    fn filters(internal: &str, count: usize) -> BucketAgg {
        let filters = (0..count)
            .map(|idx| {
                (
                    format!("f{idx}"),
                    Expr::infix(Expr::column("status"), "=", Expr::int(idx as i64)),
                )
            })
            .collect();
        BucketAgg {
            name: internal.into(),
            internal_name: internal.into(),
            kind: BucketKind::Filters {
                filters,
                other_bucket_key: None,
            },
            columns: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            keyed: false,
            metadata: None,
            filter_out_empty_key: false,
        }
    }

    fn avg(internal: &str, field: &str) -> MetricAgg {
        MetricAgg {
            name: internal.into(),
            internal_name: internal.into(),
            kind: MetricKind::SingleValue {
                op: crate::aggregation::metrics::SingleValue::Avg,
                date: false,
            },
            columns: vec![Expr::function("avgOrNull", vec![Expr::column(field)])],
            metadata: None,
        }
    }

    fn layer(metrics: Vec<MetricAgg>, bucket: Option<BucketAgg>) -> Layer {
        Layer {
            metrics,
            pipelines: Vec::new(),
            bucket,
        }
    }

    fn sql(model: &PancakeModel) -> String {
        let select = SqlGenerator.generate(model).unwrap();
        PlaceholderSubstitution::apply("logs", &select).to_sql()
    }

    #[test]
    fn single_terms_is_one_flat_select() {
        let model = PancakeModel {
            layers: vec![layer(Vec::new(), Some(terms("aggr__0__", "host.name", 3))), Layer::default()],
            ..PancakeModel::default()
        };
        assert_eq!(
            sql(&model),
            r#"SELECT sum(count(*)) OVER () AS aggr__0__parent_count, "host.name" AS aggr__0__key_0, count(*) AS aggr__0__count, count() AS aggr__0__order_1 FROM logs GROUP BY "host.name" ORDER BY aggr__0__order_1 DESC, aggr__0__key_0 ASC LIMIT 4"#
        );
    }

    #[test]
    fn nested_terms_use_rank_filter_selects() {
        let model = PancakeModel {
            layers: vec![
                layer(Vec::new(), Some(terms("aggr__a__", "host.name", 2))),
                layer(vec![avg("metric__a__m", "bytes")], Some(terms("aggr__a__b__", "os", 5))),
                Layer::default(),
            ],
            ..PancakeModel::default()
        };
        let generated = sql(&model);
        assert_eq!(
            generated,
            concat!(
                "SELECT aggr__a__parent_count, aggr__a__key_0, aggr__a__count, aggr__a__order_1, metric__a__m_col_0, ",
                "aggr__a__b__parent_count, aggr__a__b__key_0, aggr__a__b__count, aggr__a__b__order_1 ",
                "FROM (SELECT aggr__a__parent_count, aggr__a__key_0, aggr__a__count, aggr__a__order_1, metric__a__m_col_0, ",
                "aggr__a__b__parent_count, aggr__a__b__key_0, aggr__a__b__count, aggr__a__b__order_1, ",
                "dense_rank() OVER (ORDER BY aggr__a__order_1 DESC, aggr__a__key_0 ASC) AS aggr__a__order_1_rank, ",
                "dense_rank() OVER (PARTITION BY aggr__a__key_0 ORDER BY aggr__a__b__order_1 DESC, aggr__a__b__key_0 ASC) AS aggr__a__b__order_1_rank ",
                "FROM (SELECT sum(count(*)) OVER () AS aggr__a__parent_count, \"host.name\" AS aggr__a__key_0, ",
                "sum(count(*)) OVER (PARTITION BY aggr__a__key_0) AS aggr__a__count, ",
                "sum(count()) OVER (PARTITION BY aggr__a__key_0) AS aggr__a__order_1, ",
                "avgOrNullMerge(avgOrNullState(\"bytes\")) OVER (PARTITION BY aggr__a__key_0) AS metric__a__m_col_0, ",
                "sum(count(*)) OVER (PARTITION BY aggr__a__key_0) AS aggr__a__b__parent_count, ",
                "\"os\" AS aggr__a__b__key_0, count(*) AS aggr__a__b__count, count() AS aggr__a__b__order_1 ",
                "FROM logs GROUP BY \"host.name\", \"os\")) ",
                "WHERE (aggr__a__order_1_rank<=3 AND aggr__a__b__order_1_rank<=6) ",
                "ORDER BY aggr__a__order_1_rank ASC, aggr__a__b__order_1_rank ASC"
            )
        );
        assert_eq!(generated.matches("dense_rank()").count(), 2);
    }

    #[test]
    fn nested_filters_multiply_columns() {
        let model = PancakeModel {
            layers: vec![
                layer(vec![avg("metric__x", "bytes")], Some(filters("aggr__outer__", 2))),
                layer(Vec::new(), Some(filters("aggr__outer__inner__", 3))),
                layer(vec![avg("metric__outer__inner__m", "bytes")], None),
            ],
            ..PancakeModel::default()
        };
        let select = SqlGenerator.generate(&model).unwrap();
        let metric_copies: Vec<String> = select
            .columns
            .iter()
            .filter_map(|column| match column {
                Expr::Aliased(aliased) if aliased.alias.ends_with("metric__outer__inner__m_col_0") => {
                    Some(aliased.alias.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(metric_copies.len(), 6);
        assert!(metric_copies.contains(&"filter_1__filter_2__metric__outer__inner__m_col_0".to_string()));

        let inner_count = select
            .columns
            .iter()
            .find_map(|column| match column {
                Expr::Aliased(aliased) if aliased.alias == "filter_1__filter_2__aggr__outer__inner__count" => {
                    Some(aliased.expr.to_sql())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(inner_count, r#"countIf(("status"=2 AND "status"=1))"#);
        assert_eq!(select.columns.len(), 1 + 2 * (1 + 3 * 2));
    }

    #[test]
    fn top_level_filter_folds_into_where() {
        let filter = BucketAgg {
            name: "f".into(),
            internal_name: "aggr__f__".into(),
            kind: BucketKind::Filter {
                predicate: Expr::infix(Expr::column("status"), "=", Expr::int(500)),
            },
            columns: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            keyed: false,
            metadata: None,
            filter_out_empty_key: false,
        };
        let model = PancakeModel {
            layers: vec![
                layer(Vec::new(), Some(filter)),
                layer(vec![avg("metric__f__m", "bytes")], None),
            ],
            ..PancakeModel::default()
        };
        assert_eq!(
            sql(&model),
            r#"SELECT count(*) AS aggr__f__count, avgOrNull("bytes") AS metric__f__m_col_0 FROM logs WHERE "status"=500"#
        );
    }

    #[test]
    fn if_combinator_naming() {
        let predicate = Expr::infix(Expr::column("a"), ">", Expr::int(1));
        let render = |expr: Expr| add_if(&expr, &predicate).unwrap().to_sql();

        assert_eq!(render(Expr::count_all()), r#"countIf("a">1)"#);
        assert_eq!(
            render(Expr::function("sumOrNull", vec![Expr::column("x")])),
            r#"sumOrNullIf("x","a">1)"#
        );
        assert_eq!(
            render(Expr::function(
                "countIf",
                vec![Expr::infix(Expr::column("b"), "=", Expr::int(2))]
            )),
            r#"countIf(("b"=2 AND "a">1))"#
        );
        assert_eq!(
            render(Expr::multi_function(
                "quantiles",
                vec![Expr::float(0.5)],
                vec![Expr::column("x")]
            )),
            r#"quantilesIf(0.5)("x","a">1)"#
        );

        let merged = accumulate(
            &Expr::function("avgOrNull", vec![Expr::column("x")]),
            &[Expr::alias_ref("k")],
        )
        .unwrap();
        assert_eq!(
            render(merged),
            r#"avgOrNullIfMerge(avgOrNullIfState("x","a">1)) OVER (PARTITION BY k)"#
        );
        assert!(add_if(&Expr::column("x"), &predicate).is_err());
    }

    #[test]
    fn accumulation_table() {
        let partition = [Expr::alias_ref("k")];
        let render = |expr: Expr| accumulate(&expr, &partition).unwrap().to_sql();

        assert_eq!(
            render(Expr::function("sumOrNull", vec![Expr::column("x")])),
            r#"sumOrNull(sumOrNull("x")) OVER (PARTITION BY k)"#
        );
        assert_eq!(
            render(Expr::function("count", vec![Expr::column("x")])),
            r#"sum(count("x")) OVER (PARTITION BY k)"#
        );
        assert_eq!(
            render(Expr::function("uniq", vec![Expr::column("x")])),
            r#"uniqMerge(uniqState("x")) OVER (PARTITION BY k)"#
        );
        assert_eq!(
            render(Expr::multi_function(
                "quantiles",
                vec![Expr::float(0.5)],
                vec![Expr::column("x")]
            )),
            r#"quantilesMerge(0.5)(quantilesState(0.5)("x")) OVER (PARTITION BY k)"#
        );
        assert_eq!(
            render(Expr::infix(Expr::count_all(), "*", Expr::int(100))),
            "sum(count(*)) OVER (PARTITION BY k)*100"
        );
        let err = accumulate(&Expr::function("argMax", vec![Expr::column("x")]), &partition);
        assert!(matches!(err, Err(ServiceError::Unsupported(_))));
    }

    #[test]
    fn histogram_under_filters_ranks_by_first_group() {
        let histogram = BucketAgg {
            name: "h".into(),
            internal_name: "aggr__f__h__".into(),
            kind: BucketKind::Histogram(Histogram {
                interval: 10.0,
                min_doc_count: 1,
                extended_bounds: None,
            }),
            columns: vec![Expr::column("bytes")],
            order_by: vec![OrderByExpr::asc(Expr::column("bytes"))],
            limit: None,
            keyed: false,
            metadata: None,
            filter_out_empty_key: false,
        };
        let model = PancakeModel {
            layers: vec![
                layer(vec![avg("metric__z", "bytes")], Some(filters("aggr__f__", 2))),
                layer(Vec::new(), Some(histogram)),
                Layer::default(),
            ],
            ..PancakeModel::default()
        };
        let generated = sql(&model);
        assert!(generated.contains(r#""bytes" AS filter_0__aggr__f__h__key_0"#));
        assert!(generated.contains(r#""bytes" AS filter_1__aggr__f__h__key_0"#));
        assert!(generated.ends_with("ORDER BY filter_0__aggr__f__h__key_0 ASC"));
    }

    #[test]
    fn pipelines_do_not_add_columns() {
        let mut first = layer(Vec::new(), Some(terms("aggr__0__", "host.name", 3)));
        first.pipelines.push(crate::pancake::PipelineAgg {
            name: "p".into(),
            kind: PipelineKind {
                op: crate::aggregation::pipelines::PipelineOp::SumBucket,
                buckets_path: crate::aggregation::pipelines::BucketsPath::parse("0>_count"),
            },
            metadata: None,
        });
        let model = PancakeModel {
            layers: vec![first, Layer::default()],
            ..PancakeModel::default()
        };
        let select = SqlGenerator.generate(&model).unwrap();
        // parent count, key, count, order
        assert_eq!(select.columns.len(), 4);
    }

    #[test]
    fn sampler_limits_rows_before_grouping() {
        let sampler = BucketAgg {
            name: "s".into(),
            internal_name: "aggr__s__".into(),
            kind: BucketKind::Sampler { shard_size: 50 },
            columns: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            keyed: false,
            metadata: None,
            filter_out_empty_key: false,
        };
        let model = PancakeModel {
            layers: vec![layer(Vec::new(), Some(sampler)), layer(vec![avg("metric__s__m", "bytes")], None)],
            where_clause: Some(Expr::infix(Expr::column("bytes"), ">", Expr::int(0))),
            sample_limit: Some(50),
        };
        assert_eq!(
            sql(&model),
            r#"SELECT count(*) AS aggr__s__count, avgOrNull("bytes") AS metric__s__m_col_0 FROM (SELECT * FROM logs WHERE "bytes">0 LIMIT 50)"#
        );
    }
}
