//! Per-document metrics (`top_hits`, `top_metrics`).
//!
//! The grouping query becomes a CTE. Raw rows are joined back to it on the
//! group keys, ranked per group with `ROW_NUMBER()`, and cut at the metric's
//! size.

use super::{
    generator::{GroupBy, Projection},
    MetricAgg,
};
use crate::{
    aggregation::MetricKind,
    error::{Result, ServiceError},
    expr::{
        passes::QualifyColumns, Cte, Expr, JoinExpr, JoinKind, OrderByExpr, SelectCommand,
        TableRef, WindowFunction, TABLE_PLACEHOLDER,
    },
};

const GROUP_CTE: &str = "hits_group_table";
const JOIN_CTE: &str = "hits_join";
const GROUP_TABLE: &str = "group_table";
const HIT_TABLE: &str = "hit_table";
const HITS_RANK: &str = "top_hits_rank";

/// What the grouping query already computed.
pub(crate) struct JoinInput<'a> {
    pub group_bys: &'a [GroupBy],
    pub columns: &'a [Projection],
    pub combinator_wheres: &'a [Expr],
    pub where_clause: Option<&'a Expr>,
}

pub(crate) fn join_hits(
    hits: &MetricAgg,
    input: &JoinInput<'_>,
    grouping: SelectCommand,
) -> Result<SelectCommand> {
    let (size, sort) = match &hits.kind {
        MetricKind::TopHits(top_hits) => (top_hits.size, top_hits.sort.clone()),
        MetricKind::TopMetrics(top_metrics) => {
            (top_metrics.size, top_metrics.sort.clone().into_iter().collect())
        }
        other => {
            return Err(ServiceError::unsupported(format!(
                "{} is not answered per document",
                other.name()
            )))
        }
    };

    let where_clause = Expr::and(
        input
            .combinator_wheres
            .iter()
            .cloned()
            .chain(input.where_clause.cloned()),
    );

    if input.group_bys.is_empty() && input.columns.is_empty() {
        let mut select = SelectCommand::new(
            hits.columns
                .iter()
                .enumerate()
                .map(|(idx, column)| Expr::aliased(column.clone(), hits.column_alias(idx)))
                .collect(),
            Expr::table_placeholder(),
        )
        .with_where(where_clause);
        select.order_by = sort
            .into_iter()
            .map(|(expr, direction)| OrderByExpr::new(expr, direction))
            .collect();
        select.limit = Some(size);
        return Ok(select);
    }

    let qualify = |expr: &Expr| expr.rewrite(&mut QualifyColumns::new(HIT_TABLE));
    let group_ref = |alias: &str| Expr::qualified(GROUP_TABLE, alias);

    let mut join_columns: Vec<Expr> = input
        .columns
        .iter()
        .map(|column| Expr::aliased(group_ref(&column.alias), column.alias.clone()))
        .collect();
    for order in &grouping.order_by {
        if let Expr::AliasRef(alias) = order.expr.as_ref() {
            if !input.columns.iter().any(|column| &column.alias == alias) {
                join_columns.push(Expr::aliased(group_ref(alias), alias.clone()));
            }
        }
    }
    let hit_aliases: Vec<String> = (0..hits.columns.len())
        .map(|idx| hits.column_alias(idx))
        .collect();
    join_columns.extend(
        hits.columns
            .iter()
            .zip(&hit_aliases)
            .map(|(column, alias)| Expr::aliased(qualify(column), alias.clone())),
    );

    let mut row_number = WindowFunction::new(
        "ROW_NUMBER",
        Vec::new(),
        input
            .group_bys
            .iter()
            .map(|group| group_ref(&group.alias))
            .collect(),
    );
    row_number.order_by = sort
        .iter()
        .map(|(expr, direction)| OrderByExpr::new(qualify(expr), *direction))
        .collect();
    join_columns.push(Expr::aliased(Expr::Window(row_number), HITS_RANK));

    let on = Expr::and(input.group_bys.iter().map(|group| {
        Expr::infix(group_ref(&group.alias), "=", qualify(&group.expr))
    }));
    let from = Expr::Join(JoinExpr {
        left: Box::new(Expr::Table(TableRef {
            name: GROUP_CTE.to_string(),
            alias: Some(GROUP_TABLE.to_string()),
        })),
        kind: if on.is_some() {
            JoinKind::LeftOuter
        } else {
            JoinKind::Cross
        },
        right: Box::new(Expr::Table(TableRef {
            name: TABLE_PLACEHOLDER.to_string(),
            alias: Some(HIT_TABLE.to_string()),
        })),
        on: on.map(Box::new),
    });
    let join = SelectCommand::new(join_columns, from)
        .with_where(where_clause.as_ref().map(qualify));

    let mut order_by = grouping.order_by.clone();
    order_by.push(OrderByExpr::asc(Expr::alias_ref(HITS_RANK)));

    let mut result = SelectCommand::new(
        input
            .columns
            .iter()
            .map(|column| Expr::alias_ref(column.alias.clone()))
            .chain(hit_aliases.into_iter().map(Expr::alias_ref))
            .collect(),
        Expr::table(JOIN_CTE),
    )
    .with_where(Some(Expr::infix(
        Expr::alias_ref(HITS_RANK),
        "<=",
        Expr::int(size as i64),
    )));
    result.order_by = order_by;
    result.ctes = vec![
        Cte {
            name: GROUP_CTE.to_string(),
            select: grouping,
        },
        Cte {
            name: JOIN_CTE.to_string(),
            select: join,
        },
    ];
    Ok(result)
}

#[cfg(test)]
mod tests {
    use crate::{
        aggregation::{
            buckets::BucketKind,
            metrics::{MetricKind, TopHits, TopMetrics},
        },
        expr::{passes::PlaceholderSubstitution, Direction, Expr, OrderByExpr},
        pancake::{BucketAgg, Layer, MetricAgg, PancakeModel, SqlGenerator},
    };
    use pretty_assertions::assert_eq;

    fn top_hits() -> MetricAgg {
        MetricAgg {
            name: "latest".into(),
            internal_name: "top_hits__0__latest".into(),
            kind: MetricKind::TopHits(TopHits {
                size: 2,
                fields: vec!["message".into()],
                sort: vec![(Expr::column("timestamp"), Direction::Desc)],
                index: "logs".into(),
            }),
            columns: vec![Expr::column("message"), Expr::column("timestamp")],
            metadata: None,
        }
    }

    #[test]
    fn hits_are_joined_back_per_group() {
        let terms = BucketAgg {
            name: "0".into(),
            internal_name: "aggr__0__".into(),
            kind: BucketKind::Terms { significant: false },
            columns: vec![Expr::column("host.name")],
            order_by: vec![OrderByExpr::desc(Expr::count_rows())],
            limit: Some(3),
            keyed: false,
            metadata: None,
            filter_out_empty_key: false,
        };
        let model = PancakeModel {
            layers: vec![
                Layer {
                    bucket: Some(terms),
                    ..Layer::default()
                },
                Layer {
                    metrics: vec![top_hits()],
                    ..Layer::default()
                },
            ],
            where_clause: Some(Expr::infix(Expr::column("level"), "=", Expr::string("error"))),
            sample_limit: None,
        };
        let select = SqlGenerator.generate(&model).unwrap();
        let sql = PlaceholderSubstitution::apply("logs", &select).to_sql();
        assert_eq!(
            sql,
            concat!(
                "WITH hits_group_table AS (",
                "SELECT sum(count(*)) OVER () AS aggr__0__parent_count, \"host.name\" AS aggr__0__key_0, count(*) AS aggr__0__count, count() AS aggr__0__order_1 ",
                "FROM logs WHERE \"level\"='error' GROUP BY \"host.name\" ",
                "ORDER BY aggr__0__order_1 DESC, aggr__0__key_0 ASC LIMIT 3), ",
                "hits_join AS (",
                "SELECT \"group_table\".\"aggr__0__parent_count\" AS aggr__0__parent_count, ",
                "\"group_table\".\"aggr__0__key_0\" AS aggr__0__key_0, ",
                "\"group_table\".\"aggr__0__count\" AS aggr__0__count, ",
                "\"group_table\".\"aggr__0__order_1\" AS aggr__0__order_1, ",
                "\"hit_table\".\"message\" AS top_hits__0__latest_col_0, ",
                "\"hit_table\".\"timestamp\" AS top_hits__0__latest_col_1, ",
                "ROW_NUMBER() OVER (PARTITION BY \"group_table\".\"aggr__0__key_0\" ORDER BY \"hit_table\".\"timestamp\" DESC) AS top_hits_rank ",
                "FROM hits_group_table AS group_table LEFT OUTER JOIN logs AS hit_table ",
                "ON (\"group_table\".\"aggr__0__key_0\"=\"hit_table\".\"host.name\") ",
                "WHERE \"hit_table\".\"level\"='error') ",
                "SELECT aggr__0__parent_count, aggr__0__key_0, aggr__0__count, aggr__0__order_1, top_hits__0__latest_col_0, top_hits__0__latest_col_1 ",
                "FROM hits_join WHERE top_hits_rank<=2 ",
                "ORDER BY aggr__0__order_1 DESC, aggr__0__key_0 ASC, top_hits_rank ASC"
            )
        );
    }

    #[test]
    fn lone_top_metrics_is_a_plain_select() {
        let metric = MetricAgg {
            name: "last".into(),
            internal_name: "top_hits__last".into(),
            kind: MetricKind::TopMetrics(TopMetrics {
                size: 1,
                metrics: vec!["bytes".into()],
                sort: Some((Expr::column("timestamp"), Direction::Desc)),
            }),
            columns: vec![Expr::column("bytes"), Expr::column("timestamp")],
            metadata: None,
        };
        let model = PancakeModel {
            layers: vec![Layer {
                metrics: vec![metric],
                ..Layer::default()
            }],
            ..PancakeModel::default()
        };
        let select = SqlGenerator.generate(&model).unwrap();
        assert_eq!(
            PlaceholderSubstitution::apply("logs", &select).to_sql(),
            r#"SELECT "bytes" AS top_hits__last_col_0, "timestamp" AS top_hits__last_col_1 FROM logs ORDER BY "timestamp" DESC LIMIT 1"#
        );
    }
}
