use super::{
    AliasedExpr, ColumnRef, Expr, FunctionExpr, InfixExpr, JoinExpr, JoinKind, Literal,
    MultiFunctionExpr, OrderByExpr, ParenExpr, PrefixExpr, SelectCommand, TableRef, Visitor,
    WindowFunction,
};

/// Operators rendered as `l OP r` instead of `lOPr`.
const SPACED_OPERATORS: &[&str] = &[
    "LIKE",
    "ILIKE",
    "NOT LIKE",
    "NOT ILIKE",
    "IS",
    "IS NOT",
    "IN",
    "NOT IN",
    "REGEXP",
    "NOT REGEXP",
];

/// Renders a tree to ClickHouse SQL text.
pub struct SqlRenderer;

impl SqlRenderer {
    pub fn render_select(&mut self, select: &SelectCommand) -> String {
        let mut sql = String::new();

        if !select.ctes.is_empty() {
            let ctes: Vec<String> = select
                .ctes
                .iter()
                .map(|cte| {
                    format!(
                        "{} AS ({})",
                        quote_identifier(&cte.name),
                        self.render_select(&cte.select)
                    )
                })
                .collect();
            sql.push_str("WITH ");
            sql.push_str(&ctes.join(", "));
            sql.push(' ');
        }

        sql.push_str("SELECT ");
        sql.push_str(&self.join(&select.columns, ", "));

        if let Some(from) = &select.from {
            sql.push_str(" FROM ");
            match from.as_ref() {
                Expr::Select(inner) => {
                    sql.push('(');
                    sql.push_str(&self.render_select(inner));
                    sql.push(')');
                }
                other => sql.push_str(&other.accept(self)),
            }
        }

        if let Some(where_clause) = &select.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.accept(self));
        }

        if !select.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.join(&select.group_by, ", "));
        }

        if !select.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.join_order_by(&select.order_by));
        }

        if let Some(limit) = select.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        sql
    }

    fn join(&mut self, exprs: &[Expr], separator: &str) -> String {
        exprs
            .iter()
            .map(|expr| expr.accept(self))
            .collect::<Vec<_>>()
            .join(separator)
    }

    fn join_order_by(&mut self, order_by: &[OrderByExpr]) -> String {
        order_by
            .iter()
            .map(|order| self.visit_order_by(order))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Visitor for SqlRenderer {
    type Output = String;

    fn visit_column_ref(&mut self, col: &ColumnRef) -> String {
        match &col.table {
            Some(table) => format!("{}.{}", double_quote(table), double_quote(&col.name)),
            None => double_quote(&col.name),
        }
    }

    fn visit_literal(&mut self, lit: &Literal) -> String {
        match lit {
            Literal::Null => "NULL".to_string(),
            Literal::Bool(value) => value.to_string(),
            Literal::Int(value) => value.to_string(),
            Literal::Float(value) => format_float(*value),
            Literal::Str(value) => single_quote(value),
            Literal::Raw(value) => value.clone(),
        }
    }

    fn visit_infix(&mut self, infix: &InfixExpr) -> String {
        let left = infix.left.accept(self);
        let right = infix.right.accept(self);
        let op = infix.op.as_str();

        if op.eq_ignore_ascii_case("AND") || op.eq_ignore_ascii_case("OR") {
            format!("({left} {op} {right})")
        } else if SPACED_OPERATORS
            .iter()
            .any(|spaced| spaced.eq_ignore_ascii_case(op))
        {
            format!("{left} {op} {right}")
        } else {
            format!("{left}{op}{right}")
        }
    }

    fn visit_prefix(&mut self, prefix: &PrefixExpr) -> String {
        format!("{} ({})", prefix.op, self.join(&prefix.args, ", "))
    }

    fn visit_function(&mut self, function: &FunctionExpr) -> String {
        format!("{}({})", function.name, self.join(&function.args, ","))
    }

    fn visit_multi_function(&mut self, function: &MultiFunctionExpr) -> String {
        format!(
            "{}({})({})",
            function.name,
            self.join(&function.params, ","),
            self.join(&function.args, ",")
        )
    }

    fn visit_window(&mut self, window: &WindowFunction) -> String {
        let mut sql = window.name.clone();
        if !window.params.is_empty() {
            sql.push_str(&format!("({})", self.join(&window.params, ",")));
        }
        sql.push_str(&format!("({}) OVER (", self.join(&window.args, ", ")));

        if !window.partition_by.is_empty() {
            sql.push_str("PARTITION BY ");
            sql.push_str(&self.join(&window.partition_by, ", "));
        }

        if !window.order_by.is_empty() {
            if !window.partition_by.is_empty() {
                sql.push(' ');
            }
            sql.push_str("ORDER BY ");
            sql.push_str(&self.join_order_by(&window.order_by));
        }

        sql.push(')');
        sql
    }

    fn visit_aliased(&mut self, aliased: &AliasedExpr) -> String {
        format!(
            "{} AS {}",
            aliased.expr.accept(self),
            quote_identifier(&aliased.alias)
        )
    }

    fn visit_alias_ref(&mut self, alias: &str) -> String {
        quote_identifier(alias)
    }

    fn visit_order_by(&mut self, order_by: &OrderByExpr) -> String {
        format!(
            "{} {}",
            order_by.expr.accept(self),
            order_by.direction.as_sql()
        )
    }

    fn visit_select(&mut self, select: &SelectCommand) -> String {
        self.render_select(select)
    }

    fn visit_join(&mut self, join: &JoinExpr) -> String {
        let left = join.left.accept(self);
        let right = join.right.accept(self);
        match (join.kind, &join.on) {
            (JoinKind::LeftOuter, Some(on)) => {
                format!("{left} LEFT OUTER JOIN {right} ON ({})", on.accept(self))
            }
            (JoinKind::LeftOuter, None) | (JoinKind::Cross, _) => {
                format!("{left} CROSS JOIN {right}")
            }
        }
    }

    fn visit_paren(&mut self, paren: &ParenExpr) -> String {
        format!("({})", self.join(&paren.exprs, " "))
    }

    fn visit_distinct(&mut self, inner: &Expr) -> String {
        format!("DISTINCT {}", inner.accept(self))
    }

    fn visit_table(&mut self, table: &TableRef) -> String {
        match &table.alias {
            Some(alias) => format!(
                "{} AS {}",
                quote_identifier(&table.name),
                quote_identifier(alias)
            ),
            None => quote_identifier(&table.name),
        }
    }
}

pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Bare when the name is a plain identifier, double-quoted otherwise.
pub fn quote_identifier(name: &str) -> String {
    if is_plain_identifier(name) {
        name.to_string()
    } else {
        double_quote(name)
    }
}

pub fn double_quote(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

pub fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        (if value > 0.0 { "inf" } else { "-inf" }).to_string()
    } else {
        format!("{value}")
    }
}
