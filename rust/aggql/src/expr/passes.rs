//! Independent passes over the expression tree.

use super::{
    visitor::walk_infix,
    AliasedExpr, ColumnRef, Expr, FunctionExpr, InfixExpr, JoinExpr, Literal, MultiFunctionExpr,
    OrderByExpr, ParenExpr, PrefixExpr, Rewriter, SelectCommand, TableRef, Visitor,
    WindowFunction, TABLE_PLACEHOLDER,
};
use crate::{
    schema::{DateTimeKind, FieldRegistry},
    time,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Collects every column referenced anywhere in the tree.
#[derive(Default)]
pub struct UsedColumns {
    pub columns: BTreeSet<ColumnRef>,
}

pub fn used_columns(expr: &Expr) -> BTreeSet<ColumnRef> {
    let mut collector = UsedColumns::default();
    expr.accept(&mut collector);
    collector.columns
}

impl UsedColumns {
    fn all(&mut self, exprs: &[Expr]) {
        for expr in exprs {
            expr.accept(self);
        }
    }
}

impl Visitor for UsedColumns {
    type Output = ();

    fn visit_column_ref(&mut self, col: &ColumnRef) {
        self.columns.insert(col.clone());
    }

    fn visit_literal(&mut self, _lit: &Literal) {}

    fn visit_infix(&mut self, infix: &InfixExpr) {
        infix.left.accept(self);
        infix.right.accept(self);
    }

    fn visit_prefix(&mut self, prefix: &PrefixExpr) {
        self.all(&prefix.args);
    }

    fn visit_function(&mut self, function: &FunctionExpr) {
        self.all(&function.args);
    }

    fn visit_multi_function(&mut self, function: &MultiFunctionExpr) {
        self.all(&function.params);
        self.all(&function.args);
    }

    fn visit_window(&mut self, window: &WindowFunction) {
        self.all(&window.args);
        self.all(&window.partition_by);
        for order_by in &window.order_by {
            self.visit_order_by(order_by);
        }
    }

    fn visit_aliased(&mut self, aliased: &AliasedExpr) {
        aliased.expr.accept(self);
    }

    fn visit_alias_ref(&mut self, _alias: &str) {}

    fn visit_order_by(&mut self, order_by: &OrderByExpr) {
        order_by.expr.accept(self);
    }

    fn visit_select(&mut self, select: &SelectCommand) {
        self.all(&select.columns);
        if let Some(where_clause) = &select.where_clause {
            where_clause.accept(self);
        }
        self.all(&select.group_by);
        for order_by in &select.order_by {
            self.visit_order_by(order_by);
        }
    }

    fn visit_join(&mut self, join: &JoinExpr) {
        if let Some(on) = &join.on {
            on.accept(self);
        }
    }

    fn visit_paren(&mut self, paren: &ParenExpr) {
        self.all(&paren.exprs);
    }

    fn visit_distinct(&mut self, inner: &Expr) {
        inner.accept(self);
    }

    fn visit_table(&mut self, _table: &TableRef) {}
}

/// Maps request field names and registry aliases onto their columns.
/// Unknown names are left untouched.
pub struct AliasResolver<'a> {
    registry: &'a dyn FieldRegistry,
}

impl<'a> AliasResolver<'a> {
    pub fn new(registry: &'a dyn FieldRegistry) -> Self {
        Self { registry }
    }
}

impl Rewriter for AliasResolver<'_> {
    fn column_ref(&mut self, col: &ColumnRef) -> Expr {
        if col.table.is_some() {
            return Expr::Column(col.clone());
        }
        let name = self
            .registry
            .resolve(&col.name)
            .map(|field| field.column)
            .unwrap_or_else(|| col.name.clone());
        Expr::Column(ColumnRef { table: None, name })
    }
}

/// Replaces the generator's table placeholder with the concrete table.
pub struct PlaceholderSubstitution {
    table: String,
}

impl PlaceholderSubstitution {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn apply(table: &str, select: &SelectCommand) -> SelectCommand {
        match Expr::Select(Box::new(select.clone())).rewrite(&mut Self::new(table)) {
            Expr::Select(rewritten) => *rewritten,
            _ => select.clone(),
        }
    }
}

impl Rewriter for PlaceholderSubstitution {
    fn table(&mut self, table: &TableRef) -> Expr {
        if table.name == TABLE_PLACEHOLDER {
            Expr::Table(TableRef {
                name: self.table.clone(),
                alias: table.alias.clone(),
            })
        } else {
            Expr::Table(table.clone())
        }
    }
}

/// Search terms of a filter, per column, for highlighting matches in hits.
/// Records the string operand of `=`, `LIKE`, `ILIKE` and `IN` predicates
/// on a bare column, lowercased and stripped of `%` wildcards. The tree is
/// passed through unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HighlightTokens {
    tokens: BTreeMap<String, BTreeSet<String>>,
}

impl HighlightTokens {
    pub fn collect(expr: &Expr) -> Self {
        let mut pass = Self::default();
        expr.rewrite(&mut pass);
        pass
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn should_highlight(&self, column: &str) -> bool {
        self.tokens.contains_key(column)
    }

    /// Longest first, so a longer match is marked before its substrings.
    pub fn sorted_tokens(&self, column: &str) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .tokens
            .get(column)
            .map(|tokens| tokens.iter().cloned().collect())
            .unwrap_or_default();
        tokens.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        tokens
    }

    pub fn into_sorted(self) -> BTreeMap<String, Vec<String>> {
        self.tokens
            .keys()
            .map(|column| (column.clone(), self.sorted_tokens(column)))
            .collect()
    }

    fn record(&mut self, column: &ColumnRef, value: &str) {
        let token = value
            .trim_matches(|c| c == '\'' || c == '%')
            .to_lowercase();
        if token.is_empty() {
            return;
        }
        self.tokens
            .entry(column.name.clone())
            .or_default()
            .insert(token);
    }
}

impl Rewriter for HighlightTokens {
    fn infix(&mut self, infix: &InfixExpr) -> Expr {
        let op = infix.op.to_ascii_uppercase();
        if matches!(op.as_str(), "=" | "LIKE" | "ILIKE" | "IN") {
            if let Expr::Column(column) = infix.left.as_ref() {
                match infix.right.as_ref() {
                    Expr::Literal(Literal::Str(value)) => self.record(column, value),
                    Expr::Function(tuple) if op == "IN" && tuple.name == "tuple" => {
                        for arg in &tuple.args {
                            if let Expr::Literal(Literal::Str(value)) = arg {
                                self.record(column, value);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        walk_infix(self, infix)
    }
}

/// Wraps string literals compared against date columns in the parser that
/// matches the column's precision.
pub struct TimestampLiteralRewriter<'a> {
    registry: &'a dyn FieldRegistry,
}

impl<'a> TimestampLiteralRewriter<'a> {
    pub fn new(registry: &'a dyn FieldRegistry) -> Self {
        Self { registry }
    }

    fn wrap(&self, column: &Expr, literal: &Expr) -> Option<Expr> {
        let Expr::Literal(Literal::Str(raw)) = literal else {
            return None;
        };
        let function = match self.registry.date_time_kind(column) {
            DateTimeKind::DateTime64 => "parseDateTime64BestEffort",
            DateTimeKind::DateTime => "parseDateTimeBestEffort",
            DateTimeKind::None => return None,
        };
        Some(Expr::function(function, vec![Expr::string(raw.clone())]))
    }
}

const COMPARISON_OPERATORS: &[&str] = &["=", "!=", "<>", "<", "<=", ">", ">="];

impl Rewriter for TimestampLiteralRewriter<'_> {
    fn infix(&mut self, infix: &InfixExpr) -> Expr {
        if !COMPARISON_OPERATORS.contains(&infix.op.as_str()) {
            return walk_infix(self, infix);
        }
        if let Some(right) = self.wrap(&infix.left, &infix.right) {
            return Expr::infix((*infix.left).clone(), infix.op.clone(), right);
        }
        if let Some(left) = self.wrap(&infix.right, &infix.left) {
            return Expr::infix(left, infix.op.clone(), (*infix.right).clone());
        }
        walk_infix(self, infix)
    }
}

/// Qualifies bare column references with a table alias.
pub struct QualifyColumns {
    table: String,
}

impl QualifyColumns {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

impl Rewriter for QualifyColumns {
    fn column_ref(&mut self, col: &ColumnRef) -> Expr {
        Expr::Column(ColumnRef {
            table: Some(col.table.clone().unwrap_or_else(|| self.table.clone())),
            name: col.name.clone(),
        })
    }

    fn select(&mut self, select: &SelectCommand) -> Expr {
        // Sub-selects have their own scope.
        Expr::Select(Box::new(select.clone()))
    }
}

/// Finds the tightest lower bound `column >= t` / `column > t` that must hold
/// for every row, looking only through `AND` chains.
pub fn timestamp_lower_bound(column: &ColumnRef, where_clause: &Expr) -> Option<DateTime<Utc>> {
    match where_clause {
        Expr::Infix(infix) if infix.op.eq_ignore_ascii_case("AND") => {
            let left = timestamp_lower_bound(column, &infix.left);
            let right = timestamp_lower_bound(column, &infix.right);
            left.into_iter().chain(right).max()
        }
        Expr::Infix(infix) if infix.op == ">=" || infix.op == ">" => {
            if infix.left.as_column() != Some(column) {
                return None;
            }
            literal_instant(&infix.right)
        }
        Expr::Infix(infix) if infix.op == "<=" || infix.op == "<" => {
            if infix.right.as_column() != Some(column) {
                return None;
            }
            literal_instant(&infix.left)
        }
        Expr::Paren(paren) if paren.exprs.len() == 1 => {
            timestamp_lower_bound(column, &paren.exprs[0])
        }
        _ => None,
    }
}

fn literal_instant(expr: &Expr) -> Option<DateTime<Utc>> {
    match expr {
        Expr::Literal(Literal::Int(ms)) => time::from_millis(*ms),
        Expr::Literal(Literal::Str(raw)) if !raw.trim_start().starts_with("now") => {
            time::parse_date_math(raw, DateTime::<Utc>::MIN_UTC).ok()
        }
        Expr::Function(FunctionExpr { name, args }) if args.len() == 1 => match name.as_str() {
            "fromUnixTimestamp64Milli" => match &args[0] {
                Expr::Literal(Literal::Int(ms)) => time::from_millis(*ms),
                _ => None,
            },
            "fromUnixTimestamp" => match &args[0] {
                Expr::Literal(Literal::Int(secs)) => time::from_millis(secs.checked_mul(1000)?),
                _ => None,
            },
            "parseDateTime64BestEffort" | "parseDateTimeBestEffort" | "toDateTime64"
            | "toDateTime" => literal_instant(&args[0]),
            _ => None,
        },
        _ => None,
    }
}

/// True for `count()` and `count(*)`.
pub fn is_count(function: &FunctionExpr) -> bool {
    function.name == "count"
        && (function.args.is_empty()
            || matches!(function.args.as_slice(), [Expr::Literal(Literal::Raw(star))] if star == "*"))
}
