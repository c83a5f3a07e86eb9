//! SQL expression tree shared by every stage of the aggregation compiler.
//!
//! Nodes are plain values. Passes never mutate a tree in place; they walk it
//! through [`Visitor`] and build a new one (see [`visitor::Rewriter`]).

pub mod passes;
pub mod render;
pub mod visitor;

use std::fmt;

pub use visitor::{Rewriter, Visitor};

/// Table name emitted by the generator; substituted right before rendering.
pub const TABLE_PLACEHOLDER: &str = "__aggql_table__";

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(ColumnRef),
    Literal(Literal),
    Infix(InfixExpr),
    Prefix(PrefixExpr),
    Function(FunctionExpr),
    MultiFunction(MultiFunctionExpr),
    Window(WindowFunction),
    Aliased(AliasedExpr),
    /// Reference to an alias defined in the same or an inner select.
    AliasRef(String),
    OrderBy(OrderByExpr),
    Select(Box<SelectCommand>),
    Join(JoinExpr),
    Paren(ParenExpr),
    Distinct(Box<Expr>),
    Table(TableRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Quoted and escaped on render.
    Str(String),
    /// Emitted verbatim (`*`, `PI()`, pre-rendered casts).
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfixExpr {
    pub left: Box<Expr>,
    pub op: String,
    pub right: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrefixExpr {
    pub op: String,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionExpr {
    pub name: String,
    pub args: Vec<Expr>,
}

/// Parametric aggregate such as `quantiles(0.5)(x)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiFunctionExpr {
    pub name: String,
    pub params: Vec<Expr>,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowFunction {
    pub name: String,
    pub params: Vec<Expr>,
    pub args: Vec<Expr>,
    pub partition_by: Vec<Expr>,
    pub order_by: Vec<OrderByExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AliasedExpr {
    pub expr: Box<Expr>,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(Direction::Asc),
            "desc" => Some(Direction::Desc),
            _ => None,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: Box<Expr>,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub select: SelectCommand,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectCommand {
    pub ctes: Vec<Cte>,
    pub columns: Vec<Expr>,
    pub from: Option<Box<Expr>>,
    pub where_clause: Option<Box<Expr>>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    LeftOuter,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinExpr {
    pub left: Box<Expr>,
    pub kind: JoinKind,
    pub right: Box<Expr>,
    pub on: Option<Box<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParenExpr {
    pub exprs: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(ColumnRef {
            table: None,
            name: name.into(),
        })
    }

    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Column(ColumnRef {
            table: Some(table.into()),
            name: name.into(),
        })
    }

    pub fn null() -> Self {
        Expr::Literal(Literal::Null)
    }

    pub fn int(value: i64) -> Self {
        Expr::Literal(Literal::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Expr::Literal(Literal::Float(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(Literal::Str(value.into()))
    }

    pub fn raw(value: impl Into<String>) -> Self {
        Expr::Literal(Literal::Raw(value.into()))
    }

    pub fn wildcard() -> Self {
        Expr::raw("*")
    }

    pub fn truth() -> Self {
        Expr::Literal(Literal::Bool(true))
    }

    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function(FunctionExpr {
            name: name.into(),
            args,
        })
    }

    pub fn multi_function(name: impl Into<String>, params: Vec<Expr>, args: Vec<Expr>) -> Self {
        Expr::MultiFunction(MultiFunctionExpr {
            name: name.into(),
            params,
            args,
        })
    }

    pub fn infix(left: Expr, op: impl Into<String>, right: Expr) -> Self {
        Expr::Infix(InfixExpr {
            left: Box::new(left),
            op: op.into(),
            right: Box::new(right),
        })
    }

    pub fn prefix(op: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Prefix(PrefixExpr {
            op: op.into(),
            args,
        })
    }

    pub fn paren(expr: Expr) -> Self {
        Expr::Paren(ParenExpr { exprs: vec![expr] })
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        Expr::Aliased(AliasedExpr {
            expr: Box::new(expr),
            alias: alias.into(),
        })
    }

    pub fn alias_ref(alias: impl Into<String>) -> Self {
        Expr::AliasRef(alias.into())
    }

    pub fn table(name: impl Into<String>) -> Self {
        Expr::Table(TableRef {
            name: name.into(),
            alias: None,
        })
    }

    pub fn table_placeholder() -> Self {
        Expr::table(TABLE_PLACEHOLDER)
    }

    /// `count(*)`, the per-bucket document count.
    pub fn count_all() -> Self {
        Expr::function("count", vec![Expr::wildcard()])
    }

    /// `count()`, the default ordering expression of bucket aggregations.
    pub fn count_rows() -> Self {
        Expr::function("count", Vec::new())
    }

    /// Folds `exprs` into a left-nested `AND` chain. `None` when empty.
    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        exprs
            .into_iter()
            .reduce(|acc, next| Expr::infix(acc, "AND", next))
    }

    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        exprs
            .into_iter()
            .reduce(|acc, next| Expr::infix(acc, "OR", next))
    }

    pub fn accept<V: Visitor>(&self, visitor: &mut V) -> V::Output {
        match self {
            Expr::Column(col) => visitor.visit_column_ref(col),
            Expr::Literal(lit) => visitor.visit_literal(lit),
            Expr::Infix(infix) => visitor.visit_infix(infix),
            Expr::Prefix(prefix) => visitor.visit_prefix(prefix),
            Expr::Function(function) => visitor.visit_function(function),
            Expr::MultiFunction(function) => visitor.visit_multi_function(function),
            Expr::Window(window) => visitor.visit_window(window),
            Expr::Aliased(aliased) => visitor.visit_aliased(aliased),
            Expr::AliasRef(alias) => visitor.visit_alias_ref(alias),
            Expr::OrderBy(order_by) => visitor.visit_order_by(order_by),
            Expr::Select(select) => visitor.visit_select(select),
            Expr::Join(join) => visitor.visit_join(join),
            Expr::Paren(paren) => visitor.visit_paren(paren),
            Expr::Distinct(inner) => visitor.visit_distinct(inner),
            Expr::Table(table) => visitor.visit_table(table),
        }
    }

    pub fn rewrite<R: Rewriter>(&self, rewriter: &mut R) -> Expr {
        rewriter.rewrite(self)
    }

    pub fn to_sql(&self) -> String {
        self.accept(&mut render::SqlRenderer)
    }

    /// Strips an outer alias, if any.
    pub fn unaliased(&self) -> &Expr {
        match self {
            Expr::Aliased(aliased) => aliased.expr.unaliased(),
            other => other,
        }
    }

    pub fn as_column(&self) -> Option<&ColumnRef> {
        match self {
            Expr::Column(col) => Some(col),
            _ => None,
        }
    }
}

impl OrderByExpr {
    pub fn new(expr: Expr, direction: Direction) -> Self {
        Self {
            expr: Box::new(expr),
            direction,
        }
    }

    pub fn asc(expr: Expr) -> Self {
        Self::new(expr, Direction::Asc)
    }

    pub fn desc(expr: Expr) -> Self {
        Self::new(expr, Direction::Desc)
    }
}

impl WindowFunction {
    pub fn new(name: impl Into<String>, args: Vec<Expr>, partition_by: Vec<Expr>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            args,
            partition_by,
            order_by: Vec::new(),
        }
    }
}

impl SelectCommand {
    pub fn new(columns: Vec<Expr>, from: Expr) -> Self {
        Self {
            columns,
            from: Some(Box::new(from)),
            ..Self::default()
        }
    }

    pub fn with_where(mut self, where_clause: Option<Expr>) -> Self {
        self.where_clause = where_clause.map(Box::new);
        self
    }

    pub fn to_sql(&self) -> String {
        render::SqlRenderer.render_select(self)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

impl fmt::Display for SelectCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_folds_left() {
        let expr = Expr::and([Expr::column("a"), Expr::column("b"), Expr::column("c")]).unwrap();
        assert_eq!(expr.to_sql(), r#"(("a" AND "b") AND "c")"#);
    }

    #[test]
    fn and_of_nothing_is_none() {
        assert!(Expr::and(Vec::new()).is_none());
    }

    #[test]
    fn count_forms_differ() {
        assert_ne!(Expr::count_all(), Expr::count_rows());
        assert_eq!(Expr::count_all().to_sql(), "count(*)");
        assert_eq!(Expr::count_rows().to_sql(), "count()");
    }

    #[test]
    fn unaliased_strips_nested_aliases() {
        let inner = Expr::column("x");
        let expr = Expr::aliased(Expr::aliased(inner.clone(), "a"), "b");
        assert_eq!(expr.unaliased(), &inner);
    }
}
