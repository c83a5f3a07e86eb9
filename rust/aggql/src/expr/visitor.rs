use super::{
    AliasedExpr, ColumnRef, Cte, Expr, FunctionExpr, InfixExpr, JoinExpr, Literal,
    MultiFunctionExpr, OrderByExpr, ParenExpr, PrefixExpr, SelectCommand, TableRef,
    WindowFunction,
};

/// One method per node variant. `Expr::accept` is the only dispatch point.
pub trait Visitor {
    type Output;

    fn visit_column_ref(&mut self, col: &ColumnRef) -> Self::Output;
    fn visit_literal(&mut self, lit: &Literal) -> Self::Output;
    fn visit_infix(&mut self, infix: &InfixExpr) -> Self::Output;
    fn visit_prefix(&mut self, prefix: &PrefixExpr) -> Self::Output;
    fn visit_function(&mut self, function: &FunctionExpr) -> Self::Output;
    fn visit_multi_function(&mut self, function: &MultiFunctionExpr) -> Self::Output;
    fn visit_window(&mut self, window: &WindowFunction) -> Self::Output;
    fn visit_aliased(&mut self, aliased: &AliasedExpr) -> Self::Output;
    fn visit_alias_ref(&mut self, alias: &str) -> Self::Output;
    fn visit_order_by(&mut self, order_by: &OrderByExpr) -> Self::Output;
    fn visit_select(&mut self, select: &SelectCommand) -> Self::Output;
    fn visit_join(&mut self, join: &JoinExpr) -> Self::Output;
    fn visit_paren(&mut self, paren: &ParenExpr) -> Self::Output;
    fn visit_distinct(&mut self, inner: &Expr) -> Self::Output;
    fn visit_table(&mut self, table: &TableRef) -> Self::Output;
}

/// Tree-to-tree pass. Every hook defaults to "rebuild with rewritten
/// children", so implementors only override the variants they change.
pub trait Rewriter: Sized {
    fn rewrite(&mut self, expr: &Expr) -> Expr {
        expr.accept(&mut Rebuild(self))
    }

    fn column_ref(&mut self, col: &ColumnRef) -> Expr {
        Expr::Column(col.clone())
    }

    fn literal(&mut self, lit: &Literal) -> Expr {
        Expr::Literal(lit.clone())
    }

    fn infix(&mut self, infix: &InfixExpr) -> Expr {
        walk_infix(self, infix)
    }

    fn prefix(&mut self, prefix: &PrefixExpr) -> Expr {
        Expr::Prefix(PrefixExpr {
            op: prefix.op.clone(),
            args: rewrite_all(self, &prefix.args),
        })
    }

    fn function(&mut self, function: &FunctionExpr) -> Expr {
        walk_function(self, function)
    }

    fn multi_function(&mut self, function: &MultiFunctionExpr) -> Expr {
        Expr::MultiFunction(MultiFunctionExpr {
            name: function.name.clone(),
            params: rewrite_all(self, &function.params),
            args: rewrite_all(self, &function.args),
        })
    }

    fn window(&mut self, window: &WindowFunction) -> Expr {
        walk_window(self, window)
    }

    fn aliased(&mut self, aliased: &AliasedExpr) -> Expr {
        Expr::Aliased(AliasedExpr {
            expr: Box::new(self.rewrite(&aliased.expr)),
            alias: aliased.alias.clone(),
        })
    }

    fn alias_ref(&mut self, alias: &str) -> Expr {
        Expr::AliasRef(alias.to_string())
    }

    fn order_by(&mut self, order_by: &OrderByExpr) -> Expr {
        Expr::OrderBy(OrderByExpr {
            expr: Box::new(self.rewrite(&order_by.expr)),
            direction: order_by.direction,
        })
    }

    fn select(&mut self, select: &SelectCommand) -> Expr {
        Expr::Select(Box::new(walk_select(self, select)))
    }

    fn join(&mut self, join: &JoinExpr) -> Expr {
        Expr::Join(JoinExpr {
            left: Box::new(self.rewrite(&join.left)),
            kind: join.kind,
            right: Box::new(self.rewrite(&join.right)),
            on: join.on.as_ref().map(|on| Box::new(self.rewrite(on))),
        })
    }

    fn paren(&mut self, paren: &ParenExpr) -> Expr {
        Expr::Paren(ParenExpr {
            exprs: rewrite_all(self, &paren.exprs),
        })
    }

    fn distinct(&mut self, inner: &Expr) -> Expr {
        Expr::Distinct(Box::new(self.rewrite(inner)))
    }

    fn table(&mut self, table: &TableRef) -> Expr {
        Expr::Table(table.clone())
    }
}

struct Rebuild<'a, R>(&'a mut R);

impl<R: Rewriter> Visitor for Rebuild<'_, R> {
    type Output = Expr;

    fn visit_column_ref(&mut self, col: &ColumnRef) -> Expr {
        self.0.column_ref(col)
    }

    fn visit_literal(&mut self, lit: &Literal) -> Expr {
        self.0.literal(lit)
    }

    fn visit_infix(&mut self, infix: &InfixExpr) -> Expr {
        self.0.infix(infix)
    }

    fn visit_prefix(&mut self, prefix: &PrefixExpr) -> Expr {
        self.0.prefix(prefix)
    }

    fn visit_function(&mut self, function: &FunctionExpr) -> Expr {
        self.0.function(function)
    }

    fn visit_multi_function(&mut self, function: &MultiFunctionExpr) -> Expr {
        self.0.multi_function(function)
    }

    fn visit_window(&mut self, window: &WindowFunction) -> Expr {
        self.0.window(window)
    }

    fn visit_aliased(&mut self, aliased: &AliasedExpr) -> Expr {
        self.0.aliased(aliased)
    }

    fn visit_alias_ref(&mut self, alias: &str) -> Expr {
        self.0.alias_ref(alias)
    }

    fn visit_order_by(&mut self, order_by: &OrderByExpr) -> Expr {
        self.0.order_by(order_by)
    }

    fn visit_select(&mut self, select: &SelectCommand) -> Expr {
        self.0.select(select)
    }

    fn visit_join(&mut self, join: &JoinExpr) -> Expr {
        self.0.join(join)
    }

    fn visit_paren(&mut self, paren: &ParenExpr) -> Expr {
        self.0.paren(paren)
    }

    fn visit_distinct(&mut self, inner: &Expr) -> Expr {
        self.0.distinct(inner)
    }

    fn visit_table(&mut self, table: &TableRef) -> Expr {
        self.0.table(table)
    }
}

pub fn rewrite_all<R: Rewriter>(rewriter: &mut R, exprs: &[Expr]) -> Vec<Expr> {
    exprs.iter().map(|expr| rewriter.rewrite(expr)).collect()
}

pub fn walk_infix<R: Rewriter>(rewriter: &mut R, infix: &InfixExpr) -> Expr {
    Expr::Infix(InfixExpr {
        left: Box::new(rewriter.rewrite(&infix.left)),
        op: infix.op.clone(),
        right: Box::new(rewriter.rewrite(&infix.right)),
    })
}

pub fn walk_function<R: Rewriter>(rewriter: &mut R, function: &FunctionExpr) -> Expr {
    Expr::Function(FunctionExpr {
        name: function.name.clone(),
        args: rewrite_all(rewriter, &function.args),
    })
}

pub fn walk_window<R: Rewriter>(rewriter: &mut R, window: &WindowFunction) -> Expr {
    Expr::Window(WindowFunction {
        name: window.name.clone(),
        params: rewrite_all(rewriter, &window.params),
        args: rewrite_all(rewriter, &window.args),
        partition_by: rewrite_all(rewriter, &window.partition_by),
        order_by: window
            .order_by
            .iter()
            .map(|order_by| rewrite_order_by(rewriter, order_by))
            .collect(),
    })
}

pub fn walk_select<R: Rewriter>(rewriter: &mut R, select: &SelectCommand) -> SelectCommand {
    SelectCommand {
        ctes: select
            .ctes
            .iter()
            .map(|cte| Cte {
                name: cte.name.clone(),
                select: match rewriter.select(&cte.select) {
                    Expr::Select(inner) => *inner,
                    _ => cte.select.clone(),
                },
            })
            .collect(),
        columns: rewrite_all(rewriter, &select.columns),
        from: select
            .from
            .as_ref()
            .map(|from| Box::new(rewriter.rewrite(from))),
        where_clause: select
            .where_clause
            .as_ref()
            .map(|where_clause| Box::new(rewriter.rewrite(where_clause))),
        group_by: rewrite_all(rewriter, &select.group_by),
        order_by: select
            .order_by
            .iter()
            .map(|order_by| rewrite_order_by(rewriter, order_by))
            .collect(),
        limit: select.limit,
    }
}

/// Routes an embedded `OrderByExpr` through the `order_by` hook and keeps the
/// result typed; a hook that returns a bare expression keeps the direction.
pub fn rewrite_order_by<R: Rewriter>(rewriter: &mut R, order_by: &OrderByExpr) -> OrderByExpr {
    match rewriter.order_by(order_by) {
        Expr::OrderBy(rewritten) => rewritten,
        other => OrderByExpr {
            expr: Box::new(other),
            direction: order_by.direction,
        },
    }
}
