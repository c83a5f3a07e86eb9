//! Request-level entry points: a DSL search body becomes one SQL statement,
//! and the rows that statement returned become the response body.

use crate::{
    aggregation::{
        parser::{AggregationParser, ParseContext},
        values::as_count,
    },
    config::AppConfig,
    error::Result,
    expr::{
        passes::{used_columns, AliasResolver, HighlightTokens, PlaceholderSubstitution},
        visitor::walk_select,
        Expr, SelectCommand,
    },
    filter::DslFilterTranslator,
    pancake::{
        render::{total_hits, Row},
        PancakeModel, PancakeTransformer, RenderContext, Renderer, SqlGenerator,
    },
    schema::FieldRegistry,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{
    collections::BTreeMap,
    sync::{atomic::AtomicBool, Arc},
};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateRequest {
    /// Table to read from; the configured default when absent.
    #[serde(default)]
    pub index: Option<String>,
    /// The search body: `query`, `aggs`, `track_total_hits`, ...
    pub body: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateResponse {
    pub sql: String,
    /// Anchor of `now`-relative date math in `sql`. Send it back with the
    /// rows so they are read against the same ranges.
    pub now: DateTime<Utc>,
    /// Filter terms per column, longest first.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub highlight: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    #[serde(default)]
    pub index: Option<String>,
    pub body: Value,
    /// `now` of the translation that produced the rows; the current time
    /// when absent.
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
    /// Result rows of the translated SQL, keyed by column alias.
    #[serde(default)]
    pub rows: Vec<Row>,
}

/// What the renderer needs to read the rows of a translated request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub model: PancakeModel,
}

#[derive(Debug, Clone)]
pub struct Translation {
    pub sql: String,
    pub plan: QueryPlan,
    pub now: DateTime<Utc>,
    pub highlight: HighlightTokens,
}

impl Translation {
    pub fn response(self) -> TranslateResponse {
        TranslateResponse {
            sql: self.sql,
            now: self.now,
            highlight: self.highlight.into_sorted(),
        }
    }
}

#[derive(Clone)]
pub struct QueryEngine {
    registry: Arc<dyn FieldRegistry>,
    config: Arc<AppConfig>,
}

impl QueryEngine {
    pub fn new(registry: Arc<dyn FieldRegistry>, config: Arc<AppConfig>) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn translate(&self, index: Option<&str>, body: &Value) -> Result<Translation> {
        self.translate_at(index, body, Utc::now())
    }

    /// Like [`translate`](Self::translate) with `now`-relative date math
    /// anchored at `now`.
    pub fn translate_at(
        &self,
        index: Option<&str>,
        body: &Value,
        now: DateTime<Utc>,
    ) -> Result<Translation> {
        let table = index.unwrap_or(&self.config.default_table);
        let registry = self.registry.as_ref();
        let filters = DslFilterTranslator::new(registry, now);
        let tree = AggregationParser::new(ParseContext {
            registry,
            filters: &filters,
            now,
            index: table,
        })
        .parse_request(body)?;

        let model = PancakeTransformer::new().transform(tree)?;
        let select = if model.layers.is_empty() {
            SelectCommand::new(vec![Expr::count_all()], Expr::table_placeholder())
                .with_where(model.where_clause.clone())
        } else {
            SqlGenerator.generate(&model)?
        };

        let select = walk_select(&mut AliasResolver::new(registry), &select);
        let highlight = model
            .where_clause
            .as_ref()
            .map(|where_clause| {
                HighlightTokens::collect(&where_clause.rewrite(&mut AliasResolver::new(registry)))
            })
            .unwrap_or_default();
        let select = PlaceholderSubstitution::apply(table, &select);
        let sql = select.to_sql();
        debug!(
            %table,
            columns = select.columns.len(),
            filter_columns = ?model.where_clause.as_ref().map(used_columns).unwrap_or_default(),
            highlighted = !highlight.is_empty(),
            %sql,
            "translated search request"
        );

        Ok(Translation {
            sql,
            plan: QueryPlan { model },
            now,
            highlight,
        })
    }

    /// Response body for the rows a translated request returned.
    pub fn render(&self, plan: &QueryPlan, rows: &[Row], cancel: &AtomicBool) -> Result<Value> {
        let mut response = Map::new();

        if plan.model.layers.is_empty() {
            let total = rows
                .first()
                .and_then(|row| row.values().next())
                .map(as_count)
                .unwrap_or(0);
            response.insert("hits".into(), hits(total));
            return Ok(Value::Object(response));
        }

        let total = total_hits(&plan.model, rows);
        let aggregations = Renderer::new(
            &plan.model,
            RenderContext {
                max_empty_buckets: self.config.translator.max_empty_buckets,
                total_hits: total,
                cancel,
            },
        )
        .render(rows)?;

        if let Some(total) = total {
            response.insert("hits".into(), hits(total));
        }
        if !aggregations.is_empty() {
            response.insert("aggregations".into(), Value::Object(aggregations));
        }
        Ok(Value::Object(response))
    }

    /// Translates and renders in one go, for callers that already ran the SQL.
    pub fn render_request(&self, request: &RenderRequest, cancel: &AtomicBool) -> Result<Value> {
        let now = request.now.unwrap_or_else(Utc::now);
        let translation = self.translate_at(request.index.as_deref(), &request.body, now)?;
        self.render(&translation.plan, &request.rows, cancel)
    }
}

fn hits(total: u64) -> Value {
    json!({ "total": { "value": total, "relation": "eq" } })
}
