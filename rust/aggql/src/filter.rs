//! Translation of the structured query DSL (`term`, `range`, `bool`, ...) into
//! boolean expressions. Free-text query grammars are resolved upstream and
//! are rejected here.

use crate::{
    error::{Result, ServiceError},
    expr::Expr,
    schema::{field_column, DateTimeKind, FieldRegistry, FieldType},
    time,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

pub trait FilterTranslator {
    /// `Ok(None)` means "no filtering".
    fn translate(&self, query: &Value) -> Result<Option<Expr>>;
}

pub struct DslFilterTranslator<'a> {
    registry: &'a dyn FieldRegistry,
    now: DateTime<Utc>,
}

impl<'a> DslFilterTranslator<'a> {
    pub fn new(registry: &'a dyn FieldRegistry, now: DateTime<Utc>) -> Self {
        Self { registry, now }
    }

    fn clause(&self, kind: &str, params: &Value) -> Result<Option<Expr>> {
        match kind {
            "match_all" => Ok(None),
            "match_none" => Ok(Some(Expr::Literal(crate::expr::Literal::Bool(false)))),
            "bool" => self.bool_query(object(params, "bool")?),
            "term" => self.single_field(params, "term", |this, field, value| {
                this.term(field, unwrap_value(value))
            }),
            "terms" => self.terms(object(params, "terms")?),
            "match" | "match_phrase" => self.single_field(params, kind, |this, field, value| {
                let value = match value {
                    Value::Object(options) => options.get("query").unwrap_or(&Value::Null),
                    other => other,
                };
                this.match_query(field, value, kind == "match_phrase")
            }),
            "range" => self.single_field(params, "range", |this, field, value| {
                this.range(field, object(value, "range")?)
            }),
            "exists" => {
                let field = object(params, "exists")?
                    .get("field")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ServiceError::invalid("exists requires a field"))?;
                Ok(Some(Expr::infix(self.column(field).0, "IS NOT", Expr::null())))
            }
            "prefix" => self.single_field(params, "prefix", |this, field, value| {
                let prefix = as_text(unwrap_value(value));
                Ok(Some(Expr::infix(
                    this.column(field).0,
                    "LIKE",
                    Expr::string(format!("{}%", escape_like(&prefix))),
                )))
            }),
            "wildcard" => self.single_field(params, "wildcard", |this, field, value| {
                let pattern = as_text(unwrap_value(value));
                Ok(Some(Expr::infix(
                    this.column(field).0,
                    "LIKE",
                    Expr::string(wildcard_to_like(&pattern)),
                )))
            }),
            "regexp" => self.single_field(params, "regexp", |this, field, value| {
                let pattern = as_text(unwrap_value(value));
                Ok(Some(Expr::function(
                    "match",
                    vec![this.column(field).0, Expr::string(pattern)],
                )))
            }),
            "query_string" | "simple_query_string" => Err(ServiceError::NotImplemented(format!(
                "{kind} must be translated before aggregation compilation"
            ))),
            other => Err(ServiceError::NotImplemented(format!(
                "query clause '{other}'"
            ))),
        }
    }

    fn bool_query(&self, params: &Map<String, Value>) -> Result<Option<Expr>> {
        let collect = |key: &str| -> Result<Vec<Expr>> {
            let mut exprs = Vec::new();
            match params.get(key) {
                None => {}
                Some(Value::Array(items)) => {
                    for item in items {
                        exprs.extend(self.translate(item)?);
                    }
                }
                Some(single) => exprs.extend(self.translate(single)?),
            }
            Ok(exprs)
        };

        let mut must = collect("must")?;
        must.extend(collect("filter")?);
        let should = collect("should")?;
        let must_not = collect("must_not")?;

        let minimum_should_match = params
            .get("minimum_should_match")
            .and_then(Value::as_i64)
            .unwrap_or(if must.is_empty() { 1 } else { 0 });

        let mut clauses = must;
        if minimum_should_match > 0 {
            if minimum_should_match > 1 {
                warn!(
                    minimum_should_match,
                    "minimum_should_match above 1 is treated as 1"
                );
            }
            clauses.extend(Expr::or(should));
        }
        if let Some(negated) = Expr::or(must_not) {
            clauses.push(Expr::prefix("NOT", vec![negated]));
        }
        Ok(Expr::and(clauses))
    }

    fn single_field<F>(&self, params: &Value, kind: &str, build: F) -> Result<Option<Expr>>
    where
        F: Fn(&Self, &str, &Value) -> Result<Option<Expr>>,
    {
        let params = object(params, kind)?;
        let mut clauses = Vec::new();
        for (field, value) in params {
            if field == "boost" || field == "_name" {
                continue;
            }
            clauses.extend(build(self, field, value)?);
        }
        Ok(Expr::and(clauses))
    }

    fn term(&self, field: &str, value: &Value) -> Result<Option<Expr>> {
        let (column, _) = self.column(field);
        Ok(Some(Expr::infix(column, "=", literal(value)?)))
    }

    fn terms(&self, params: &Map<String, Value>) -> Result<Option<Expr>> {
        let mut clauses = Vec::new();
        for (field, values) in params {
            if field == "boost" || field == "_name" {
                continue;
            }
            let Value::Array(values) = values else {
                return Err(ServiceError::invalid(format!(
                    "terms on '{field}' expects an array"
                )));
            };
            let (column, _) = self.column(field);
            let literals = values.iter().map(literal).collect::<Result<Vec<_>>>()?;
            let clause = match literals.len() {
                0 => Expr::Literal(crate::expr::Literal::Bool(false)),
                1 => Expr::infix(column, "=", literals.into_iter().next().unwrap_or(Expr::null())),
                _ => Expr::infix(column, "IN", Expr::function("tuple", literals)),
            };
            clauses.push(clause);
        }
        Ok(Expr::and(clauses))
    }

    fn match_query(&self, field: &str, value: &Value, phrase: bool) -> Result<Option<Expr>> {
        let (column, field_type) = self.column(field);
        if field_type != Some(FieldType::Text) {
            return Ok(Some(Expr::infix(column, "=", literal(value)?)));
        }
        let text = as_text(value);
        let tokens: Vec<&str> = if phrase {
            vec![text.as_str()]
        } else {
            text.split_whitespace().collect()
        };
        Ok(Expr::or(tokens.into_iter().map(|token| {
            Expr::infix(
                column.clone(),
                "ILIKE",
                Expr::string(format!("%{}%", escape_like(token))),
            )
        })))
    }

    fn range(&self, field: &str, params: &Map<String, Value>) -> Result<Option<Expr>> {
        let (column, _) = self.column(field);
        let kind = self.registry.date_time_kind(&column);
        let epoch_millis = params
            .get("format")
            .and_then(Value::as_str)
            .map(|format| format.contains("epoch_millis"))
            .unwrap_or(false);

        let mut clauses = Vec::new();
        for (key, op) in [("gte", ">="), ("gt", ">"), ("lte", "<="), ("lt", "<")] {
            let Some(bound) = params.get(key) else {
                continue;
            };
            if bound.is_null() {
                continue;
            }
            let value = self.range_bound(bound, kind, epoch_millis)?;
            clauses.push(Expr::infix(column.clone(), op, value));
        }
        Ok(Expr::and(clauses))
    }

    fn range_bound(&self, bound: &Value, kind: DateTimeKind, epoch_millis: bool) -> Result<Expr> {
        if kind == DateTimeKind::None {
            return literal(bound);
        }

        let needs_resolution = match bound {
            Value::Number(_) => true,
            Value::String(raw) => {
                epoch_millis || raw.trim_start().starts_with("now") || raw.contains("||")
            }
            _ => false,
        };
        if !needs_resolution {
            // Absolute strings are typed later by the timestamp-literal pass.
            return literal(bound);
        }

        let instant = time::parse_date_value(bound, self.now)?;
        Ok(date_literal(instant, kind))
    }

    fn column(&self, field: &str) -> (Expr, Option<FieldType>) {
        let (column, field_type) = field_column(self.registry, field);
        (Expr::column(column), field_type)
    }
}

impl FilterTranslator for DslFilterTranslator<'_> {
    fn translate(&self, query: &Value) -> Result<Option<Expr>> {
        let Value::Object(clauses) = query else {
            return Err(ServiceError::invalid(format!(
                "query must be an object, got {query}"
            )));
        };
        let mut translated = Vec::new();
        for (kind, params) in clauses {
            translated.extend(self.clause(kind, params)?);
        }
        Ok(Expr::and(translated))
    }
}

/// Timestamp literal in the precision of the compared column.
pub fn date_literal(instant: DateTime<Utc>, kind: DateTimeKind) -> Expr {
    match kind {
        DateTimeKind::DateTime => Expr::function(
            "fromUnixTimestamp",
            vec![Expr::int(instant.timestamp())],
        ),
        DateTimeKind::DateTime64 | DateTimeKind::None => Expr::function(
            "fromUnixTimestamp64Milli",
            vec![Expr::int(instant.timestamp_millis())],
        ),
    }
}

pub fn literal(value: &Value) -> Result<Expr> {
    match value {
        Value::Null => Ok(Expr::null()),
        Value::Bool(flag) => Ok(Expr::Literal(crate::expr::Literal::Bool(*flag))),
        Value::Number(number) => Ok(number
            .as_i64()
            .map(Expr::int)
            .unwrap_or_else(|| Expr::float(number.as_f64().unwrap_or(f64::NAN)))),
        Value::String(text) => Ok(Expr::string(text.clone())),
        other => Err(ServiceError::invalid(format!(
            "expected a scalar value, got {other}"
        ))),
    }
}

fn object<'v>(value: &'v Value, kind: &str) -> Result<&'v Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| ServiceError::invalid(format!("{kind} must be an object, got {value}")))
}

fn unwrap_value(value: &Value) -> &Value {
    match value {
        Value::Object(options) => options.get("value").unwrap_or(value),
        other => other,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn wildcard_to_like(pattern: &str) -> String {
    let mut like = String::with_capacity(pattern.len());
    for ch in pattern.chars() {
        match ch {
            '*' => like.push('%'),
            '?' => like.push('_'),
            '%' | '_' | '\\' => {
                like.push('\\');
                like.push(ch);
            }
            other => like.push(other),
        }
    }
    like
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StaticFieldRegistry;
    use chrono::TimeZone;
    use serde_json::json;

    fn registry() -> StaticFieldRegistry {
        StaticFieldRegistry::new()
            .with_column("@timestamp", "timestamp", FieldType::Date)
            .with_field("message", FieldType::Text)
            .with_field("status", FieldType::Long)
            .with_field("host.name", FieldType::Keyword)
    }

    fn translate(query: Value) -> Option<String> {
        let registry = registry();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        DslFilterTranslator::new(&registry, now)
            .translate(&query)
            .unwrap()
            .map(|expr| expr.to_sql())
    }

    #[test]
    fn match_all_is_no_filter() {
        assert_eq!(translate(json!({"match_all": {}})), None);
        assert_eq!(translate(json!({"bool": {}})), None);
    }

    #[test]
    fn term_and_terms() {
        assert_eq!(
            translate(json!({"term": {"host.name.keyword": {"value": "a"}}})).as_deref(),
            Some(r#""host.name"='a'"#)
        );
        assert_eq!(
            translate(json!({"terms": {"status": [200, 404]}})).as_deref(),
            Some(r#""status" IN tuple(200,404)"#)
        );
    }

    #[test]
    fn bool_combines_clauses() {
        let sql = translate(json!({
            "bool": {
                "filter": [{"term": {"status": 500}}],
                "should": [{"term": {"host.name": "a"}}, {"term": {"host.name": "b"}}],
                "minimum_should_match": 1,
                "must_not": {"exists": {"field": "message"}}
            }
        }))
        .unwrap();
        assert_eq!(
            sql,
            r#"(("status"=500 AND ("host.name"='a' OR "host.name"='b')) AND NOT ("message" IS NOT NULL))"#
        );
    }

    #[test]
    fn range_on_dates_resolves_date_math() {
        let sql = translate(json!({
            "range": {"@timestamp": {"gte": "now-1h", "lt": "2024-03-01T12:00:00Z"}}
        }))
        .unwrap();
        assert_eq!(
            sql,
            r#"("timestamp">=fromUnixTimestamp64Milli(1709290800000) AND "timestamp"<'2024-03-01T12:00:00Z')"#
        );
    }

    #[test]
    fn match_on_text_uses_ilike() {
        assert_eq!(
            translate(json!({"match": {"message": "disk full"}})).as_deref(),
            Some(r#"("message" ILIKE '%disk%' OR "message" ILIKE '%full%')"#)
        );
        assert_eq!(
            translate(json!({"match": {"status": {"query": 5}}})).as_deref(),
            Some(r#""status"=5"#)
        );
    }

    #[test]
    fn wildcard_and_prefix_escape() {
        assert_eq!(
            translate(json!({"wildcard": {"host.name": "web-?_*"}})).as_deref(),
            Some(r#""host.name" LIKE 'web-_\\_%'"#)
        );
        assert_eq!(
            translate(json!({"prefix": {"host.name": "50%"}})).as_deref(),
            Some(r#""host.name" LIKE '50\\%%'"#)
        );
    }

    #[test]
    fn free_text_queries_are_rejected() {
        let registry = registry();
        let err = DslFilterTranslator::new(&registry, Utc::now())
            .translate(&json!({"query_string": {"query": "a AND b"}}))
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotImplemented(_)));
    }
}
