//! Field registry consumed by the compiler.
//!
//! The registry maps request field names (and their aliases) onto concrete
//! columns and declared types. It is shared read-only between requests.

use crate::expr::Expr;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};

pub const KEYWORD_SUFFIX: &str = ".keyword";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Keyword,
    Text,
    Long,
    Double,
    Boolean,
    /// Millisecond timestamp, stored as `DateTime64`.
    Date,
    /// Second-precision timestamp, stored as `DateTime`.
    DateSeconds,
    Ip,
    GeoPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTimeKind {
    None,
    DateTime,
    DateTime64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedField {
    pub column: String,
    pub field_type: FieldType,
}

pub trait FieldRegistry: Send + Sync {
    fn resolve(&self, name: &str) -> Option<ResolvedField>;

    /// Declared type of an already-resolved column.
    fn column_type(&self, column: &str) -> Option<FieldType>;

    /// Every known field name, used when a hit-returning aggregation names
    /// no `_source` fields.
    fn field_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn date_time_kind(&self, expr: &Expr) -> DateTimeKind {
        match expr.unaliased() {
            Expr::Column(col) => match self.column_type(&col.name) {
                Some(FieldType::Date) => DateTimeKind::DateTime64,
                Some(FieldType::DateSeconds) => DateTimeKind::DateTime,
                _ => DateTimeKind::None,
            },
            Expr::Function(function)
                if matches!(function.name.as_str(), "COALESCE" | "toTimezone") =>
            {
                function
                    .args
                    .first()
                    .map(|arg| self.date_time_kind(arg))
                    .unwrap_or(DateTimeKind::None)
            }
            _ => DateTimeKind::None,
        }
    }
}

/// Column backing `name` plus its declared type. Unknown fields map onto a
/// same-named column with any `.keyword` suffix dropped.
pub fn field_column(registry: &dyn FieldRegistry, name: &str) -> (String, Option<FieldType>) {
    match registry.resolve(name) {
        Some(field) => (field.column, Some(field.field_type)),
        None => (
            name.strip_suffix(KEYWORD_SUFFIX).unwrap_or(name).to_string(),
            None,
        ),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FieldDef {
    #[serde(rename = "type")]
    field_type: FieldType,
    #[serde(default)]
    column: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    fields: BTreeMap<String, FieldDef>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

/// In-memory registry, usually loaded once from a JSON schema file.
#[derive(Debug, Clone, Default)]
pub struct StaticFieldRegistry {
    fields: BTreeMap<String, ResolvedField>,
    aliases: BTreeMap<String, String>,
    columns: BTreeMap<String, FieldType>,
}

impl StaticFieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let file: SchemaFile = serde_json::from_str(raw).context("invalid schema JSON")?;
        let mut registry = Self::new();
        for (name, def) in file.fields {
            let column = def.column.unwrap_or_else(|| name.clone());
            registry = registry.with_column(name, column, def.field_type);
        }
        for (alias, target) in file.aliases {
            registry = registry.with_alias(alias, target);
        }
        Ok(registry)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read schema file {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn with_field(self, name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        let column = name.clone();
        self.with_column(name, column, field_type)
    }

    pub fn with_column(
        mut self,
        name: impl Into<String>,
        column: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        let column = column.into();
        self.columns.insert(column.clone(), field_type);
        self.fields
            .insert(name.into(), ResolvedField { column, field_type });
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), target.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FieldRegistry for StaticFieldRegistry {
    fn resolve(&self, name: &str) -> Option<ResolvedField> {
        let lookup = |candidate: &str| {
            let target = self
                .aliases
                .get(candidate)
                .map(String::as_str)
                .unwrap_or(candidate);
            self.fields.get(target).cloned()
        };

        lookup(name).or_else(|| {
            name.strip_suffix(KEYWORD_SUFFIX)
                .and_then(|trimmed| lookup(trimmed))
        })
    }

    fn column_type(&self, column: &str) -> Option<FieldType> {
        self.columns.get(column).copied()
    }

    fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }
}
