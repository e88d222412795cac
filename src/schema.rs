//! Schema model and the provider interface.
//!
//! A schema names a namespace plus a set of tables; tables declare optional
//! strict columns, secondary indexes and a primary strategy. The engine does
//! not enforce column types at the storage layer; the schema is advisory for
//! rows and authoritative only for indexing and id generation.
//!
//! Loading and watching schema files (or the backend pub/sub channel) is the
//! job of an external provider; this module defines the [`SchemaProvider`]
//! contract it must satisfy plus [`MemoryProvider`], an in-process
//! implementation used by tests and embedders.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::value::Value;

/// Backend field-map where deployed schemas are stored by the provider.
pub const SCHEMAS_KEY: &str = "__mdz_schemas__";
/// Backend pub/sub channel carrying schema update notifications.
pub const UPDATES_CHANNEL: &str = "__mdz_updates__";

pub const REDIS_ENGINE: &str = "redis";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Uint,
    Float,
    Bool,
    Text,
    Binary,
    Timestamp,
    Set,
    List,
    Map,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Option<ColumnType>,
    pub default: Option<Value>,
    pub required: bool,
    pub max_len: Option<usize>,
    pub choices: Vec<Value>,
}

impl ColumnSpec {
    fn validate(&mut self, name: &str) -> Result<()> {
        if self.name.is_empty() {
            self.name = name.to_string();
        }
        if !is_valid_name(&self.name) {
            return Err(Error::validation(format!(
                "invalid column name '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

/// Secondary index flavors. A simple index is a compound index over exactly
/// one column; the distinction survives for schema compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Simple,
    Compound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub columns: Vec<String>,
    #[serde(rename = "type")]
    pub kind: IndexKind,
}

impl IndexSpec {
    pub fn simple(column: impl Into<String>) -> Self {
        Self {
            columns: vec![column.into()],
            kind: IndexKind::Simple,
        }
    }

    pub fn compound(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            kind: IndexKind::Compound,
        }
    }

    /// Stable identity of an index within its table, used to detect drops
    /// across schema reloads.
    pub fn identity(&self, table: &str) -> String {
        format!(
            "{table}|{}|{}",
            self.columns.join(","),
            match self.kind {
                IndexKind::Simple => "simple",
                IndexKind::Compound => "compound",
            }
        )
    }

    fn validate(&self, table: &TableSpec) -> Result<()> {
        if self.columns.is_empty() {
            return Err(Error::validation(format!(
                "index on table {} has no columns",
                table.name
            )));
        }
        if self.kind == IndexKind::Simple && self.columns.len() != 1 {
            return Err(Error::validation(format!(
                "simple index on table {} must have exactly one column",
                table.name
            )));
        }
        if table.strict {
            for col in &self.columns {
                if !table.columns.contains_key(col) {
                    return Err(Error::validation(format!(
                        "table {} does not declare column {col} required by an index",
                        table.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// How a table generates and owns its ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PrimarySpec {
    Random,
    Compound {
        columns: Vec<String>,
        #[serde(default)]
        hashed: bool,
    },
}

impl Default for PrimarySpec {
    fn default() -> Self {
        PrimarySpec::Random
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSpec {
    /// Qualified name, `<schema>.<table>`. Filled in by validation.
    #[serde(skip)]
    pub name: String,
    pub engines: Vec<String>,
    pub strict: bool,
    pub columns: BTreeMap<String, ColumnSpec>,
    pub indexes: Vec<IndexSpec>,
    pub primary: Option<PrimarySpec>,
}

impl TableSpec {
    pub fn new() -> Self {
        Self {
            engines: vec![REDIS_ENGINE.to_string()],
            ..Self::default()
        }
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_primary(mut self, primary: PrimarySpec) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn with_column(mut self, name: impl Into<String>, kind: ColumnType) -> Self {
        let name = name.into();
        self.columns.insert(
            name.clone(),
            ColumnSpec {
                name,
                kind: Some(kind),
                ..ColumnSpec::default()
            },
        );
        self
    }

    pub fn primary(&self) -> &PrimarySpec {
        const DEFAULT_PRIMARY: PrimarySpec = PrimarySpec::Random;
        self.primary.as_ref().unwrap_or(&DEFAULT_PRIMARY)
    }

    fn validate(&mut self, qualified: String) -> Result<()> {
        self.name = qualified;
        if self.engines.is_empty() {
            return Err(Error::validation(format!(
                "no engines specified for table {}",
                self.name
            )));
        }
        for (name, col) in &mut self.columns {
            col.validate(name)?;
        }
        let snapshot = self.clone();
        for index in &self.indexes {
            index.validate(&snapshot)?;
        }
        if let Some(PrimarySpec::Compound { columns, .. }) = &self.primary {
            if columns.is_empty() {
                return Err(Error::validation(format!(
                    "compound primary on table {} has no columns",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "schema")]
    pub name: String,
    pub tables: BTreeMap<String, TableSpec>,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: BTreeMap::new(),
        }
    }

    pub fn with_table(mut self, base_name: impl Into<String>, table: TableSpec) -> Self {
        self.tables.insert(base_name.into(), table);
        self
    }

    /// Validates names and index declarations and qualifies every table as
    /// `<schema>.<table>`.
    pub fn validate(&mut self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("schema has no name"));
        }
        if !is_valid_name(&self.name) {
            return Err(Error::validation(format!(
                "invalid schema name '{}'",
                self.name
            )));
        }
        let schema_name = self.name.clone();
        for (base, table) in &mut self.tables {
            if !is_valid_name(base) {
                return Err(Error::validation(format!("invalid table name '{base}'")));
            }
            table.validate(format!("{schema_name}.{base}"))?;
        }
        Ok(())
    }
}

/// `[A-Za-z][A-Za-z0-9_]*`
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits a qualified table name into (schema, table) if well-formed.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    let (schema, table) = name.split_once('.')?;
    (is_valid_name(schema) && is_valid_name(table)).then_some((schema, table))
}

/// Source of schema definitions and live updates for the driver.
pub trait SchemaProvider: Send + Sync + 'static {
    fn schemas(&self) -> Vec<Schema>;
    fn updates(&self) -> broadcast::Receiver<Schema>;
}

/// In-process provider: schemas are deployed programmatically and re-broadcast
/// to every subscribed driver.
pub struct MemoryProvider {
    schemas: RwLock<BTreeMap<String, Schema>>,
    updates: broadcast::Sender<Schema>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            schemas: RwLock::new(BTreeMap::new()),
            updates,
        }
    }

    /// Validates and stores a schema, notifying subscribed drivers.
    pub fn deploy(&self, mut schema: Schema) -> Result<()> {
        schema.validate()?;
        tracing::info!(schema = %schema.name, tables = schema.tables.len(), "deploying schema");
        self.schemas
            .write()
            .insert(schema.name.clone(), schema.clone());
        let _ = self.updates.send(schema);
        Ok(())
    }
}

impl SchemaProvider for MemoryProvider {
    fn schemas(&self) -> Vec<Schema> {
        self.schemas.read().values().cloned().collect()
    }

    fn updates(&self) -> broadcast::Receiver<Schema> {
        self.updates.subscribe()
    }
}
