//! Schema model
//!
//! A [`Schema`] is the normalized, vendor-agnostic description of a set of tables.
//! The same type represents both sides of drift detection: the declared model
//! loaded from YAML or JSON, and the live database as read by an introspector.

pub mod types;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub use crate::error::SchemaError;
pub use types::{normalize_default, ColumnType, WidthChange};

/// Schema described by the application
pub type DeclaredSchema = Schema;

/// Schema read back from the database
pub type LiveSchema = Schema;

/// Column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
}

fn default_nullable() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ColumnDefinition {
    /// Create a nullable column without a default
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            default: None,
            primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }

    /// Mark as primary key; primary key columns are never nullable
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Default expression in comparable form
    pub fn normalized_default(&self) -> Option<String> {
        self.default.as_deref().and_then(normalize_default)
    }

    /// Whether two definitions of the same column differ in type, nullability or default.
    pub fn differs_from(&self, other: &ColumnDefinition) -> bool {
        self.column_type.width_change(&other.column_type) != WidthChange::Same
            || self.nullable != other.nullable
            || self.effective_default() != other.effective_default()
    }

    /// Serial columns own their sequence default, so it never counts as drift.
    fn effective_default(&self) -> Option<String> {
        if self.column_type.is_serial() {
            None
        } else {
            self.normalized_default()
        }
    }
}

/// Secondary index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Table definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDefinition>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexDefinition> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// A set of tables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub tables: Vec<TableSchema>,
}

impl Schema {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self { tables }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Parse and validate a YAML schema document.
    pub fn from_yaml(source: &str) -> Result<Self, SchemaError> {
        let schema: Schema =
            serde_yaml::from_str(source).map_err(|e| SchemaError::Parse(e.to_string()))?;
        schema.prepared()
    }

    /// Parse and validate a JSON schema document.
    pub fn from_json(source: &str) -> Result<Self, SchemaError> {
        let schema: Schema =
            serde_json::from_str(source).map_err(|e| SchemaError::Parse(e.to_string()))?;
        schema.prepared()
    }

    /// Load a schema file, choosing the format from its extension (`.json`, else YAML).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json(&source),
            _ => Self::from_yaml(&source),
        }
    }

    fn prepared(mut self) -> Result<Self, SchemaError> {
        self.normalize();
        self.validate()?;
        Ok(self)
    }

    /// Apply implicit rules: primary key columns are NOT NULL.
    pub fn normalize(&mut self) {
        for column in self.tables.iter_mut().flat_map(|t| t.columns.iter_mut()) {
            if column.primary_key {
                column.nullable = false;
            }
        }
    }

    /// Check structural consistency of the schema.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut table_names = HashSet::new();
        let mut index_names = HashSet::new();

        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(SchemaError::EmptyIdentifier("table name".to_string()));
            }
            if !table_names.insert(table.name.as_str()) {
                return Err(SchemaError::DuplicateTable(table.name.clone()));
            }
            if table.columns.is_empty() {
                return Err(SchemaError::EmptyTable(table.name.clone()));
            }

            let mut column_names = HashSet::new();
            for column in &table.columns {
                if column.name.trim().is_empty() {
                    return Err(SchemaError::EmptyIdentifier(format!(
                        "column of table '{}'",
                        table.name
                    )));
                }
                if !column_names.insert(column.name.as_str()) {
                    return Err(SchemaError::DuplicateColumn {
                        table: table.name.clone(),
                        column: column.name.clone(),
                    });
                }
            }

            for index in &table.indexes {
                if index.name.trim().is_empty() {
                    return Err(SchemaError::EmptyIdentifier(format!(
                        "index of table '{}'",
                        table.name
                    )));
                }
                // Index names share one namespace per database schema
                if !index_names.insert(index.name.as_str()) {
                    return Err(SchemaError::DuplicateIndex(index.name.clone()));
                }
                if index.columns.is_empty() {
                    return Err(SchemaError::EmptyIndex {
                        table: table.name.clone(),
                        index: index.name.clone(),
                    });
                }
                if let Some(missing) = index
                    .columns
                    .iter()
                    .find(|c| !column_names.contains(c.as_str()))
                {
                    return Err(SchemaError::UnknownIndexColumn {
                        table: table.name.clone(),
                        index: index.name.clone(),
                        column: missing.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
