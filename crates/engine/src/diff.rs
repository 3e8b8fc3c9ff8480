//! Drift detection
//!
//! [`SchemaDiffer::diff`] compares a declared schema against a live one and
//! produces the ordered list of structural changes that would make the live
//! schema match. It is a pure function.
//!
//! Renames are not detected: a renamed table or column shows up as a removal
//! plus an addition.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::schema::{
    ColumnDefinition, DeclaredSchema, IndexDefinition, LiveSchema, TableSchema,
};

/// Kind of structural delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    TableAdded,
    TableRemoved,
    ColumnAdded,
    ColumnRemoved,
    ColumnTypeChanged,
    IndexAdded,
    IndexRemoved,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::TableAdded => "table_added",
            ChangeKind::TableRemoved => "table_removed",
            ChangeKind::ColumnAdded => "column_added",
            ChangeKind::ColumnRemoved => "column_removed",
            ChangeKind::ColumnTypeChanged => "column_type_changed",
            ChangeKind::IndexAdded => "index_added",
            ChangeKind::IndexRemoved => "index_removed",
        };
        write!(f, "{}", name)
    }
}

/// The object a change creates or removes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "snake_case")]
pub enum Definition {
    Table(TableSchema),
    Column(ColumnDefinition),
    Index(IndexDefinition),
}

/// One structural delta between declared and live schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub kind: ChangeKind,
    pub table: String,
    pub column: Option<String>,
    pub old_definition: Option<Definition>,
    pub new_definition: Option<Definition>,
}

impl SchemaChange {
    pub fn table_added(table: &TableSchema) -> Self {
        Self {
            kind: ChangeKind::TableAdded,
            table: table.name.clone(),
            column: None,
            old_definition: None,
            new_definition: Some(Definition::Table(table.clone())),
        }
    }

    pub fn table_removed(table: &TableSchema) -> Self {
        Self {
            kind: ChangeKind::TableRemoved,
            table: table.name.clone(),
            column: None,
            old_definition: Some(Definition::Table(table.clone())),
            new_definition: None,
        }
    }

    pub fn column_added(table: &str, column: &ColumnDefinition) -> Self {
        Self {
            kind: ChangeKind::ColumnAdded,
            table: table.to_string(),
            column: Some(column.name.clone()),
            old_definition: None,
            new_definition: Some(Definition::Column(column.clone())),
        }
    }

    pub fn column_removed(table: &str, column: &ColumnDefinition) -> Self {
        Self {
            kind: ChangeKind::ColumnRemoved,
            table: table.to_string(),
            column: Some(column.name.clone()),
            old_definition: Some(Definition::Column(column.clone())),
            new_definition: None,
        }
    }

    pub fn column_changed(table: &str, old: &ColumnDefinition, new: &ColumnDefinition) -> Self {
        Self {
            kind: ChangeKind::ColumnTypeChanged,
            table: table.to_string(),
            column: Some(new.name.clone()),
            old_definition: Some(Definition::Column(old.clone())),
            new_definition: Some(Definition::Column(new.clone())),
        }
    }

    pub fn index_added(table: &str, index: &IndexDefinition) -> Self {
        Self {
            kind: ChangeKind::IndexAdded,
            table: table.to_string(),
            column: None,
            old_definition: None,
            new_definition: Some(Definition::Index(index.clone())),
        }
    }

    pub fn index_removed(table: &str, index: &IndexDefinition) -> Self {
        Self {
            kind: ChangeKind::IndexRemoved,
            table: table.to_string(),
            column: None,
            old_definition: Some(Definition::Index(index.clone())),
            new_definition: None,
        }
    }

    /// Name of the index this change touches, if any
    pub fn index_name(&self) -> Option<&str> {
        match (&self.new_definition, &self.old_definition) {
            (Some(Definition::Index(index)), _) | (_, Some(Definition::Index(index))) => {
                Some(index.name.as_str())
            }
            _ => None,
        }
    }

    /// Short human-readable summary, used in migration descriptions
    pub fn describe(&self) -> String {
        let column = self.column.as_deref().unwrap_or_default();
        let index = self.index_name().unwrap_or_default();
        match self.kind {
            ChangeKind::TableAdded => format!("create table {}", self.table),
            ChangeKind::TableRemoved => format!("drop table {}", self.table),
            ChangeKind::ColumnAdded => format!("add column {}.{}", self.table, column),
            ChangeKind::ColumnRemoved => format!("drop column {}.{}", self.table, column),
            ChangeKind::ColumnTypeChanged => format!("alter column {}.{}", self.table, column),
            ChangeKind::IndexAdded => format!("create index {} on {}", index, self.table),
            ChangeKind::IndexRemoved => format!("drop index {} on {}", index, self.table),
        }
    }
}

/// Compares declared and live schemas
pub struct SchemaDiffer;

impl SchemaDiffer {
    /// Produce the changes that turn `live` into `declared`.
    ///
    /// Changes are grouped by table, tables in declared order followed by
    /// removed tables in live order. Within a table: index removals, column
    /// removals, column additions, column alterations, index additions.
    pub fn diff(declared: &DeclaredSchema, live: &LiveSchema) -> Vec<SchemaChange> {
        let mut changes = Vec::new();

        for table in &declared.tables {
            match live.table(&table.name) {
                None => changes.push(SchemaChange::table_added(table)),
                Some(existing) => diff_table(table, existing, &mut changes),
            }
        }

        let declared_names: HashSet<&str> = declared.table_names().into_iter().collect();
        for table in &live.tables {
            if !declared_names.contains(table.name.as_str()) {
                changes.push(SchemaChange::table_removed(table));
            }
        }

        changes
    }
}

/// Convenience wrapper around [`SchemaDiffer::diff`]
pub fn diff(declared: &DeclaredSchema, live: &LiveSchema) -> Vec<SchemaChange> {
    SchemaDiffer::diff(declared, live)
}

fn diff_table(declared: &TableSchema, live: &TableSchema, changes: &mut Vec<SchemaChange>) {
    let table = declared.name.as_str();

    // An index whose definition changed is dropped and recreated
    let stale_indexes: Vec<&IndexDefinition> = live
        .indexes
        .iter()
        .filter(|index| {
            declared
                .find_index(&index.name)
                .map_or(true, |wanted| !same_index(wanted, index))
        })
        .collect();
    let new_indexes: Vec<&IndexDefinition> = declared
        .indexes
        .iter()
        .filter(|index| {
            live.find_index(&index.name)
                .map_or(true, |existing| !same_index(index, existing))
        })
        .collect();

    for index in &stale_indexes {
        changes.push(SchemaChange::index_removed(table, index));
    }

    for column in &live.columns {
        if declared.find_column(&column.name).is_none() {
            changes.push(SchemaChange::column_removed(table, column));
        }
    }

    for column in &declared.columns {
        if live.find_column(&column.name).is_none() {
            changes.push(SchemaChange::column_added(table, column));
        }
    }

    for column in &declared.columns {
        if let Some(existing) = live.find_column(&column.name) {
            if existing.differs_from(column) {
                changes.push(SchemaChange::column_changed(table, existing, column));
            }
        }
    }

    for index in &new_indexes {
        changes.push(SchemaChange::index_added(table, index));
    }
}

fn same_index(a: &IndexDefinition, b: &IndexDefinition) -> bool {
    a.columns == b.columns && a.unique == b.unique
}
