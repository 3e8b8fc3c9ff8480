//! Live schema introspection
//!
//! Introspectors read the database catalog into a [`LiveSchema`]. They are read
//! only, and either return the whole schema or an error; a partially read schema
//! is never handed to the differ.

use async_trait::async_trait;

use crate::error::IntrospectionError;
use crate::schema::{ColumnDefinition, ColumnType, IndexDefinition, LiveSchema, TableSchema};

/// Reads table, column and index metadata from a connected database
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    /// Read the current structure of every user table.
    ///
    /// Tables are returned sorted by name, columns in ordinal order and
    /// indexes sorted by name, so two reads of an unchanged database compare equal.
    async fn introspect(&self) -> Result<LiveSchema, IntrospectionError>;
}

/// One catalog row describing a column, before normalization
#[derive(Debug, Clone)]
pub(crate) struct RawColumn {
    pub table: String,
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

impl RawColumn {
    /// Normalize the vendor type and fold sequence defaults into serial types.
    pub fn into_definition(self) -> Result<ColumnDefinition, IntrospectionError> {
        let mut column_type =
            ColumnType::from_native(&self.data_type).map_err(|e| IntrospectionError::Catalog {
                object: format!("{}.{}", self.table, self.name),
                message: e.to_string(),
            })?;

        let mut default = self.default;
        if default
            .as_deref()
            .is_some_and(|d| d.trim_start().to_ascii_lowercase().starts_with("nextval("))
        {
            column_type = column_type.as_serial();
            default = None;
        }

        Ok(ColumnDefinition {
            name: self.name,
            column_type,
            nullable: self.nullable && !self.primary_key,
            default,
            primary_key: self.primary_key,
        })
    }
}

/// Collects catalog rows into a sorted [`LiveSchema`]
#[derive(Debug, Default)]
pub(crate) struct SchemaAssembler {
    tables: Vec<TableSchema>,
}

impl SchemaAssembler {
    pub fn table_mut(&mut self, name: &str) -> &mut TableSchema {
        let position = match self.tables.iter().position(|t| t.name == name) {
            Some(position) => position,
            None => {
                self.tables.push(TableSchema::new(name));
                self.tables.len() - 1
            }
        };
        &mut self.tables[position]
    }

    pub fn push_column(&mut self, raw: RawColumn) -> Result<(), IntrospectionError> {
        let table = raw.table.clone();
        let column = raw.into_definition()?;
        self.table_mut(&table).columns.push(column);
        Ok(())
    }

    /// Add an index column; columns must arrive in key order.
    pub fn push_index_column(&mut self, table: &str, index: &str, unique: bool, column: &str) {
        let table = self.table_mut(table);
        match table.indexes.iter_mut().find(|i| i.name == index) {
            Some(existing) => existing.columns.push(column.to_string()),
            None => {
                let mut definition = IndexDefinition::new(index, vec![column.to_string()]);
                definition.unique = unique;
                table.indexes.push(definition);
            }
        }
    }

    pub fn finish(mut self) -> LiveSchema {
        self.tables.sort_by(|a, b| a.name.cmp(&b.name));
        for table in &mut self.tables {
            table.indexes.sort_by(|a, b| a.name.cmp(&b.name));
        }
        LiveSchema::new(self.tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, data_type: &str, default: Option<&str>) -> RawColumn {
        RawColumn {
            table: "items".into(),
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: default.map(str::to_string),
            primary_key: false,
        }
    }

    #[test]
    fn test_sequence_default_becomes_serial() {
        let column = raw("id", "integer", Some("nextval('items_id_seq'::regclass)"))
            .into_definition()
            .unwrap();
        assert_eq!(column.column_type, ColumnType::Serial);
        assert_eq!(column.default, None);

        let column = raw("id", "bigint", Some("nextval('items_id_seq'::regclass)"))
            .into_definition()
            .unwrap();
        assert_eq!(column.column_type, ColumnType::BigSerial);
    }

    #[test]
    fn test_assembler_sorts_output() {
        let mut assembler = SchemaAssembler::default();
        assembler.push_column(raw("b", "text", None)).unwrap();
        let mut other = raw("x", "int4", None);
        other.table = "alpha".into();
        other.primary_key = true;
        assembler.push_column(other).unwrap();
        assembler.push_index_column("items", "items_z_idx", false, "b");
        assembler.push_index_column("items", "items_a_idx", true, "b");

        let schema = assembler.finish();
        assert_eq!(schema.table_names(), vec!["alpha", "items"]);
        let alpha = schema.table("alpha").unwrap();
        assert!(!alpha.columns[0].nullable);
        let items = schema.table("items").unwrap();
        assert_eq!(items.indexes[0].name, "items_a_idx");
        assert!(items.indexes[0].unique);
    }
}
