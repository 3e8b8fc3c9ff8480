//! SQLite DDL
//!
//! SQLite cannot alter a column in place. Column alterations are rejected
//! rather than emulated with a table rebuild.

use super::DdlEmitter;
use crate::backends::DatabaseBackendType;
use crate::error::DdlError;
use crate::schema::{ColumnDefinition, ColumnType};

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteEmitter;

impl SqliteEmitter {
    pub fn new() -> Self {
        Self
    }
}

impl DdlEmitter for SqliteEmitter {
    fn dialect(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn render_type(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::SmallInt => "SMALLINT".to_string(),
            // An INTEGER primary key is the rowid alias and auto-increments
            ColumnType::Integer | ColumnType::Serial => "INTEGER".to_string(),
            ColumnType::BigInt | ColumnType::BigSerial => "BIGINT".to_string(),
            ColumnType::Real => "REAL".to_string(),
            ColumnType::Double => "DOUBLE PRECISION".to_string(),
            ColumnType::Decimal {
                precision: Some(p),
                scale: Some(s),
            } => format!("NUMERIC({}, {})", p, s),
            ColumnType::Decimal {
                precision: Some(p),
                scale: None,
            } => format!("NUMERIC({})", p),
            ColumnType::Decimal { .. } => "NUMERIC".to_string(),
            ColumnType::Boolean => "BOOLEAN".to_string(),
            ColumnType::Char(Some(n)) => format!("CHAR({})", n),
            ColumnType::Char(None) => "CHAR".to_string(),
            ColumnType::VarChar(Some(n)) => format!("VARCHAR({})", n),
            ColumnType::VarChar(None) => "VARCHAR".to_string(),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Bytes => "BLOB".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Time => "TIME".to_string(),
            ColumnType::TimeTz => "TIMETZ".to_string(),
            ColumnType::Timestamp => "TIMESTAMP".to_string(),
            ColumnType::TimestampTz => "TIMESTAMPTZ".to_string(),
            ColumnType::Uuid => "UUID".to_string(),
            ColumnType::Json => "JSON".to_string(),
            ColumnType::Jsonb => "JSONB".to_string(),
            ColumnType::Other(name) => name.to_uppercase(),
        }
    }

    fn alter_column(
        &self,
        table: &str,
        _old: &ColumnDefinition,
        new: &ColumnDefinition,
    ) -> Result<Vec<String>, DdlError> {
        Err(DdlError::Unsupported {
            dialect: self.dialect().to_string(),
            operation: format!("altering column {}.{}", table, new.name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableSchema;

    #[test]
    fn test_serial_renders_as_rowid_integer() {
        let emitter = SqliteEmitter::new();
        let table = TableSchema::new("items")
            .column(ColumnDefinition::new("id", ColumnType::Serial).primary_key())
            .column(ColumnDefinition::new("payload", ColumnType::Bytes));

        assert_eq!(
            emitter.create_table(&table),
            vec!["CREATE TABLE items (id INTEGER NOT NULL, payload BLOB, PRIMARY KEY (id))".to_string()]
        );
    }

    #[test]
    fn test_alter_column_is_unsupported() {
        let emitter = SqliteEmitter::new();
        let old = ColumnDefinition::new("title", ColumnType::Text);
        let new = ColumnDefinition::new("title", ColumnType::Text).not_null();

        match emitter.alter_column("items", &old, &new) {
            Err(DdlError::Unsupported { dialect, operation }) => {
                assert_eq!(dialect, "sqlite");
                assert!(operation.contains("items.title"));
            }
            other => panic!("Expected Unsupported, got {:?}", other),
        }
    }
}
