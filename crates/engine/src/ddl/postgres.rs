//! PostgreSQL DDL

use super::DdlEmitter;
use crate::backends::DatabaseBackendType;
use crate::error::DdlError;
use crate::schema::{ColumnDefinition, ColumnType, WidthChange};

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresEmitter;

impl PostgresEmitter {
    pub fn new() -> Self {
        Self
    }
}

impl DdlEmitter for PostgresEmitter {
    fn dialect(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    fn render_type(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::SmallInt => "SMALLINT".to_string(),
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Serial => "SERIAL".to_string(),
            ColumnType::BigSerial => "BIGSERIAL".to_string(),
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
            ColumnType::Bytes => "BYTEA".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Time => "TIME".to_string(),
            ColumnType::TimeTz => "TIMETZ".to_string(),
            ColumnType::Timestamp => "TIMESTAMP".to_string(),
            ColumnType::TimestampTz => "TIMESTAMPTZ".to_string(),
            ColumnType::Uuid => "UUID".to_string(),
            ColumnType::Json => "JSON".to_string(),
            ColumnType::Jsonb => "JSONB".to_string(),
            ColumnType::Other(name) => name.clone(),
        }
    }

    fn alter_column(
        &self,
        table: &str,
        old: &ColumnDefinition,
        new: &ColumnDefinition,
    ) -> Result<Vec<String>, DdlError> {
        let prefix = format!(
            "ALTER TABLE {} ALTER COLUMN {}",
            self.quote_ident(table),
            self.quote_ident(&new.name)
        );
        let mut statements = Vec::new();

        let serial = old.column_type.is_serial() || new.column_type.is_serial();
        let old_default = old.normalized_default();
        let new_default = new.normalized_default();
        let default_changed = !serial && old_default != new_default;

        // The old default may not survive the type conversion
        if default_changed && old_default.is_some() {
            statements.push(format!("{} DROP DEFAULT", prefix));
        }

        let change = old.column_type.width_change(&new.column_type);
        if change != WidthChange::Same {
            // ALTER ... TYPE only accepts storage types, never serial pseudo-types
            let target = self.render_type(&new.column_type.comparable());
            if change == WidthChange::Incompatible {
                statements.push(format!(
                    "{} TYPE {} USING {}::{}",
                    prefix,
                    target,
                    self.quote_ident(&new.name),
                    target
                ));
            } else {
                statements.push(format!("{} TYPE {}", prefix, target));
            }
        }

        if default_changed {
            if let Some(default) = &new.default {
                statements.push(format!("{} SET DEFAULT {}", prefix, default));
            }
        }

        if old.nullable && !new.nullable {
            statements.push(format!("{} SET NOT NULL", prefix));
        } else if !old.nullable && new.nullable {
            statements.push(format!("{} DROP NOT NULL", prefix));
        }

        Ok(statements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{IndexDefinition, TableSchema};

    #[test]
    fn test_add_and_drop_column() {
        let emitter = PostgresEmitter::new();
        let category = ColumnDefinition::new("category", ColumnType::VarChar(None));
        assert_eq!(
            emitter.add_column("items", &category),
            "ALTER TABLE items ADD COLUMN category VARCHAR"
        );
        assert_eq!(
            emitter.drop_column("items", "category"),
            "ALTER TABLE items DROP COLUMN category"
        );
    }

    #[test]
    fn test_create_table_with_indexes() {
        let emitter = PostgresEmitter::new();
        let table = TableSchema::new("items")
            .column(ColumnDefinition::new("id", ColumnType::Serial).primary_key())
            .column(
                ColumnDefinition::new("status", ColumnType::VarChar(Some(20)))
                    .not_null()
                    .with_default("'draft'"),
            )
            .index(IndexDefinition::new("items_status_idx", vec!["status".into()]));

        assert_eq!(
            emitter.create_table(&table),
            vec![
                "CREATE TABLE items (id SERIAL NOT NULL, status VARCHAR(20) NOT NULL DEFAULT 'draft', PRIMARY KEY (id))"
                    .to_string(),
                "CREATE INDEX items_status_idx ON items (status)".to_string(),
            ]
        );
        assert_eq!(emitter.drop_table("user"), "DROP TABLE \"user\"");
    }

    #[test]
    fn test_alter_column_widen_and_tighten() {
        let emitter = PostgresEmitter::new();
        let old = ColumnDefinition::new("title", ColumnType::VarChar(Some(100)));
        let new = ColumnDefinition::new("title", ColumnType::VarChar(Some(200))).not_null();

        assert_eq!(
            emitter.alter_column("items", &old, &new).unwrap(),
            vec![
                "ALTER TABLE items ALTER COLUMN title TYPE VARCHAR(200)".to_string(),
                "ALTER TABLE items ALTER COLUMN title SET NOT NULL".to_string(),
            ]
        );
        assert_eq!(
            emitter.alter_column("items", &new, &old).unwrap(),
            vec![
                "ALTER TABLE items ALTER COLUMN title TYPE VARCHAR(100)".to_string(),
                "ALTER TABLE items ALTER COLUMN title DROP NOT NULL".to_string(),
            ]
        );
    }

    #[test]
    fn test_alter_column_incompatible_uses_cast() {
        let emitter = PostgresEmitter::new();
        let old = ColumnDefinition::new("qty", ColumnType::Text).with_default("'0'");
        let new = ColumnDefinition::new("qty", ColumnType::Integer).with_default("0");

        assert_eq!(
            emitter.alter_column("items", &old, &new).unwrap(),
            vec![
                "ALTER TABLE items ALTER COLUMN qty DROP DEFAULT".to_string(),
                "ALTER TABLE items ALTER COLUMN qty TYPE INTEGER USING qty::INTEGER".to_string(),
                "ALTER TABLE items ALTER COLUMN qty SET DEFAULT 0".to_string(),
            ]
        );
    }
}
