//! DDL emitters
//!
//! One [`DdlEmitter`] per database family turns schema objects into statements.
//! The emitter is chosen once when the engine connects; nothing downstream
//! branches on the database vendor again.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresEmitter;
pub use sqlite::SqliteEmitter;

use crate::backends::DatabaseBackendType;
use crate::error::DdlError;
use crate::schema::{ColumnDefinition, ColumnType, IndexDefinition, TableSchema};

const RESERVED_WORDS: &[&str] = &[
    "add", "all", "alter", "and", "as", "asc", "by", "case", "check", "column", "constraint",
    "create", "default", "delete", "desc", "distinct", "drop", "else", "end", "foreign", "from",
    "grant", "group", "having", "in", "index", "insert", "into", "is", "join", "key", "like",
    "limit", "not", "null", "offset", "on", "or", "order", "primary", "references", "select",
    "set", "table", "then", "to", "union", "unique", "update", "user", "values", "when", "where",
];

/// Quote an identifier unless it is a plain lowercase, non-reserved name.
pub fn quote_identifier(ident: &str) -> String {
    let plain = ident
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if plain && !RESERVED_WORDS.contains(&ident) {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// Renders schema objects as DDL statements for one dialect
pub trait DdlEmitter: Send + Sync {
    fn dialect(&self) -> DatabaseBackendType;

    fn render_type(&self, column_type: &ColumnType) -> String;

    /// Alter an existing column from `old` to `new`.
    fn alter_column(
        &self,
        table: &str,
        old: &ColumnDefinition,
        new: &ColumnDefinition,
    ) -> Result<Vec<String>, DdlError>;

    fn quote_ident(&self, ident: &str) -> String {
        quote_identifier(ident)
    }

    fn column_definition(&self, column: &ColumnDefinition) -> String {
        let mut sql = format!(
            "{} {}",
            self.quote_ident(&column.name),
            self.render_type(&column.column_type)
        );
        if !column.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            if !column.column_type.is_serial() {
                sql.push_str(" DEFAULT ");
                sql.push_str(default);
            }
        }
        sql
    }

    /// `CREATE TABLE` followed by one `CREATE INDEX` per declared index.
    fn create_table(&self, table: &TableSchema) -> Vec<String> {
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|column| self.column_definition(column))
            .collect();

        let primary_key = table.primary_key_columns();
        if !primary_key.is_empty() {
            let columns: Vec<String> = primary_key.iter().map(|c| self.quote_ident(c)).collect();
            parts.push(format!("PRIMARY KEY ({})", columns.join(", ")));
        }

        let mut statements = vec![format!(
            "CREATE TABLE {} ({})",
            self.quote_ident(&table.name),
            parts.join(", ")
        )];
        statements.extend(
            table
                .indexes
                .iter()
                .map(|index| self.create_index(&table.name, index)),
        );
        statements
    }

    fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE {}", self.quote_ident(table))
    }

    fn add_column(&self, table: &str, column: &ColumnDefinition) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote_ident(table),
            self.column_definition(column)
        )
    }

    fn drop_column(&self, table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.quote_ident(table),
            self.quote_ident(column)
        )
    }

    fn create_index(&self, table: &str, index: &IndexDefinition) -> String {
        let columns: Vec<String> = index.columns.iter().map(|c| self.quote_ident(c)).collect();
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote_ident(&index.name),
            self.quote_ident(table),
            columns.join(", ")
        )
    }

    fn drop_index(&self, _table: &str, index: &str) -> String {
        format!("DROP INDEX {}", self.quote_ident(index))
    }
}
