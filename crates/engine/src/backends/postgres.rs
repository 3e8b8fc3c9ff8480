//! PostgreSQL backend
//!
//! Introspection reads `information_schema` for columns and primary keys and
//! `pg_index` for secondary indexes, limited to one schema and excluding the
//! migration history table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashSet;

use super::{DatabaseBackendType, SchemaConnection};
use crate::config::EngineConfig;
use crate::error::{DdlExecutionError, IntrospectionError, StoreError, StoreResult};
use crate::introspect::{RawColumn, SchemaAssembler, SchemaIntrospector};
use crate::migrations::store::{decode_record, encode_backward_ddl, HistoryTable};
use crate::migrations::{Migration, MigrationRecord, MigrationStore};
use crate::schema::LiveSchema;

const COLUMNS_SQL: &str = r#"
SELECT c.table_name::text AS table_name,
       c.column_name::text AS column_name,
       CASE
           WHEN c.data_type = 'USER-DEFINED' THEN c.udt_name::text
           WHEN c.character_maximum_length IS NOT NULL
               THEN c.data_type::text || '(' || c.character_maximum_length::text || ')'
           WHEN c.data_type = 'numeric' AND c.numeric_precision IS NOT NULL
               THEN 'numeric(' || c.numeric_precision::text || ',' || COALESCE(c.numeric_scale, 0)::text || ')'
           ELSE c.data_type::text
       END AS data_type,
       (c.is_nullable = 'YES') AS nullable,
       c.column_default::text AS column_default
FROM information_schema.columns c
JOIN information_schema.tables t
  ON t.table_schema = c.table_schema AND t.table_name = c.table_name
WHERE c.table_schema = $1
  AND t.table_type = 'BASE TABLE'
  AND c.table_name <> $2
ORDER BY c.table_name, c.ordinal_position
"#;

const PRIMARY_KEYS_SQL: &str = r#"
SELECT kcu.table_name::text AS table_name,
       kcu.column_name::text AS column_name
FROM information_schema.table_constraints tc
JOIN information_schema.key_column_usage kcu
  ON tc.constraint_name = kcu.constraint_name
 AND tc.table_schema = kcu.table_schema
 AND tc.table_name = kcu.table_name
WHERE tc.constraint_type = 'PRIMARY KEY'
  AND tc.table_schema = $1
"#;

const INDEXES_SQL: &str = r#"
SELECT t.relname::text AS table_name,
       i.relname::text AS index_name,
       ix.indisunique AS is_unique,
       a.attname::text AS column_name
FROM pg_index ix
JOIN pg_class t ON t.oid = ix.indrelid
JOIN pg_class i ON i.oid = ix.indexrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) ON true
JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
WHERE n.nspname = $1
  AND t.relkind = 'r'
  AND NOT ix.indisprimary
  AND t.relname <> $2
ORDER BY t.relname, i.relname, k.ord
"#;

#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    schema_name: String,
    history: HistoryTable,
}

impl PostgresBackend {
    pub fn new(pool: PgPool, config: &EngineConfig) -> Self {
        Self {
            pool,
            schema_name: config.get_schema_name().clone(),
            history: HistoryTable::new(
                config.get_history_table().clone(),
                DatabaseBackendType::PostgreSQL,
            ),
        }
    }

    pub async fn connect(url: &str, config: &EngineConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(*config.get_max_connections())
            .connect(url)
            .await?;
        Ok(Self::new(pool, config))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Capability probe for session advisory locks
    pub async fn supports_advisory_locks(&self) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_proc WHERE proname = 'pg_try_advisory_lock')",
        )
        .fetch_one(&self.pool)
        .await
    }
}

#[async_trait]
impl SchemaIntrospector for PostgresBackend {
    async fn introspect(&self) -> Result<LiveSchema, IntrospectionError> {
        let primary_keys: HashSet<(String, String)> = sqlx::query(PRIMARY_KEYS_SQL)
            .bind(&self.schema_name)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| -> Result<(String, String), sqlx::Error> {
                Ok((row.try_get("table_name")?, row.try_get("column_name")?))
            })
            .collect::<Result<_, sqlx::Error>>()?;

        let column_rows = sqlx::query(COLUMNS_SQL)
            .bind(&self.schema_name)
            .bind(self.history.name())
            .fetch_all(&self.pool)
            .await?;

        let mut assembler = SchemaAssembler::default();
        for row in &column_rows {
            let table: String = row.try_get("table_name")?;
            let name: String = row.try_get("column_name")?;
            let primary_key = primary_keys.contains(&(table.clone(), name.clone()));
            assembler.push_column(RawColumn {
                table,
                name,
                data_type: row.try_get("data_type")?,
                nullable: row.try_get("nullable")?,
                default: row.try_get("column_default")?,
                primary_key,
            })?;
        }

        let index_rows = sqlx::query(INDEXES_SQL)
            .bind(&self.schema_name)
            .bind(self.history.name())
            .fetch_all(&self.pool)
            .await?;

        for row in &index_rows {
            let table: String = row.try_get("table_name")?;
            let index: String = row.try_get("index_name")?;
            let unique: bool = row.try_get("is_unique")?;
            let column: String = row.try_get("column_name")?;
            assembler.push_index_column(&table, &index, unique, &column);
        }

        let schema = assembler.finish();
        tracing::debug!(
            "Introspected {} table(s) in schema '{}'",
            schema.tables.len(),
            self.schema_name
        );
        Ok(schema)
    }
}

#[async_trait]
impl SchemaConnection for PostgresBackend {
    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    async fn execute_ddl(&self, statements: &[String]) -> Result<(), DdlExecutionError> {
        let mut transaction = self.pool.begin().await.map_err(|e| DdlExecutionError {
            index: 0,
            statement: "BEGIN".to_string(),
            message: e.to_string(),
        })?;

        for (index, statement) in statements.iter().enumerate() {
            tracing::debug!("Executing: {}", statement);
            if let Err(e) = sqlx::query(statement).execute(&mut *transaction).await {
                if let Err(rollback_err) = transaction.rollback().await {
                    tracing::warn!("Explicit rollback failed: {}", rollback_err);
                }
                return Err(DdlExecutionError {
                    index,
                    statement: statement.clone(),
                    message: e.to_string(),
                });
            }
        }

        transaction.commit().await.map_err(|e| DdlExecutionError {
            index: statements.len(),
            statement: "COMMIT".to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl MigrationStore for PostgresBackend {
    async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(&self.history.create_sql())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record(
        &self,
        migration: &Migration,
        applied_at: DateTime<Utc>,
    ) -> StoreResult<MigrationRecord> {
        sqlx::query(&self.history.insert_sql())
            .bind(&migration.version)
            .bind(&migration.description)
            .bind(encode_backward_ddl(&migration.backward_ddl)?)
            .bind(migration.risk_level.to_string())
            .bind(applied_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                    StoreError::DuplicateVersion(migration.version.clone())
                } else {
                    StoreError::from(e)
                }
            })?;

        Ok(MigrationRecord::from_migration(migration, applied_at))
    }

    async fn list_applied(&self) -> StoreResult<Vec<MigrationRecord>> {
        let rows = sqlx::query(&self.history.select_sql())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let backward_ddl: String = row.try_get("backward_ddl")?;
                let risk_level: String = row.try_get("risk_level")?;
                decode_record(
                    row.try_get("version")?,
                    row.try_get("description")?,
                    &backward_ddl,
                    &risk_level,
                    row.try_get("applied_at")?,
                )
            })
            .collect()
    }

    async fn remove(&self, version: &str) -> StoreResult<bool> {
        let result = sqlx::query(&self.history.delete_sql())
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
