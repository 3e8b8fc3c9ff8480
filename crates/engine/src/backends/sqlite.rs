//! SQLite backend
//!
//! Introspection goes through the `pragma_table_info`, `pragma_index_list` and
//! `pragma_index_info` table-valued functions. The pool is capped at one
//! long-lived connection so that `sqlite::memory:` databases survive between
//! statements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::{DatabaseBackendType, SchemaConnection};
use crate::config::EngineConfig;
use crate::error::{DdlExecutionError, IntrospectionError, StoreError, StoreResult};
use crate::introspect::{RawColumn, SchemaAssembler, SchemaIntrospector};
use crate::migrations::store::{decode_record, encode_backward_ddl, HistoryTable};
use crate::migrations::{Migration, MigrationRecord, MigrationStore};
use crate::schema::LiveSchema;

const TABLES_SQL: &str = "SELECT name FROM sqlite_master \
     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> ? \
     ORDER BY name";

const COLUMNS_SQL: &str =
    "SELECT name, type, \"notnull\" AS not_null, dflt_value, pk FROM pragma_table_info(?) ORDER BY cid";

const INDEX_LIST_SQL: &str =
    "SELECT name, \"unique\" AS is_unique, origin FROM pragma_index_list(?) ORDER BY name";

const INDEX_COLUMNS_SQL: &str = "SELECT name FROM pragma_index_info(?) ORDER BY seqno";

#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    history: HistoryTable,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool, config: &EngineConfig) -> Self {
        Self {
            pool,
            history: HistoryTable::new(config.get_history_table().clone(), DatabaseBackendType::SQLite),
        }
    }

    pub async fn connect(url: &str, config: &EngineConfig) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool, config))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SchemaIntrospector for SqliteBackend {
    async fn introspect(&self) -> Result<LiveSchema, IntrospectionError> {
        let tables: Vec<String> = sqlx::query_scalar(TABLES_SQL)
            .bind(self.history.name())
            .fetch_all(&self.pool)
            .await?;

        let mut assembler = SchemaAssembler::default();
        for table in &tables {
            // Tables without columns do not exist in SQLite
            assembler.table_mut(table);

            let columns = sqlx::query(COLUMNS_SQL)
                .bind(table)
                .fetch_all(&self.pool)
                .await?;
            for row in &columns {
                let declared_type: String = row.try_get("type")?;
                let not_null: i64 = row.try_get("not_null")?;
                let pk: i64 = row.try_get("pk")?;
                assembler.push_column(RawColumn {
                    table: table.clone(),
                    name: row.try_get("name")?,
                    // Columns declared without a type
                    data_type: if declared_type.trim().is_empty() {
                        "any".to_string()
                    } else {
                        declared_type
                    },
                    nullable: not_null == 0,
                    default: row.try_get("dflt_value")?,
                    primary_key: pk > 0,
                })?;
            }

            let indexes = sqlx::query(INDEX_LIST_SQL)
                .bind(table)
                .fetch_all(&self.pool)
                .await?;
            for row in &indexes {
                let origin: String = row.try_get("origin")?;
                // Only explicit CREATE INDEX; skip UNIQUE and PRIMARY KEY constraints
                if origin != "c" {
                    continue;
                }
                let index: String = row.try_get("name")?;
                let unique: i64 = row.try_get("is_unique")?;

                let index_columns: Vec<Option<String>> = sqlx::query_scalar(INDEX_COLUMNS_SQL)
                    .bind(&index)
                    .fetch_all(&self.pool)
                    .await?;
                // Expression index entries have no column name
                for column in index_columns.into_iter().flatten() {
                    assembler.push_index_column(table, &index, unique != 0, &column);
                }
            }
        }

        let schema = assembler.finish();
        tracing::debug!("Introspected {} SQLite table(s)", schema.tables.len());
        Ok(schema)
    }
}

#[async_trait]
impl SchemaConnection for SqliteBackend {
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
impl MigrationStore for SqliteBackend {
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
            .bind(applied_at.to_rfc3339())
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
                let version: String = row.try_get("version")?;
                let backward_ddl: String = row.try_get("backward_ddl")?;
                let risk_level: String = row.try_get("risk_level")?;
                let applied_at: String = row.try_get("applied_at")?;
                let applied_at = DateTime::parse_from_rfc3339(&applied_at)
                    .map_err(|e| StoreError::Corrupt {
                        version: version.clone(),
                        message: format!("applied_at is not RFC 3339: {}", e),
                    })?
                    .with_timezone(&Utc);
                decode_record(
                    version,
                    row.try_get("description")?,
                    &backward_ddl,
                    &risk_level,
                    applied_at,
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
