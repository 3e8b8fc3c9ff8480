//! Migration Store - Durable history of applied migrations
//!
//! The history table lives in the managed database itself. It is created
//! idempotently before first use and holds one row per applied unit, keyed
//! by version.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::definitions::{Migration, MigrationRecord, RiskLevel};
use crate::backends::DatabaseBackendType;
use crate::ddl::quote_identifier;
use crate::error::{StoreError, StoreResult};

/// Applied migration history
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Create the history table if it does not exist.
    async fn ensure_schema(&self) -> StoreResult<()>;

    /// Record an applied migration. Recording an existing version fails with
    /// [`StoreError::DuplicateVersion`].
    async fn record(
        &self,
        migration: &Migration,
        applied_at: DateTime<Utc>,
    ) -> StoreResult<MigrationRecord>;

    /// All applied migrations, oldest version first.
    async fn list_applied(&self) -> StoreResult<Vec<MigrationRecord>>;

    /// Delete a record; returns whether it existed.
    async fn remove(&self, version: &str) -> StoreResult<bool>;

    async fn last_applied(&self) -> StoreResult<Option<MigrationRecord>> {
        Ok(self.list_applied().await?.pop())
    }
}

/// SQL for the history table in one dialect
#[derive(Debug, Clone)]
pub struct HistoryTable {
    name: String,
    dialect: DatabaseBackendType,
}

impl HistoryTable {
    pub fn new(name: impl Into<String>, dialect: DatabaseBackendType) -> Self {
        Self {
            name: name.into(),
            dialect,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_sql(&self) -> String {
        let applied_at = match self.dialect {
            DatabaseBackendType::PostgreSQL => "TIMESTAMPTZ NOT NULL",
            DatabaseBackendType::SQLite => "TEXT NOT NULL",
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             version VARCHAR(32) PRIMARY KEY, \
             description TEXT NOT NULL, \
             backward_ddl TEXT NOT NULL, \
             risk_level VARCHAR(16) NOT NULL, \
             applied_at {})",
            quote_identifier(&self.name),
            applied_at
        )
    }

    pub fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (version, description, backward_ddl, risk_level, applied_at) VALUES ({})",
            quote_identifier(&self.name),
            self.placeholders(5)
        )
    }

    pub fn select_sql(&self) -> String {
        format!(
            "SELECT version, description, backward_ddl, risk_level, applied_at FROM {} ORDER BY version ASC",
            quote_identifier(&self.name)
        )
    }

    pub fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM {} WHERE version = {}",
            quote_identifier(&self.name),
            self.placeholders(1)
        )
    }

    fn placeholders(&self, count: usize) -> String {
        (1..=count)
            .map(|i| match self.dialect {
                DatabaseBackendType::PostgreSQL => format!("${}", i),
                DatabaseBackendType::SQLite => "?".to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Encode backward DDL for the `backward_ddl` column
pub(crate) fn encode_backward_ddl(statements: &[String]) -> StoreResult<String> {
    Ok(serde_json::to_string(statements)?)
}

/// Rebuild a record from its stored columns
pub(crate) fn decode_record(
    version: String,
    description: String,
    backward_ddl: &str,
    risk_level: &str,
    applied_at: DateTime<Utc>,
) -> StoreResult<MigrationRecord> {
    let backward_ddl: Vec<String> =
        serde_json::from_str(backward_ddl).map_err(|e| StoreError::Corrupt {
            version: version.clone(),
            message: format!("backward_ddl is not a JSON list: {}", e),
        })?;
    let risk_level: RiskLevel = risk_level.parse().map_err(|e| StoreError::Corrupt {
        version: version.clone(),
        message: e,
    })?;

    Ok(MigrationRecord {
        version,
        description,
        backward_ddl,
        risk_level,
        applied_at,
    })
}

/// In-process store for tests and embedding without a history table
#[derive(Debug, Clone, Default)]
pub struct MemoryMigrationStore {
    records: Arc<RwLock<BTreeMap<String, MigrationRecord>>>,
}

impl MemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MigrationStore for MemoryMigrationStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn record(
        &self,
        migration: &Migration,
        applied_at: DateTime<Utc>,
    ) -> StoreResult<MigrationRecord> {
        let mut records = self.records.write();
        if records.contains_key(&migration.version) {
            return Err(StoreError::DuplicateVersion(migration.version.clone()));
        }
        let record = MigrationRecord::from_migration(migration, applied_at);
        records.insert(record.version.clone(), record.clone());
        Ok(record)
    }

    async fn list_applied(&self) -> StoreResult<Vec<MigrationRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn remove(&self, version: &str) -> StoreResult<bool> {
        Ok(self.records.write().remove(version).is_some())
    }
}
