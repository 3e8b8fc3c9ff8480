//! Migration Rollback - Replays stored backward DDL
//!
//! Reverts applied migrations newest first down to a target version. The run
//! stops at the first migration that has no backward DDL or whose backward DDL
//! fails; everything reverted before that point stays reverted.

use std::sync::Arc;

use super::definitions::MigrationRecord;
use super::store::MigrationStore;
use crate::backends::SchemaConnection;
use crate::error::{EngineError, EngineResult};

pub struct RollbackRunner {
    connection: Arc<dyn SchemaConnection>,
    store: Arc<dyn MigrationStore>,
}

impl RollbackRunner {
    pub fn new(connection: Arc<dyn SchemaConnection>, store: Arc<dyn MigrationStore>) -> Self {
        Self { connection, store }
    }

    /// Records that [`rollback_to`](Self::rollback_to) would revert, newest first.
    ///
    /// `None` selects every applied migration. The target itself stays applied.
    pub async fn pending_reversal(&self, target: Option<&str>) -> EngineResult<Vec<MigrationRecord>> {
        let applied = self.store.list_applied().await?;

        if let Some(target) = target {
            if !applied.iter().any(|record| record.version == target) {
                return Err(EngineError::UnknownVersion(target.to_string()));
            }
        }

        Ok(applied
            .into_iter()
            .rev()
            .take_while(|record| Some(record.version.as_str()) != target)
            .collect())
    }

    /// Revert every migration newer than `target`. Returns the reverted
    /// records, newest first.
    pub async fn rollback_to(&self, target: Option<&str>) -> EngineResult<Vec<MigrationRecord>> {
        let pending = self.pending_reversal(target).await?;
        if pending.is_empty() {
            tracing::info!("Nothing to roll back");
            return Ok(pending);
        }

        let mut reverted = Vec::with_capacity(pending.len());
        for record in pending {
            if !record.is_reversible() {
                tracing::warn!(
                    "Migration {} has no backward DDL, stopping after {} reverted",
                    record.version,
                    reverted.len()
                );
                return Err(EngineError::NoRollbackAvailable {
                    version: record.version,
                    reverted,
                });
            }

            tracing::info!("Rolling back migration {}: {}", record.version, record.description);
            if let Err(e) = self.connection.execute_ddl(&record.backward_ddl).await {
                tracing::error!(
                    "Rolling back migration {} failed, manual intervention required: {}",
                    record.version,
                    e
                );
                return Err(EngineError::RollbackExecution {
                    version: record.version,
                    message: e.to_string(),
                    plan: None,
                });
            }

            match self.store.remove(&record.version).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!(
                    "History record {} disappeared during rollback",
                    record.version
                ),
                Err(e) => {
                    tracing::error!(
                        "Migration {} was reverted but its history record remains: {}",
                        record.version,
                        e
                    );
                    return Err(EngineError::RollbackExecution {
                        version: record.version,
                        message: format!("backward DDL applied but the record was not removed: {}", e),
                        plan: None,
                    });
                }
            }

            reverted.push(record);
        }

        Ok(reverted)
    }
}
