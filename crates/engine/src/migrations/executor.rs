//! Migration Executor - Runs a plan one unit at a time
//!
//! Every unit runs in its own DDL transaction and is recorded in the store as
//! soon as it commits. The first failing unit halts the plan; what happened to
//! the schema afterwards is reported as a [`Compensation`].

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::definitions::{ExecutionMode, Migration, MigrationPlan, PlanStatus};
use super::store::MigrationStore;
use crate::backends::SchemaConnection;

/// What was done about a failed unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Compensation {
    /// The unit's transaction was rolled back; nothing of it remains
    TransactionRolledBack,
    /// The unit's backward DDL was replayed successfully
    BackwardApplied,
    /// Replaying backward DDL failed; the schema is in an intermediate state
    BackwardFailed(String),
    /// No transaction protected the unit and it has no backward DDL
    Unavailable,
}

impl Compensation {
    /// Whether the schema is back where it was before the unit
    pub fn is_compensated(&self) -> bool {
        matches!(
            self,
            Compensation::TransactionRolledBack | Compensation::BackwardApplied
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub version: String,
    pub message: String,
    pub compensation: Compensation,
}

/// Result of running a plan
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub plan: MigrationPlan,
    /// Units that committed and were recorded, in order
    pub applied: Vec<Migration>,
    /// Units the execution mode did not allow
    pub refused: Vec<Migration>,
    pub failure: Option<UnitFailure>,
    /// Stopped between units by cancellation or deadline
    pub cancelled: bool,
}

pub struct MigrationExecutor {
    connection: Arc<dyn SchemaConnection>,
    store: Arc<dyn MigrationStore>,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl MigrationExecutor {
    pub fn new(connection: Arc<dyn SchemaConnection>, store: Arc<dyn MigrationStore>) -> Self {
        Self {
            connection,
            store,
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn should_stop(&self) -> bool {
        self.cancellation.is_cancelled()
            || self
                .deadline
                .map_or(false, |deadline| Instant::now() >= deadline)
    }

    /// Run `plan` under `mode`, sequentially. Never runs two units at once and
    /// never interrupts a unit once started.
    pub async fn execute(&self, mut plan: MigrationPlan, mode: ExecutionMode) -> ExecutionReport {
        if plan.is_empty() {
            plan.status = PlanStatus::NoChanges;
            return ExecutionReport {
                plan,
                ..Default::default()
            };
        }

        if mode == ExecutionMode::DryRun {
            plan.status = PlanStatus::Pending;
            return ExecutionReport {
                plan,
                ..Default::default()
            };
        }

        let mut applied = Vec::new();
        let mut refused = Vec::new();
        let mut failure = None;
        let mut cancelled = false;

        for migration in &plan.migrations {
            if self.should_stop() {
                tracing::warn!(
                    "Execution cancelled before migration {}, {} unit(s) applied",
                    migration.version,
                    applied.len()
                );
                cancelled = true;
                break;
            }

            if !mode.allows(migration.risk_level) {
                tracing::warn!(
                    "Skipping {} migration {} in {} mode: {}",
                    migration.risk_level,
                    migration.version,
                    mode,
                    migration.description
                );
                refused.push(migration.clone());
                continue;
            }

            tracing::info!(
                "Applying migration {} ({}): {}",
                migration.version,
                migration.risk_level,
                migration.description
            );

            if let Err(unit_failure) = self.apply_unit(migration).await {
                failure = Some(unit_failure);
                break;
            }
            applied.push(migration.clone());
        }

        plan.status = final_status(&applied, &refused, failure.is_some(), cancelled);

        ExecutionReport {
            plan,
            applied,
            refused,
            failure,
            cancelled,
        }
    }

    async fn apply_unit(&self, migration: &Migration) -> Result<(), UnitFailure> {
        if let Err(e) = self.connection.execute_ddl(&migration.forward_ddl).await {
            let compensation = if self.connection.supports_transactional_ddl() {
                Compensation::TransactionRolledBack
            } else {
                self.compensate(migration).await
            };
            return Err(self.report_failure(migration, e.to_string(), compensation));
        }

        // Committed; an unrecorded unit must not stay behind
        if let Err(e) = self.store.record(migration, Utc::now()).await {
            let compensation = self.compensate(migration).await;
            return Err(self.report_failure(
                migration,
                format!("applied but could not be recorded: {}", e),
                compensation,
            ));
        }

        Ok(())
    }

    async fn compensate(&self, migration: &Migration) -> Compensation {
        if !migration.is_reversible() {
            return Compensation::Unavailable;
        }

        tracing::info!("Replaying backward DDL of migration {}", migration.version);
        match self.connection.execute_ddl(&migration.backward_ddl).await {
            Ok(()) => Compensation::BackwardApplied,
            Err(e) => Compensation::BackwardFailed(e.to_string()),
        }
    }

    fn report_failure(
        &self,
        migration: &Migration,
        message: String,
        compensation: Compensation,
    ) -> UnitFailure {
        match &compensation {
            Compensation::BackwardFailed(reason) => tracing::error!(
                "Migration {} failed and its compensation failed too, manual repair required: {} (compensation: {})",
                migration.version,
                message,
                reason
            ),
            Compensation::Unavailable => tracing::error!(
                "Migration {} failed with no way to compensate: {}",
                migration.version,
                message
            ),
            _ => tracing::warn!(
                "Migration {} failed, schema restored: {}",
                migration.version,
                message
            ),
        }

        UnitFailure {
            version: migration.version.clone(),
            message,
            compensation,
        }
    }
}

fn final_status(
    applied: &[Migration],
    refused: &[Migration],
    failed: bool,
    cancelled: bool,
) -> PlanStatus {
    if failed {
        PlanStatus::Failed
    } else if applied.is_empty() {
        PlanStatus::Pending
    } else if cancelled || !refused.is_empty() {
        PlanStatus::PartiallyApplied
    } else {
        PlanStatus::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DdlExecutionError;
    use crate::migrations::definitions::RiskLevel;
    use crate::migrations::store::MemoryMigrationStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records batches; fails any batch containing `fail_on`
    #[derive(Default)]
    struct ScriptedConnection {
        transactional: bool,
        fail_on: Vec<String>,
        executed: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl SchemaConnection for ScriptedConnection {
        fn supports_transactional_ddl(&self) -> bool {
            self.transactional
        }

        async fn execute_ddl(&self, statements: &[String]) -> Result<(), DdlExecutionError> {
            if let Some((index, statement)) = statements
                .iter()
                .enumerate()
                .find(|(_, s)| self.fail_on.contains(s))
            {
                return Err(DdlExecutionError {
                    index,
                    statement: statement.clone(),
                    message: "syntax error".to_string(),
                });
            }
            self.executed.lock().push(statements.to_vec());
            Ok(())
        }
    }

    fn unit(version: &str, risk: RiskLevel, forward: &str, backward: &str) -> Migration {
        Migration {
            version: version.to_string(),
            description: format!("unit {}", version),
            forward_ddl: vec![forward.to_string()],
            backward_ddl: if backward.is_empty() {
                Vec::new()
            } else {
                vec![backward.to_string()]
            },
            risk_level: risk,
        }
    }

    fn mixed_plan() -> MigrationPlan {
        MigrationPlan::new(vec![
            unit("0001", RiskLevel::Safe, "ADD a", "DROP a"),
            unit("0002", RiskLevel::Destructive, "DROP b", ""),
            unit("0003", RiskLevel::Warning, "WIDEN c", "NARROW c"),
        ])
    }

    fn executor_with(connection: Arc<ScriptedConnection>) -> (MigrationExecutor, MemoryMigrationStore) {
        let store = MemoryMigrationStore::new();
        (
            MigrationExecutor::new(connection, Arc::new(store.clone())),
            store,
        )
    }

    #[tokio::test]
    async fn test_safe_mode_refuses_destructive_and_continues() {
        let connection = Arc::new(ScriptedConnection {
            transactional: true,
            ..Default::default()
        });
        let (executor, store) = executor_with(connection.clone());

        let report = executor.execute(mixed_plan(), ExecutionMode::Safe).await;
        assert_eq!(report.plan.status, PlanStatus::PartiallyApplied);
        assert_eq!(
            report.applied.iter().map(|m| m.version.as_str()).collect::<Vec<_>>(),
            vec!["0001", "0003"]
        );
        assert_eq!(report.refused.len(), 1);
        assert_eq!(report.refused[0].version, "0002");
        assert!(report.failure.is_none());

        let recorded = store.list_applied().await.unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(connection.executed.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_force_mode_applies_everything() {
        let connection = Arc::new(ScriptedConnection {
            transactional: true,
            ..Default::default()
        });
        let (executor, store) = executor_with(connection);

        let report = executor.execute(mixed_plan(), ExecutionMode::Force).await;
        assert_eq!(report.plan.status, PlanStatus::Applied);
        assert_eq!(report.applied.len(), 3);
        assert_eq!(store.list_applied().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_dry_run_issues_no_ddl() {
        let connection = Arc::new(ScriptedConnection::default());
        let (executor, store) = executor_with(connection.clone());

        let report = executor.execute(mixed_plan(), ExecutionMode::DryRun).await;
        assert_eq!(report.plan.status, PlanStatus::Pending);
        assert!(report.applied.is_empty());
        assert!(connection.executed.lock().is_empty());
        assert!(store.list_applied().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_halts_plan_with_transaction_rollback() {
        let connection = Arc::new(ScriptedConnection {
            transactional: true,
            fail_on: vec!["DROP b".to_string()],
            ..Default::default()
        });
        let (executor, store) = executor_with(connection.clone());

        let report = executor.execute(mixed_plan(), ExecutionMode::Force).await;
        assert_eq!(report.plan.status, PlanStatus::Failed);
        assert_eq!(report.applied.len(), 1);

        let failure = report.failure.unwrap();
        assert_eq!(failure.version, "0002");
        assert_eq!(failure.compensation, Compensation::TransactionRolledBack);
        assert!(failure.compensation.is_compensated());

        // 0003 never started
        assert_eq!(connection.executed.lock().len(), 1);
        assert_eq!(store.list_applied().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_transactional_failure_replays_backward_ddl() {
        let connection = Arc::new(ScriptedConnection {
            transactional: false,
            fail_on: vec!["WIDEN c".to_string()],
            ..Default::default()
        });
        let (executor, _) = executor_with(connection.clone());

        let plan = MigrationPlan::new(vec![unit("0003", RiskLevel::Warning, "WIDEN c", "NARROW c")]);
        let report = executor.execute(plan, ExecutionMode::Safe).await;
        assert_eq!(
            report.failure.unwrap().compensation,
            Compensation::BackwardApplied
        );
        assert_eq!(
            connection.executed.lock().clone(),
            vec![vec!["NARROW c".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_failed_compensation_is_reported_separately() {
        let connection = Arc::new(ScriptedConnection {
            transactional: false,
            fail_on: vec!["WIDEN c".to_string(), "NARROW c".to_string()],
            ..Default::default()
        });
        let (executor, _) = executor_with(connection);

        let plan = MigrationPlan::new(vec![unit("0003", RiskLevel::Warning, "WIDEN c", "NARROW c")]);
        let failure = executor
            .execute(plan, ExecutionMode::Safe)
            .await
            .failure
            .unwrap();
        assert!(matches!(failure.compensation, Compensation::BackwardFailed(_)));
        assert!(!failure.compensation.is_compensated());

        let connection = Arc::new(ScriptedConnection {
            transactional: false,
            fail_on: vec!["DROP b".to_string()],
            ..Default::default()
        });
        let (executor, _) = executor_with(connection);
        let plan = MigrationPlan::new(vec![unit("0002", RiskLevel::Destructive, "DROP b", "")]);
        let failure = executor
            .execute(plan, ExecutionMode::Force)
            .await
            .failure
            .unwrap();
        assert_eq!(failure.compensation, Compensation::Unavailable);
    }

    #[tokio::test]
    async fn test_unrecordable_unit_is_reverted() {
        let connection = Arc::new(ScriptedConnection {
            transactional: true,
            ..Default::default()
        });
        let (executor, store) = executor_with(connection.clone());
        let first = unit("0001", RiskLevel::Safe, "ADD a", "DROP a");
        store.record(&first, Utc::now()).await.unwrap();

        let report = executor
            .execute(MigrationPlan::new(vec![first]), ExecutionMode::Safe)
            .await;
        let failure = report.failure.unwrap();
        assert!(failure.message.contains("could not be recorded"));
        assert_eq!(failure.compensation, Compensation::BackwardApplied);
        assert_eq!(
            connection.executed.lock().clone(),
            vec![vec!["ADD a".to_string()], vec!["DROP a".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_unit() {
        let connection = Arc::new(ScriptedConnection {
            transactional: true,
            ..Default::default()
        });
        let token = CancellationToken::new();
        token.cancel();
        let (executor, _) = executor_with(connection.clone());
        let executor = executor.with_cancellation(token);

        let report = executor.execute(mixed_plan(), ExecutionMode::Force).await;
        assert!(report.cancelled);
        assert_eq!(report.plan.status, PlanStatus::Pending);
        assert!(connection.executed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_elapsed_deadline_stops_execution() {
        let connection = Arc::new(ScriptedConnection {
            transactional: true,
            ..Default::default()
        });
        let (executor, _) = executor_with(connection);
        let executor = executor.with_deadline(Instant::now());

        let report = executor.execute(mixed_plan(), ExecutionMode::Safe).await;
        assert!(report.cancelled);
        assert!(report.applied.is_empty());
    }
}
