//! Migration Engine - Orchestrates detection, planning and execution
//!
//! One invocation of [`MigrationEngine::migrate`] walks
//! lock acquisition, drift detection, planning, the before-DDL hooks,
//! execution, the after-DDL hooks and lock release. Every path out of the
//! locked section, panics included, releases the lock.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backends::{self, DatabaseBackendType, DatabaseHandle};
use crate::config::EngineConfig;
use crate::diff::SchemaDiffer;
use crate::error::{EngineError, EngineResult};
use crate::hooks::{HookBus, HookContext, HookOperation, HookTrigger};
use crate::lock::{release_with_retry, AcquireOptions, LockAcquisition, LockProvider};
use crate::migrations::{
    Compensation, ExecutionMode, Migration, MigrationExecutor, MigrationPlan, MigrationPlanner,
    MigrationRecord, PlanStatus, RollbackRunner, UnitFailure,
};
use crate::schema::DeclaredSchema;

/// How a `migrate` call ended, when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationOutcome {
    /// The live schema already matches
    NoChanges,
    /// Another instance holds the migration lock
    Locked,
    /// Every planned unit was applied
    Applied,
    /// Destructive units were refused; the rest was applied
    RefusedDestructive,
    /// Planned only
    DryRun,
    /// Stopped between units
    Cancelled,
}

impl fmt::Display for MigrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationOutcome::NoChanges => write!(f, "no changes needed"),
            MigrationOutcome::Locked => write!(f, "locked by another instance"),
            MigrationOutcome::Applied => write!(f, "applied successfully"),
            MigrationOutcome::RefusedDestructive => {
                write!(f, "refused destructive migrations in safe mode")
            }
            MigrationOutcome::DryRun => write!(f, "dry run"),
            MigrationOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub outcome: MigrationOutcome,
    pub plan: MigrationPlan,
    pub applied: Vec<Migration>,
    pub refused: Vec<Migration>,
    /// False only when releasing the lock failed after all retries
    pub lock_released: bool,
    pub duration: Duration,
}

impl MigrationReport {
    fn new(outcome: MigrationOutcome, plan: MigrationPlan) -> Self {
        Self {
            outcome,
            plan,
            applied: Vec::new(),
            refused: Vec::new(),
            lock_released: true,
            duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    Locked,
    /// Reverted records, newest first
    Reverted(Vec<MigrationRecord>),
}

/// Result of running a section under the migration lock
enum Guarded<T> {
    Denied,
    Completed { value: T, lock_released: bool },
}

pub struct MigrationEngine {
    handle: DatabaseHandle,
    lock: Arc<dyn LockProvider>,
    config: EngineConfig,
    hooks: HookBus,
    cancellation: CancellationToken,
}

impl MigrationEngine {
    /// Connect to `url`, probing the backend and lock capabilities once.
    pub async fn connect(url: &str, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let (handle, lock) = backends::connect(url, &config).await?;
        tracing::info!(
            "Migration engine ready on {} using {} locks",
            handle.backend_type,
            lock.name()
        );
        Ok(Self::new(handle, lock, config))
    }

    pub fn new(handle: DatabaseHandle, lock: Arc<dyn LockProvider>, config: EngineConfig) -> Self {
        Self {
            handle,
            lock,
            config,
            hooks: HookBus::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: HookBus) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn hooks_mut(&mut self) -> &mut HookBus {
        &mut self.hooks
    }

    /// Cancelling this token stops a running migration before its next unit.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend_type(&self) -> DatabaseBackendType {
        self.handle.backend_type
    }

    pub fn lock_provider(&self) -> &Arc<dyn LockProvider> {
        &self.lock
    }

    /// Preview the plan for `declared` without taking the lock or issuing DDL.
    ///
    /// While another instance is migrating the preview may already be stale.
    pub async fn plan(&self, declared: &DeclaredSchema) -> EngineResult<MigrationPlan> {
        match self.lock.is_locked(self.config.get_lock_key()).await {
            Ok(true) => tracing::warn!(
                "A migration is in progress on another instance; this plan may be stale"
            ),
            Ok(false) => {}
            Err(e) => tracing::debug!("Could not check the migration lock: {}", e),
        }

        // Without a history table the preview starts from the clock alone
        let last_applied = match self.handle.store.last_applied().await {
            Ok(record) => record.map(|r| r.version),
            Err(e) => {
                tracing::debug!("Migration history unavailable: {}", e);
                None
            }
        };

        self.build_plan(declared, last_applied.as_deref()).await
    }

    /// Bring the live schema in line with `declared`.
    ///
    /// Being locked out by another instance is [`MigrationOutcome::Locked`],
    /// not an error.
    pub async fn migrate(
        &self,
        declared: &DeclaredSchema,
        mode: ExecutionMode,
    ) -> EngineResult<MigrationReport> {
        let started = Instant::now();
        declared.validate()?;

        if mode == ExecutionMode::DryRun {
            let mut plan = self.plan(declared).await?;
            plan.status = PlanStatus::Pending;
            let mut report = MigrationReport::new(MigrationOutcome::DryRun, plan);
            report.duration = started.elapsed();
            return Ok(report);
        }

        let deadline = self.config.get_execution_deadline().map(|limit| started + limit);
        let guarded = self
            .guarded(
                HookOperation::Migrate,
                self.run_migration(declared, mode, deadline),
            )
            .await?;

        let mut report = match guarded {
            Guarded::Denied => MigrationReport::new(MigrationOutcome::Locked, MigrationPlan::default()),
            Guarded::Completed {
                value,
                lock_released,
            } => MigrationReport {
                lock_released,
                ..value
            },
        };
        report.duration = started.elapsed();

        tracing::info!(
            "Migration finished: {} ({} applied, {} refused) in {:?}",
            report.outcome,
            report.applied.len(),
            report.refused.len(),
            report.duration
        );
        Ok(report)
    }

    /// Revert applied migrations newer than `to_version`, or all of them.
    pub async fn rollback(&self, to_version: Option<&str>) -> EngineResult<RollbackOutcome> {
        match self
            .guarded(HookOperation::Rollback, self.run_rollback(to_version))
            .await?
        {
            Guarded::Denied => Ok(RollbackOutcome::Locked),
            Guarded::Completed { value, .. } => {
                tracing::info!("Rolled back {} migration(s)", value.len());
                Ok(RollbackOutcome::Reverted(value))
            }
        }
    }

    /// Applied migrations, oldest first
    pub async fn status(&self) -> EngineResult<Vec<MigrationRecord>> {
        self.handle.store.ensure_schema().await?;
        Ok(self.handle.store.list_applied().await?)
    }

    async fn build_plan(
        &self,
        declared: &DeclaredSchema,
        last_applied: Option<&str>,
    ) -> EngineResult<MigrationPlan> {
        declared.validate()?;
        let mut declared = declared.clone();
        declared.normalize();

        tracing::debug!("Detecting drift");
        let live = self.handle.introspector.introspect().await?;
        let changes = SchemaDiffer::diff(&declared, &live);
        for change in &changes {
            tracing::debug!("Drift: {}", change.describe());
        }

        tracing::debug!("Planning {} change(s)", changes.len());
        let planner = MigrationPlanner::new(self.handle.emitter.clone());
        Ok(planner.plan_after(&changes, last_applied)?)
    }

    async fn run_migration(
        &self,
        declared: &DeclaredSchema,
        mode: ExecutionMode,
        deadline: Option<Instant>,
    ) -> EngineResult<MigrationReport> {
        let store = &self.handle.store;
        store.ensure_schema().await?;
        let last_applied = store.last_applied().await?.map(|r| r.version);

        let plan = self.build_plan(declared, last_applied.as_deref()).await?;
        if plan.is_empty() {
            tracing::info!("Schema is up to date, nothing to migrate");
            return Ok(MigrationReport::new(MigrationOutcome::NoChanges, plan));
        }
        tracing::info!(
            "Planned {} migration(s) with {} statement(s)",
            plan.len(),
            plan.statement_count()
        );

        let before = HookContext::new(HookTrigger::BeforeDdl, HookOperation::Migrate)
            .with_plan(plan.clone());
        self.hooks
            .fire(&before)
            .await
            .map_err(EngineError::HookAborted)?;

        tracing::debug!("Executing plan in {} mode", mode);
        let mut executor = MigrationExecutor::new(self.handle.connection.clone(), store.clone())
            .with_cancellation(self.cancellation.clone());
        if let Some(deadline) = deadline {
            executor = executor.with_deadline(deadline);
        }
        let execution = executor.execute(plan, mode).await;

        if let Some(failure) = execution.failure {
            return Err(failure_error(failure, execution.plan));
        }

        let after = HookContext::new(HookTrigger::AfterDdl, HookOperation::Migrate)
            .with_plan(execution.plan.clone())
            .with_versions(execution.applied.iter().map(|m| m.version.clone()).collect());
        if let Err(e) = self.hooks.fire(&after).await {
            tracing::warn!("{}; applied migrations remain committed", e);
        }

        let outcome = if execution.cancelled {
            MigrationOutcome::Cancelled
        } else if !execution.refused.is_empty() {
            MigrationOutcome::RefusedDestructive
        } else {
            MigrationOutcome::Applied
        };

        Ok(MigrationReport {
            outcome,
            plan: execution.plan,
            applied: execution.applied,
            refused: execution.refused,
            lock_released: true,
            duration: Duration::ZERO,
        })
    }

    async fn run_rollback(&self, to_version: Option<&str>) -> EngineResult<Vec<MigrationRecord>> {
        self.handle.store.ensure_schema().await?;
        let runner = RollbackRunner::new(self.handle.connection.clone(), self.handle.store.clone());

        let pending = runner.pending_reversal(to_version).await?;
        if pending.is_empty() {
            return Ok(pending);
        }

        let before = HookContext::new(HookTrigger::BeforeDdl, HookOperation::Rollback)
            .with_versions(pending.iter().map(|r| r.version.clone()).collect());
        self.hooks
            .fire(&before)
            .await
            .map_err(EngineError::HookAborted)?;

        let reverted = runner.rollback_to(to_version).await?;

        let after = HookContext::new(HookTrigger::AfterDdl, HookOperation::Rollback)
            .with_versions(reverted.iter().map(|r| r.version.clone()).collect());
        if let Err(e) = self.hooks.fire(&after).await {
            tracing::warn!("{}; reverted migrations stay reverted", e);
        }

        Ok(reverted)
    }

    /// Run `section` while holding the migration lock.
    ///
    /// The lock is released after the section returns, fails or panics. A
    /// panic is resumed only after the release.
    async fn guarded<T, Fut>(&self, operation: HookOperation, section: Fut) -> EngineResult<Guarded<T>>
    where
        Fut: Future<Output = EngineResult<T>>,
    {
        let key = self.config.get_lock_key();
        tracing::debug!("Acquiring {} lock '{}'", self.lock.name(), key);

        let state = match self
            .lock
            .acquire(key, &AcquireOptions::from(&self.config))
            .await?
        {
            LockAcquisition::Acquired(state) => state,
            LockAcquisition::Denied => {
                tracing::info!("Lock '{}' is held elsewhere, skipping", key);
                return Ok(Guarded::Denied);
            }
        };

        let result = AssertUnwindSafe(async {
            let result = section.await;
            if let Err(e) = &result {
                let context = HookContext::new(HookTrigger::OnError, operation)
                    .with_plan(failed_plan(e).cloned().unwrap_or_default())
                    .with_error(e.to_string());
                self.fire_on_error(&context).await;
            }
            result
        })
        .catch_unwind()
        .await;

        if let Err(payload) = &result {
            let message = panic_message(payload.as_ref());
            tracing::error!("Panic while holding lock '{}': {}", key, message);
            let context = HookContext::new(HookTrigger::OnError, operation)
                .with_error(format!("panic: {}", message));
            if AssertUnwindSafe(self.fire_on_error(&context))
                .catch_unwind()
                .await
                .is_err()
            {
                tracing::error!("Error hook panicked as well");
            }
        }

        tracing::debug!("Releasing lock '{}'", key);
        let lock_released = release_with_retry(
            self.lock.as_ref(),
            &state,
            *self.config.get_release_attempts(),
            *self.config.get_release_backoff(),
        )
        .await;

        match result {
            Ok(Ok(value)) => Ok(Guarded::Completed {
                value,
                lock_released,
            }),
            Ok(Err(e)) => Err(e),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    async fn fire_on_error(&self, context: &HookContext) {
        if let Err(e) = self.hooks.fire(context).await {
            tracing::warn!("{}", e);
        }
    }
}

/// Map a failed unit to the error severity callers act on
fn failure_error(failure: UnitFailure, plan: MigrationPlan) -> EngineError {
    match failure.compensation {
        Compensation::BackwardFailed(reason) => EngineError::RollbackExecution {
            version: failure.version,
            message: format!("{}; compensation failed: {}", failure.message, reason),
            plan: Some(Box::new(plan)),
        },
        compensation => EngineError::MigrationExecution {
            version: failure.version,
            message: failure.message,
            compensated: compensation.is_compensated(),
            plan: Box::new(plan),
        },
    }
}

fn failed_plan(error: &EngineError) -> Option<&MigrationPlan> {
    match error {
        EngineError::MigrationExecution { plan, .. } => Some(&**plan),
        EngineError::RollbackExecution { plan, .. } => plan.as_deref(),
        _ => None,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
