//! End-to-end tests against an in-memory SQLite database
//!
//! Real introspection, DDL execution, history and file locks; no fakes.

use std::sync::Arc;
use tempfile::TempDir;

use crate::backends::{DatabaseHandle, SqliteBackend};
use crate::config::{EngineConfig, EngineConfigBuilder};
use crate::engine::{MigrationEngine, MigrationOutcome, RollbackOutcome};
use crate::error::{EngineError, StoreError};
use crate::introspect::SchemaIntrospector;
use crate::lock::{FileLockProvider, LockProvider};
use crate::migrations::{ExecutionMode, Migration, MigrationStore, PlanStatus, RiskLevel};
use crate::schema::{ColumnDefinition, ColumnType, IndexDefinition, Schema, TableSchema};

struct Sqlite {
    engine: MigrationEngine,
    backend: SqliteBackend,
    lock: Arc<FileLockProvider>,
    _dir: TempDir,
}

async fn sqlite() -> Sqlite {
    let dir = TempDir::new().unwrap();
    let config: EngineConfig = EngineConfigBuilder::testing()
        .lock_dir(dir.path().join("locks"))
        .build()
        .expect("testing preset is valid");

    let backend = SqliteBackend::connect("sqlite::memory:", &config)
        .await
        .unwrap();
    let lock = Arc::new(
        FileLockProvider::new(config.get_lock_dir(), *config.get_stale_lock_after()).unwrap(),
    );
    let engine = MigrationEngine::new(DatabaseHandle::sqlite(backend.clone()), lock.clone(), config);

    Sqlite {
        engine,
        backend,
        lock,
        _dir: dir,
    }
}

fn base_columns() -> Vec<ColumnDefinition> {
    vec![
        ColumnDefinition::new("id", ColumnType::Integer).primary_key(),
        ColumnDefinition::new("title", ColumnType::Text).not_null(),
        ColumnDefinition::new("label", ColumnType::Text)
            .not_null()
            .with_default("'new'"),
    ]
}

fn items(extra: Vec<ColumnDefinition>) -> Schema {
    let mut table = TableSchema::new("items")
        .index(IndexDefinition::new("items_title_idx", vec!["title".to_string()]).unique());
    for column in base_columns().into_iter().chain(extra) {
        table = table.column(column);
    }
    Schema::new(vec![table])
}

#[tokio::test]
async fn test_migrate_is_idempotent() {
    let db = sqlite().await;

    let first = db
        .engine
        .migrate(&items(vec![]), ExecutionMode::Safe)
        .await
        .unwrap();
    assert_eq!(first.outcome, MigrationOutcome::Applied);
    assert_eq!(first.applied.len(), 1);
    assert_eq!(first.applied[0].risk_level, RiskLevel::Safe);

    let live = db.backend.introspect().await.unwrap();
    let table = live.table("items").expect("items was created");
    assert_eq!(table.primary_key_columns(), vec!["id"]);
    assert_eq!(
        table.find_column("label").and_then(|c| c.normalized_default()),
        Some("'new'".to_string())
    );
    let index = table.find_index("items_title_idx").expect("index introspected");
    assert!(index.unique);
    assert_eq!(index.columns, vec!["title".to_string()]);

    let second = db
        .engine
        .migrate(&items(vec![]), ExecutionMode::Safe)
        .await
        .unwrap();
    assert_eq!(second.outcome, MigrationOutcome::NoChanges);
    assert_eq!(second.plan.status, PlanStatus::NoChanges);
    assert!(second.plan.is_empty());

    assert_eq!(db.engine.status().await.unwrap().len(), 1);
    assert!(!db.lock.is_locked("drift_schema_migrations").await.unwrap());
}

#[tokio::test]
async fn test_rollback_restores_introspected_schema() {
    let db = sqlite().await;
    db.engine
        .migrate(&items(vec![]), ExecutionMode::Safe)
        .await
        .unwrap();
    let base_version = db.engine.status().await.unwrap()[0].version.clone();
    let before = db.backend.introspect().await.unwrap();

    let extended = items(vec![ColumnDefinition::new("category", ColumnType::VarChar(None))]);
    let report = db
        .engine
        .migrate(&extended, ExecutionMode::Safe)
        .await
        .unwrap();
    assert_eq!(report.outcome, MigrationOutcome::Applied);
    assert_ne!(db.backend.introspect().await.unwrap(), before);

    match db.engine.rollback(Some(&base_version)).await.unwrap() {
        RollbackOutcome::Reverted(records) => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].version, report.applied[0].version);
        }
        RollbackOutcome::Locked => panic!("nobody else holds the lock"),
    }

    assert_eq!(db.backend.introspect().await.unwrap(), before);
    let history = db.engine.status().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, base_version);
}

#[tokio::test]
async fn test_destructive_drop_waits_for_force() {
    let db = sqlite().await;
    let with_legacy = items(vec![ColumnDefinition::new("legacy", ColumnType::Text)]);
    db.engine
        .migrate(&with_legacy, ExecutionMode::Safe)
        .await
        .unwrap();

    let report = db
        .engine
        .migrate(&items(vec![]), ExecutionMode::Safe)
        .await
        .unwrap();
    assert_eq!(report.outcome, MigrationOutcome::RefusedDestructive);
    assert_eq!(report.refused.len(), 1);
    assert!(report.refused[0].backward_ddl.is_empty());
    assert!(db.backend.introspect().await.unwrap().table("items").unwrap().find_column("legacy").is_some());

    let report = db
        .engine
        .migrate(&items(vec![]), ExecutionMode::Force)
        .await
        .unwrap();
    assert_eq!(report.outcome, MigrationOutcome::Applied);
    assert!(db.backend.introspect().await.unwrap().table("items").unwrap().find_column("legacy").is_none());

    // The drop has no backward DDL
    assert!(matches!(
        db.engine.rollback(None).await,
        Err(EngineError::NoRollbackAvailable { reverted, .. }) if reverted.is_empty()
    ));
}

#[tokio::test]
async fn test_column_alteration_is_a_planning_error() {
    let db = sqlite().await;
    db.engine
        .migrate(&items(vec![ColumnDefinition::new("note", ColumnType::Text)]), ExecutionMode::Safe)
        .await
        .unwrap();

    let tightened = items(vec![ColumnDefinition::new("note", ColumnType::Text).not_null()]);
    let err = db
        .engine
        .migrate(&tightened, ExecutionMode::Force)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Planning(_)));
    assert!(err.to_string().contains("sqlite does not support"));
    assert!(!db.lock.is_locked("drift_schema_migrations").await.unwrap());
}

#[tokio::test]
async fn test_history_table_round_trip() {
    let db = sqlite().await;
    let store: &dyn MigrationStore = &db.backend;
    store.ensure_schema().await.unwrap();
    store.ensure_schema().await.unwrap();

    // The history table never shows up as drift
    assert!(db.backend.introspect().await.unwrap().tables.is_empty());

    let migration = Migration {
        version: "1700000000000_0001".to_string(),
        description: "add column items.category".to_string(),
        forward_ddl: vec!["ALTER TABLE items ADD COLUMN category VARCHAR".to_string()],
        backward_ddl: vec!["ALTER TABLE items DROP COLUMN category".to_string()],
        risk_level: RiskLevel::Safe,
    };
    let applied_at = chrono::Utc::now();
    store.record(&migration, applied_at).await.unwrap();
    assert!(matches!(
        store.record(&migration, applied_at).await,
        Err(StoreError::DuplicateVersion(v)) if v == migration.version
    ));

    let records = store.list_applied().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].backward_ddl, migration.backward_ddl);
    assert_eq!(records[0].risk_level, RiskLevel::Safe);
    assert_eq!(
        records[0].applied_at.timestamp_millis(),
        applied_at.timestamp_millis()
    );

    assert!(store.remove(&migration.version).await.unwrap());
    assert!(!store.remove(&migration.version).await.unwrap());
    assert!(store.list_applied().await.unwrap().is_empty());
}
