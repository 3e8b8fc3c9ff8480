//! # drift-engine: Schema migration engine
//!
//! Detects drift between a declared schema and a live database, plans DDL
//! migrations classified by risk, and applies them under a lock shared by
//! every instance pointed at the same database.
//!
//! ```no_run
//! use drift_engine::{DeclaredSchema, EngineConfig, ExecutionMode, MigrationEngine};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let declared = DeclaredSchema::from_path("schema.yaml")?;
//! let engine = MigrationEngine::connect("postgres://localhost/app", EngineConfig::default()).await?;
//! let report = engine.migrate(&declared, ExecutionMode::Safe).await?;
//! println!("{}", report.outcome);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod ddl;
pub mod diff;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod introspect;
pub mod lock;
pub mod migrations;
pub mod schema;


#[cfg(test)]
mod sqlite_tests;

pub use backends::{connect, DatabaseBackendType, DatabaseHandle, SchemaConnection};
pub use config::{database_url_from_env, EngineConfig, EngineConfigBuilder};
pub use ddl::{DdlEmitter, PostgresEmitter, SqliteEmitter};
pub use diff::{ChangeKind, SchemaChange, SchemaDiffer};
pub use engine::{MigrationEngine, MigrationOutcome, MigrationReport, RollbackOutcome};
pub use error::*;
pub use hooks::{HookBus, HookContext, HookOperation, HookTrigger, MigrationHook};
pub use introspect::SchemaIntrospector;
pub use lock::{LockAcquisition, LockProvider, LockState};
pub use migrations::{
    Compensation, ExecutionMode, Migration, MigrationPlan, MigrationRecord, MigrationStore,
    PlanStatus, RiskLevel,
};
pub use schema::{
    ColumnDefinition, ColumnType, DeclaredSchema, IndexDefinition, LiveSchema, Schema,
    TableSchema,
};
