//! Migration System
//!
//! Planning, execution, history and rollback of schema migrations.

pub mod definitions;
pub mod executor;
pub mod planner;
pub mod rollback;
pub mod store;

pub use definitions::{
    ExecutionMode, Migration, MigrationPlan, MigrationRecord, PlanStatus, RiskLevel,
};
pub use executor::{Compensation, ExecutionReport, MigrationExecutor, UnitFailure};
pub use planner::MigrationPlanner;
pub use rollback::RollbackRunner;
pub use store::{HistoryTable, MemoryMigrationStore, MigrationStore};
