//! Error types for the migration engine
//!
//! Each concern has its own error enum. [`EngineError`] is what the public
//! entry points return and separates failures by how a caller should react to
//! them: retry, fix and retry, or stop and repair the database by hand.

use thiserror::Error;

use crate::hooks::HookTrigger;
use crate::migrations::{MigrationPlan, MigrationRecord};

/// Result type for engine entry points
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for lock providers
pub type LockResult<T> = Result<T, LockError>;

/// Result type for migration stores
pub type StoreResult<T> = Result<T, StoreError>;

/// Declared schema loading and validation errors
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Invalid column type: '{0}'")]
    InvalidType(String),

    #[error("Empty identifier in {0}")]
    EmptyIdentifier(String),

    #[error("Duplicate table '{0}'")]
    DuplicateTable(String),

    #[error("Duplicate column '{column}' in table '{table}'")]
    DuplicateColumn { table: String, column: String },

    #[error("Duplicate index '{0}'")]
    DuplicateIndex(String),

    #[error("Table '{0}' declares no columns")]
    EmptyTable(String),

    #[error("Index '{index}' on table '{table}' declares no columns")]
    EmptyIndex { table: String, index: String },

    #[error("Index '{index}' on table '{table}' references unknown column '{column}'")]
    UnknownIndexColumn {
        table: String,
        index: String,
        column: String,
    },

    #[error("Failed to parse schema: {0}")]
    Parse(String),

    #[error("Failed to read schema file: {0}")]
    Io(#[from] std::io::Error),
}

/// Live schema reading errors
#[derive(Error, Debug)]
pub enum IntrospectionError {
    #[error("Database error during introspection: {0}")]
    Database(String),

    #[error("Unreadable catalog entry for {object}: {message}")]
    Catalog { object: String, message: String },
}

impl From<sqlx::Error> for IntrospectionError {
    fn from(err: sqlx::Error) -> Self {
        IntrospectionError::Database(err.to_string())
    }
}

/// DDL rendering errors
#[derive(Error, Debug)]
pub enum DdlError {
    #[error("{dialect} does not support {operation}")]
    Unsupported { dialect: String, operation: String },

    #[error("Invalid identifier: '{0}'")]
    InvalidIdentifier(String),
}

/// A DDL batch failed; the batch's transaction was rolled back if the
/// backend supports transactional DDL
#[derive(Error, Debug, Clone)]
#[error("Statement {index} failed: {message} [{statement}]")]
pub struct DdlExecutionError {
    pub index: usize,
    pub statement: String,
    pub message: String,
}

/// Planning errors
#[derive(Error, Debug)]
pub enum PlanError {
    #[error(transparent)]
    Ddl(#[from] DdlError),

    #[error("Change '{kind}' on table '{table}' carries no {side} definition")]
    MissingDefinition {
        table: String,
        kind: String,
        side: &'static str,
    },
}

/// Lock provider errors
///
/// A lock that is simply held by someone else is not an error; see
/// [`crate::lock::LockAcquisition::Denied`].
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock '{key}' could not be acquired after {attempts} attempts and no holder was detected")]
    Exhausted { key: String, attempts: u32 },

    #[error("Invalid lock key: '{0}'")]
    InvalidKey(String),

    #[error("Lock path escapes the lock directory: {0}")]
    PathTraversal(String),

    #[error("Lock database error: {0}")]
    Database(String),

    #[error("Lock file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock file serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::Database(err.to_string())
    }
}

/// Migration history errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Migration history database error: {0}")]
    Database(String),

    #[error("Migration version '{0}' is already recorded")]
    DuplicateVersion(String),

    #[error("Corrupt history record '{version}': {message}")]
    Corrupt { version: String, message: String },

    #[error("History serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// Hook handler failures, aggregated per fire
#[derive(Error, Debug)]
pub enum HookError {
    #[error("{} hook handler(s) failed during {}: {}", .failures.len(), .trigger, .failures.join("; "))]
    Failed {
        trigger: HookTrigger,
        failures: Vec<String>,
    },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Validation failed for {field}: {reason}")]
    ValidationFailed { field: String, reason: String },

    #[error("Unsupported database url: {0}")]
    UnsupportedDatabase(String),
}

/// Errors returned by the engine's public entry points
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Schema introspection failed: {0}")]
    Introspection(#[from] IntrospectionError),

    #[error("Lock acquisition failed: {0}")]
    LockAcquisition(#[from] LockError),

    /// A unit's forward DDL failed. When `compensated` is true the schema was
    /// restored to its state before the unit.
    #[error("Migration {version} failed ({}): {message}", if *.compensated { "compensated" } else { "not compensated" })]
    MigrationExecution {
        version: String,
        message: String,
        compensated: bool,
        plan: Box<MigrationPlan>,
    },

    /// Compensation for a failed unit failed too. The schema is in an
    /// intermediate state that needs manual repair.
    #[error("Rollback of migration {version} failed, manual intervention required: {message}")]
    RollbackExecution {
        version: String,
        message: String,
        plan: Option<Box<MigrationPlan>>,
    },

    /// A requested rollback reached a migration with no backward DDL.
    /// `reverted` lists what was reverted before stopping, newest first.
    #[error("Migration {version} has no backward DDL and cannot be rolled back")]
    NoRollbackAvailable {
        version: String,
        reverted: Vec<MigrationRecord>,
    },

    #[error("Unknown migration version: {0}")]
    UnknownVersion(String),

    #[error("Migration history error: {0}")]
    Store(#[from] StoreError),

    #[error("Planning failed: {0}")]
    Planning(#[from] PlanError),

    #[error("Aborted by before-DDL hook: {0}")]
    HookAborted(#[source] HookError),

    #[error("Invalid declared schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database connection failed: {0}")]
    Connection(String),
}

impl EngineError {
    /// Whether the same invocation can simply be run again later.
    ///
    /// Introspection and lock acquisition failures happen before any mutation.
    /// A compensated execution failure left the schema unchanged, although the
    /// root cause usually needs fixing before a retry succeeds.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Introspection(_)
            | EngineError::LockAcquisition(_)
            | EngineError::Connection(_) => true,
            EngineError::MigrationExecution { compensated, .. } => *compensated,
            _ => false,
        }
    }

    pub fn requires_manual_intervention(&self) -> bool {
        matches!(self, EngineError::RollbackExecution { .. })
    }
}
