//! Database Backends
//!
//! Each backend implements introspection, transactional DDL execution and the
//! migration history store for one database family. [`connect`] inspects the
//! URL and the server once and assembles the matching components.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::ddl::{DdlEmitter, PostgresEmitter, SqliteEmitter};
use crate::error::{ConfigError, DdlExecutionError, EngineError, EngineResult};
use crate::introspect::SchemaIntrospector;
use crate::lock::{AdvisoryLockProvider, FileLockProvider, LockProvider};
use crate::migrations::MigrationStore;

/// Database backend type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseBackendType {
    PostgreSQL,
    SQLite,
}

impl DatabaseBackendType {
    /// Backend for a connection URL, judged by its scheme
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?;
        scheme.parse().ok()
    }
}

impl std::fmt::Display for DatabaseBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseBackendType::PostgreSQL => write!(f, "postgresql"),
            DatabaseBackendType::SQLite => write!(f, "sqlite"),
        }
    }
}

impl std::str::FromStr for DatabaseBackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DatabaseBackendType::PostgreSQL),
            "sqlite" => Ok(DatabaseBackendType::SQLite),
            _ => Err(format!("Unsupported database backend: {}", s)),
        }
    }
}

/// Executes DDL batches
#[async_trait]
pub trait SchemaConnection: Send + Sync {
    /// Whether a failed batch leaves no trace
    fn supports_transactional_ddl(&self) -> bool;

    /// Run all statements as one unit, in order. On failure the error names
    /// the statement that failed.
    async fn execute_ddl(&self, statements: &[String]) -> Result<(), DdlExecutionError>;
}

/// The per-database components the engine works with
#[derive(Clone)]
pub struct DatabaseHandle {
    pub backend_type: DatabaseBackendType,
    pub introspector: Arc<dyn SchemaIntrospector>,
    pub emitter: Arc<dyn DdlEmitter>,
    pub connection: Arc<dyn SchemaConnection>,
    pub store: Arc<dyn MigrationStore>,
}

impl DatabaseHandle {
    /// Use one backend object for introspection, execution and history.
    pub fn from_backend<B>(backend: B, emitter: Arc<dyn DdlEmitter>) -> Self
    where
        B: SchemaIntrospector + SchemaConnection + MigrationStore + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            backend_type: emitter.dialect(),
            introspector: backend.clone(),
            emitter,
            connection: backend.clone(),
            store: backend,
        }
    }

    pub fn postgres(backend: PostgresBackend) -> Self {
        Self::from_backend(backend, Arc::new(PostgresEmitter::new()))
    }

    pub fn sqlite(backend: SqliteBackend) -> Self {
        Self::from_backend(backend, Arc::new(SqliteEmitter::new()))
    }
}

/// Connect to `url` and choose the lock provider by probing the server.
pub async fn connect(
    url: &str,
    config: &EngineConfig,
) -> EngineResult<(DatabaseHandle, Arc<dyn LockProvider>)> {
    let backend_type = DatabaseBackendType::from_url(url).ok_or_else(|| {
        let scheme = url.split(':').next().unwrap_or_default();
        ConfigError::UnsupportedDatabase(scheme.to_string())
    })?;

    match backend_type {
        DatabaseBackendType::PostgreSQL => {
            let backend = PostgresBackend::connect(url, config)
                .await
                .map_err(|e| EngineError::Connection(e.to_string()))?;

            let lock: Arc<dyn LockProvider> = if backend
                .supports_advisory_locks()
                .await
                .map_err(|e| EngineError::Connection(e.to_string()))?
            {
                Arc::new(AdvisoryLockProvider::new(backend.pool().clone()))
            } else {
                tracing::info!("Advisory locks unavailable, falling back to lock files");
                Arc::new(FileLockProvider::new(
                    config.get_lock_dir(),
                    *config.get_stale_lock_after(),
                )?)
            };

            tracing::debug!("Connected to PostgreSQL with {} locks", lock.name());
            Ok((DatabaseHandle::postgres(backend), lock))
        }
        DatabaseBackendType::SQLite => {
            let backend = SqliteBackend::connect(url, config)
                .await
                .map_err(|e| EngineError::Connection(e.to_string()))?;
            let lock: Arc<dyn LockProvider> = Arc::new(FileLockProvider::new(
                config.get_lock_dir(),
                *config.get_stale_lock_after(),
            )?);

            tracing::debug!("Connected to SQLite with file locks");
            Ok((DatabaseHandle::sqlite(backend), lock))
        }
    }
}
