pub mod migrate;
pub mod plan;
pub mod rollback;
pub mod status;

use anyhow::Context;
use drift_engine::{
    database_url_from_env, EngineConfig, EngineError, MigrationEngine, MigrationOutcome,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Process exit codes
pub mod exit {
    /// Applied, nothing to do, locked elsewhere or dry run
    pub const SUCCESS: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const REFUSED_DESTRUCTIVE: u8 = 2;
    /// A migration failed and the schema was restored
    pub const FAILED_COMPENSATED: u8 = 3;
    /// A migration failed and the schema may be half-migrated
    pub const FAILED_UNCOMPENSATED: u8 = 4;
}

/// Settings shared by every subcommand
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub database_url: Option<String>,
    pub lock_dir: Option<PathBuf>,
}

impl GlobalOptions {
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = EngineConfig::from_env().context("Invalid DRIFT_* configuration")?;
        if let Some(lock_dir) = &self.lock_dir {
            config.set_lock_dir(lock_dir.clone());
        }
        Ok(config)
    }

    pub fn database_url(&self) -> anyhow::Result<String> {
        match &self.database_url {
            Some(url) => Ok(url.clone()),
            None => database_url_from_env()
                .context("No database given; pass --database-url or set DRIFT_DATABASE_URL"),
        }
    }

    pub async fn connect(&self) -> anyhow::Result<MigrationEngine> {
        let config = self.engine_config()?;
        let url = self.database_url()?;
        Ok(MigrationEngine::connect(&url, config).await?)
    }
}

/// Cancel `token` on Ctrl-C. The running unit still finishes.
pub fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after the current migration unit");
            token.cancel();
        }
    });
}

pub fn outcome_exit_code(outcome: MigrationOutcome) -> u8 {
    match outcome {
        MigrationOutcome::NoChanges
        | MigrationOutcome::Locked
        | MigrationOutcome::Applied
        | MigrationOutcome::DryRun => exit::SUCCESS,
        MigrationOutcome::RefusedDestructive => exit::REFUSED_DESTRUCTIVE,
        MigrationOutcome::Cancelled => exit::ERROR,
    }
}

pub fn error_exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<EngineError>() {
        Some(EngineError::MigrationExecution {
            compensated: true, ..
        }) => exit::FAILED_COMPENSATED,
        Some(EngineError::MigrationExecution {
            compensated: false,
            ..
        })
        | Some(EngineError::RollbackExecution { .. }) => exit::FAILED_UNCOMPENSATED,
        _ => exit::ERROR,
    }
}

/// One-line explanation of an error for the terminal
pub fn describe_error(error: &anyhow::Error) -> String {
    match error.downcast_ref::<EngineError>() {
        Some(EngineError::MigrationExecution {
            version,
            message,
            compensated: true,
            ..
        }) => format!(
            "Migration {} failed; the schema was restored. Fix the cause and run again: {}",
            version, message
        ),
        Some(EngineError::MigrationExecution {
            version, message, ..
        }) => format!(
            "Migration {} failed and could not be undone; inspect the schema before retrying: {}",
            version, message
        ),
        Some(EngineError::RollbackExecution {
            version, message, ..
        }) => format!(
            "Rollback of {} failed; the schema needs manual repair: {}",
            version, message
        ),
        Some(EngineError::NoRollbackAvailable { version, reverted }) => format!(
            "Migration {} cannot be rolled back (no backward DDL); {} migration(s) were reverted before it",
            version,
            reverted.len()
        ),
        _ => format!("{:#}", error),
    }
}
