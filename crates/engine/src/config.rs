//! Engine configuration
//!
//! Defaults suit a single deployment talking to one database. Values can be
//! set through [`EngineConfigBuilder`] or loaded from `DRIFT_*` environment
//! variables with [`EngineConfig::from_env`].

use serde::{Deserialize, Serialize};
use service_builder::builder;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Configuration shared by every engine component
#[derive(Debug, Clone, Serialize, Deserialize)]
#[builder]
pub struct EngineConfig {
    /// Key that serializes migrations across instances
    #[builder(default = "\"drift_schema_migrations\".to_string()", getter)]
    pub lock_key: String,

    /// Give up acquiring the lock after this long
    #[builder(default = "Duration::from_secs(30)", getter)]
    pub lock_timeout: Duration,

    /// Retries after the first acquisition attempt
    #[builder(default = "10", getter)]
    pub lock_max_retries: u32,

    /// Base delay between attempts; doubles per attempt up to 8x
    #[builder(default = "Duration::from_millis(500)", getter)]
    pub lock_retry_interval: Duration,

    /// Release attempts before giving up and logging
    #[builder(default = "3", getter)]
    pub release_attempts: u32,

    #[builder(default = "Duration::from_millis(200)", getter)]
    pub release_backoff: Duration,

    /// Table holding applied migration records
    #[builder(default = "\"drift_schema_migrations\".to_string()", getter)]
    pub history_table: String,

    /// Database schema to introspect (PostgreSQL)
    #[builder(default = "\"public\".to_string()", getter)]
    pub schema_name: String,

    /// Directory for lock files when the database has no advisory locks
    #[builder(default = "PathBuf::from(\".drift/locks\")", getter, setter)]
    pub lock_dir: PathBuf,

    /// Lock files older than this are considered abandoned
    #[builder(default = "Duration::from_secs(900)", getter)]
    pub stale_lock_after: Duration,

    #[builder(default = "5", getter)]
    pub max_connections: u32,

    /// Stop starting new units once this much time has passed
    #[builder(default = "None", getter)]
    pub execution_deadline: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_key: "drift_schema_migrations".to_string(),
            lock_timeout: Duration::from_secs(30),
            lock_max_retries: 10,
            lock_retry_interval: Duration::from_millis(500),
            release_attempts: 3,
            release_backoff: Duration::from_millis(200),
            history_table: "drift_schema_migrations".to_string(),
            schema_name: "public".to_string(),
            lock_dir: PathBuf::from(".drift/locks"),
            stale_lock_after: Duration::from_secs(900), // 15 minutes
            max_connections: 5,
            execution_deadline: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `DRIFT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();

        let lock_key = get_env_or_default("DRIFT_LOCK_KEY", &defaults.lock_key);
        let lock_timeout = Duration::from_secs(parse_env(
            "DRIFT_LOCK_TIMEOUT_SECS",
            defaults.lock_timeout.as_secs(),
            "lock_timeout",
            "number of seconds",
        )?);
        let lock_max_retries = parse_env(
            "DRIFT_LOCK_MAX_RETRIES",
            defaults.lock_max_retries,
            "lock_max_retries",
            "positive integer",
        )?;
        let lock_retry_interval = Duration::from_millis(parse_env(
            "DRIFT_LOCK_RETRY_INTERVAL_MS",
            defaults.lock_retry_interval.as_millis() as u64,
            "lock_retry_interval",
            "number of milliseconds",
        )?);
        let release_attempts = parse_env(
            "DRIFT_RELEASE_ATTEMPTS",
            defaults.release_attempts,
            "release_attempts",
            "positive integer",
        )?;
        let release_backoff = Duration::from_millis(parse_env(
            "DRIFT_RELEASE_BACKOFF_MS",
            defaults.release_backoff.as_millis() as u64,
            "release_backoff",
            "number of milliseconds",
        )?);
        let history_table = get_env_or_default("DRIFT_HISTORY_TABLE", &defaults.history_table);
        let schema_name = get_env_or_default("DRIFT_SCHEMA", &defaults.schema_name);
        let lock_dir = env::var("DRIFT_LOCK_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.lock_dir);
        let stale_lock_after = Duration::from_secs(parse_env(
            "DRIFT_STALE_LOCK_SECS",
            defaults.stale_lock_after.as_secs(),
            "stale_lock_after",
            "number of seconds",
        )?);
        let max_connections = parse_env(
            "DRIFT_MAX_CONNECTIONS",
            defaults.max_connections,
            "max_connections",
            "positive integer",
        )?;
        let execution_deadline = match env::var("DRIFT_EXECUTION_DEADLINE_SECS") {
            Ok(value) => Some(Duration::from_secs(value.parse::<u64>().map_err(|_| {
                ConfigError::InvalidValue {
                    field: "execution_deadline".to_string(),
                    value: value.clone(),
                    expected: "number of seconds".to_string(),
                }
            })?)),
            Err(_) => None,
        };

        let config = EngineConfig {
            lock_key,
            lock_timeout,
            lock_max_retries,
            lock_retry_interval,
            release_attempts,
            release_backoff,
            history_table,
            schema_name,
            lock_dir,
            stale_lock_after,
            max_connections,
            execution_deadline,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_key.trim().is_empty() {
            return Err(ConfigError::ValidationFailed {
                field: "lock_key".to_string(),
                reason: "Lock key cannot be empty".to_string(),
            });
        }

        if !is_plain_identifier(&self.history_table) {
            return Err(ConfigError::ValidationFailed {
                field: "history_table".to_string(),
                reason: format!(
                    "'{}' is not a valid table name (letters, digits and underscores, not starting with a digit)",
                    self.history_table
                ),
            });
        }

        if self.schema_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed {
                field: "schema_name".to_string(),
                reason: "Schema name cannot be empty".to_string(),
            });
        }

        if self.lock_max_retries == 0 {
            return Err(ConfigError::ValidationFailed {
                field: "lock_max_retries".to_string(),
                reason: "At least one retry is required".to_string(),
            });
        }

        if self.release_attempts == 0 {
            return Err(ConfigError::ValidationFailed {
                field: "release_attempts".to_string(),
                reason: "At least one release attempt is required".to_string(),
            });
        }

        // The advisory lock pins one connection for the whole run
        if self.max_connections < 2 {
            return Err(ConfigError::ValidationFailed {
                field: "max_connections".to_string(),
                reason: "At least two connections are required".to_string(),
            });
        }

        Ok(())
    }
}

impl EngineConfigBuilder {
    /// Fast feedback for local work
    pub fn development() -> Self {
        EngineConfigBuilder::new()
            .lock_timeout(Duration::from_secs(10))
            .lock_retry_interval(Duration::from_millis(250))
            .stale_lock_after(Duration::from_secs(300))
    }

    /// Patient lock acquisition for rolling deployments
    pub fn production() -> Self {
        EngineConfigBuilder::new()
            .lock_timeout(Duration::from_secs(120))
            .lock_max_retries(20)
            .lock_retry_interval(Duration::from_secs(1))
            .release_attempts(5)
            .release_backoff(Duration::from_millis(500))
            .max_connections(10)
    }

    /// Minimal waits for test suites
    pub fn testing() -> Self {
        EngineConfigBuilder::new()
            .lock_timeout(Duration::from_millis(200))
            .lock_max_retries(3)
            .lock_retry_interval(Duration::from_millis(10))
            .release_attempts(3)
            .release_backoff(Duration::from_millis(5))
            .stale_lock_after(Duration::from_secs(60))
    }
}

/// Database URL from `DRIFT_DATABASE_URL`, falling back to `DATABASE_URL`
pub fn database_url_from_env() -> Result<String, ConfigError> {
    env::var("DRIFT_DATABASE_URL")
        .or_else(|_| get_env_required("DATABASE_URL"))
        .map_err(|_| ConfigError::MissingEnvVar {
            var: "DRIFT_DATABASE_URL".to_string(),
        })
}

fn get_env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar {
        var: key.to_string(),
    })
}

fn get_env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(
    key: &str,
    default: T,
    field: &str,
    expected: &str,
) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            field: field.to_string(),
            value,
            expected: expected.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
