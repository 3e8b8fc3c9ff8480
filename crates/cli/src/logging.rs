//! Logging setup
//!
//! Logs go to stderr so command output on stdout stays machine readable.
//! `RUST_LOG` wins over everything else when set.

use std::env;
use std::io;
use std::str::FromStr;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {} (expected text or json)", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for the drift crates (e.g. "info", "debug")
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Read `DRIFT_LOG_LEVEL` and `DRIFT_LOG_FORMAT`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: env::var("DRIFT_LOG_LEVEL").unwrap_or(defaults.level),
            format: env::var("DRIFT_LOG_FORMAT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.format),
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Filter used when `RUST_LOG` is unset
    pub fn directive(&self) -> String {
        format!("warn,drift_engine={level},drift={level}", level = self.level)
    }
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(config.directive()))?;

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stderr).json())
            .try_init()?,
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stderr).with_target(false))
            .try_init()?,
    }

    tracing::debug!(
        "Logging initialized (filter: {}, format: {:?})",
        config.directive(),
        config.format
    );
    Ok(())
}
