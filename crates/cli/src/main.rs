mod commands;
mod logging;

use clap::{ArgGroup, Parser, Subcommand};
use drift_engine::ExecutionMode;
use std::path::PathBuf;
use std::process::ExitCode;

use commands::GlobalOptions;
use logging::{init_logging, LogFormat, LoggingConfig};

#[derive(Parser)]
#[command(name = "drift")]
#[command(about = "Detect schema drift and apply migrations safely", version)]
struct Cli {
    /// Database URL (postgres://... or sqlite:...)
    #[arg(long, global = true, env = "DRIFT_DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Directory for lock files when the database has no advisory locks
    #[arg(long, global = true)]
    lock_dir: Option<PathBuf>,

    /// Log output format: text or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the migrations needed to reach the declared schema
    Plan {
        /// Declared schema file (.yaml, .yml or .json)
        #[arg(long, short)]
        schema: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply the migrations needed to reach the declared schema
    Migrate {
        #[arg(long, short)]
        schema: PathBuf,

        /// safe, force or dry-run
        #[arg(long, default_value = "safe")]
        mode: ExecutionMode,
    },

    /// Revert applied migrations
    #[command(group(ArgGroup::new("target").required(true).args(["to", "all"])))]
    Rollback {
        /// Keep this version and everything before it
        #[arg(long)]
        to: Option<String>,

        /// Revert every applied migration
        #[arg(long)]
        all: bool,
    },

    /// List applied migrations
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LoggingConfig::from_env();
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    if let Err(e) = init_logging(&log_config) {
        eprintln!("warning: logging disabled: {}", e);
    }

    let options = GlobalOptions {
        database_url: cli.database_url,
        lock_dir: cli.lock_dir,
    };

    match run(cli.command, &options).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::debug!("{:?}", e);
            eprintln!("error: {}", commands::describe_error(&e));
            ExitCode::from(commands::error_exit_code(&e))
        }
    }
}

async fn run(command: Commands, options: &GlobalOptions) -> anyhow::Result<u8> {
    let engine = options.connect().await?;

    match command {
        Commands::Plan { schema, json } => commands::plan::run(&engine, &schema, json).await,
        Commands::Migrate { schema, mode } => {
            commands::migrate::run(&engine, &schema, mode).await
        }
        Commands::Rollback { to, all } => {
            let target = if all { None } else { to.as_deref() };
            commands::rollback::run(&engine, target).await
        }
        Commands::Status => commands::status::run(&engine).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_migrate_mode_parses() {
        let cli = Cli::try_parse_from(["drift", "migrate", "-s", "schema.yaml", "--mode", "force"])
            .unwrap();
        match cli.command {
            Commands::Migrate { mode, .. } => assert_eq!(mode, ExecutionMode::Force),
            _ => panic!("Expected migrate"),
        }

        let cli = Cli::try_parse_from(["drift", "migrate", "--schema", "schema.yaml"]).unwrap();
        match cli.command {
            Commands::Migrate { mode, .. } => assert_eq!(mode, ExecutionMode::Safe),
            _ => panic!("Expected migrate"),
        }
    }

    #[test]
    fn test_rollback_requires_a_target() {
        assert!(Cli::try_parse_from(["drift", "rollback"]).is_err());
        assert!(Cli::try_parse_from(["drift", "rollback", "--to", "v1", "--all"]).is_err());

        let cli = Cli::try_parse_from(["drift", "rollback", "--all"]).unwrap();
        assert!(matches!(cli.command, Commands::Rollback { all: true, to: None }));
    }
}
