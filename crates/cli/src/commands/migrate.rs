use drift_engine::{ExecutionMode, MigrationEngine, MigrationOutcome, MigrationReport};
use std::path::Path;

use super::plan::{load_schema, print_plan};
use super::{cancel_on_interrupt, outcome_exit_code};

pub async fn run(engine: &MigrationEngine, schema: &Path, mode: ExecutionMode) -> anyhow::Result<u8> {
    let declared = load_schema(schema)?;
    cancel_on_interrupt(engine.cancellation_token());

    let report = engine.migrate(&declared, mode).await?;
    print_report(&report);
    Ok(outcome_exit_code(report.outcome))
}

fn print_report(report: &MigrationReport) {
    match report.outcome {
        MigrationOutcome::DryRun => {
            print_plan(&report.plan);
            return;
        }
        MigrationOutcome::NoChanges => {
            println!("No changes needed.");
            return;
        }
        MigrationOutcome::Locked => {
            println!("Another instance is migrating this database; nothing to do here.");
            return;
        }
        _ => {}
    }

    for migration in &report.applied {
        println!(
            "applied  {} [{}] {}",
            migration.version, migration.risk_level, migration.description
        );
    }
    for migration in &report.refused {
        println!(
            "refused  {} [{}] {}",
            migration.version, migration.risk_level, migration.description
        );
    }

    println!(
        "{}: {} applied, {} refused in {:.2?}",
        report.outcome,
        report.applied.len(),
        report.refused.len(),
        report.duration
    );
    if report.outcome == MigrationOutcome::RefusedDestructive {
        println!("Re-run with --mode force to apply destructive migrations.");
    }
    if !report.lock_released {
        eprintln!("warning: the migration lock could not be released and may block later runs");
    }
}
