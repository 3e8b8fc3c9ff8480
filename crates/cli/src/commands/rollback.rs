use drift_engine::{MigrationEngine, RollbackOutcome};

use super::{cancel_on_interrupt, exit};

/// `to == None` reverts everything
pub async fn run(engine: &MigrationEngine, to: Option<&str>) -> anyhow::Result<u8> {
    cancel_on_interrupt(engine.cancellation_token());

    match engine.rollback(to).await? {
        RollbackOutcome::Locked => {
            println!("Another instance is migrating this database; try again later.");
        }
        RollbackOutcome::Reverted(records) if records.is_empty() => {
            println!("Nothing to roll back.");
        }
        RollbackOutcome::Reverted(records) => {
            for record in &records {
                println!("reverted {} {}", record.version, record.description);
            }
            println!("Rolled back {} migration(s).", records.len());
        }
    }
    Ok(exit::SUCCESS)
}
