use drift_engine::MigrationEngine;

use super::exit;

pub async fn run(engine: &MigrationEngine) -> anyhow::Result<u8> {
    let records = engine.status().await?;
    if records.is_empty() {
        println!("No migrations applied.");
        return Ok(exit::SUCCESS);
    }

    println!("{:<20} {:<12} {:<25} DESCRIPTION", "VERSION", "RISK", "APPLIED AT");
    for record in &records {
        println!(
            "{:<20} {:<12} {:<25} {}{}",
            record.version,
            record.risk_level.to_string(),
            record.applied_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            record.description,
            if record.is_reversible() { "" } else { " (irreversible)" }
        );
    }
    Ok(exit::SUCCESS)
}
