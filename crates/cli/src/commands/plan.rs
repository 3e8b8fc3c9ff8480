use anyhow::Context;
use drift_engine::{DeclaredSchema, MigrationEngine, MigrationPlan};
use std::path::Path;

use super::exit;

pub fn load_schema(path: &Path) -> anyhow::Result<DeclaredSchema> {
    DeclaredSchema::from_path(path)
        .with_context(|| format!("Failed to load declared schema from {}", path.display()))
}

pub async fn run(engine: &MigrationEngine, schema: &Path, json: bool) -> anyhow::Result<u8> {
    let declared = load_schema(schema)?;
    let plan = engine.plan(&declared).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&plan);
    }
    Ok(exit::SUCCESS)
}

pub fn print_plan(plan: &MigrationPlan) {
    if plan.is_empty() {
        println!("No changes needed; the database matches the declared schema.");
        return;
    }

    println!(
        "{} migration(s), {} statement(s):",
        plan.len(),
        plan.statement_count()
    );
    for migration in &plan.migrations {
        println!();
        println!(
            "  {} [{}] {}",
            migration.version, migration.risk_level, migration.description
        );
        for statement in &migration.forward_ddl {
            println!("    {};", statement);
        }
        if !migration.is_reversible() {
            println!("    (irreversible)");
        }
    }
    if plan.has_destructive() {
        println!();
        println!("Destructive migrations only run with --mode force.");
    }
}
