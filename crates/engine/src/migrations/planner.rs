//! Migration Planner - Turns detected changes into executable units
//!
//! Changes to one table are grouped into a single unit when none of them is
//! destructive. A table with destructive changes gets one unit for its safe
//! and warning changes followed by one unit per destructive change, so that a
//! later rollback never has to undo safe and destructive work together.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::definitions::{Migration, MigrationPlan, RiskLevel};
use crate::ddl::DdlEmitter;
use crate::diff::{ChangeKind, Definition, SchemaChange};
use crate::error::PlanError;
use crate::schema::{ColumnDefinition, IndexDefinition, TableSchema};

/// Highest sequence number per millisecond before the timestamp is bumped
const MAX_SEQUENCE: u32 = 9999;

/// Builds migration plans using one dialect's emitter
pub struct MigrationPlanner {
    emitter: Arc<dyn DdlEmitter>,
}

/// DDL for one change. `backward` is `None` when no safe inverse exists.
struct ChangeDdl {
    forward: Vec<String>,
    backward: Option<Vec<String>>,
}

impl MigrationPlanner {
    pub fn new(emitter: Arc<dyn DdlEmitter>) -> Self {
        Self { emitter }
    }

    /// Risk classification of a single change
    pub fn classify(change: &SchemaChange) -> RiskLevel {
        match change.kind {
            ChangeKind::TableAdded | ChangeKind::IndexAdded | ChangeKind::IndexRemoved => {
                RiskLevel::Safe
            }
            ChangeKind::TableRemoved | ChangeKind::ColumnRemoved => RiskLevel::Destructive,
            ChangeKind::ColumnAdded => match &change.new_definition {
                Some(Definition::Column(column))
                    if !column.nullable
                        && column.default.is_none()
                        && !column.column_type.is_serial() =>
                {
                    // Fails on populated tables but never loses data
                    RiskLevel::Warning
                }
                _ => RiskLevel::Safe,
            },
            ChangeKind::ColumnTypeChanged => {
                match (&change.old_definition, &change.new_definition) {
                    (Some(Definition::Column(old)), Some(Definition::Column(new))) => {
                        classify_alteration(old, new)
                    }
                    _ => RiskLevel::Destructive,
                }
            }
        }
    }

    /// Plan with versions starting from the current time.
    pub fn plan(&self, changes: &[SchemaChange]) -> Result<MigrationPlan, PlanError> {
        self.plan_after(changes, None)
    }

    /// Plan with versions strictly above `last_applied`.
    pub fn plan_after(
        &self,
        changes: &[SchemaChange],
        last_applied: Option<&str>,
    ) -> Result<MigrationPlan, PlanError> {
        self.plan_at(changes, last_applied, Utc::now())
    }

    pub fn plan_at(
        &self,
        changes: &[SchemaChange],
        last_applied: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MigrationPlan, PlanError> {
        let mut versions = VersionSequence::new(now, last_applied);
        let mut migrations = Vec::new();

        for group in group_by_table(changes) {
            let (destructive, composable): (Vec<&SchemaChange>, Vec<&SchemaChange>) = group
                .into_iter()
                .partition(|change| Self::classify(change) == RiskLevel::Destructive);

            if !composable.is_empty() {
                migrations.push(self.build_unit(&composable, versions.next_version())?);
            }
            for change in destructive {
                migrations.push(self.build_unit(&[change], versions.next_version())?);
            }
        }

        tracing::debug!("Planned {} migration unit(s)", migrations.len());
        Ok(MigrationPlan::new(migrations))
    }

    fn build_unit(
        &self,
        changes: &[&SchemaChange],
        version: String,
    ) -> Result<Migration, PlanError> {
        let mut forward_ddl = Vec::new();
        let mut backward_parts = Vec::new();
        let mut reversible = true;
        let mut risk_level = RiskLevel::Safe;

        for change in changes {
            let ddl = self.change_ddl(change)?;
            forward_ddl.extend(ddl.forward);
            match ddl.backward {
                Some(backward) => backward_parts.push(backward),
                None => reversible = false,
            }
            risk_level = risk_level.max(Self::classify(change));
        }

        // Undo in reverse order of application
        let backward_ddl = if reversible {
            backward_parts.into_iter().rev().flatten().collect()
        } else {
            Vec::new()
        };

        let description = changes
            .iter()
            .map(|change| change.describe())
            .collect::<Vec<_>>()
            .join("; ");

        Ok(Migration {
            version,
            description,
            forward_ddl,
            backward_ddl,
            risk_level,
        })
    }

    fn change_ddl(&self, change: &SchemaChange) -> Result<ChangeDdl, PlanError> {
        let emitter = self.emitter.as_ref();
        let table = change.table.as_str();

        let ddl = match change.kind {
            ChangeKind::TableAdded => ChangeDdl {
                forward: emitter.create_table(new_table(change)?),
                backward: Some(vec![emitter.drop_table(table)]),
            },
            ChangeKind::TableRemoved => ChangeDdl {
                forward: vec![emitter.drop_table(table)],
                backward: None,
            },
            ChangeKind::ColumnAdded => {
                let column = new_column(change)?;
                ChangeDdl {
                    forward: vec![emitter.add_column(table, column)],
                    backward: Some(vec![emitter.drop_column(table, &column.name)]),
                }
            }
            ChangeKind::ColumnRemoved => {
                let column = old_column(change)?;
                ChangeDdl {
                    forward: vec![emitter.drop_column(table, &column.name)],
                    backward: None,
                }
            }
            ChangeKind::ColumnTypeChanged => {
                let old = old_column(change)?;
                let new = new_column(change)?;
                let forward = emitter.alter_column(table, old, new)?;
                let backward = if old.column_type.width_change(&new.column_type).is_lossy() {
                    None
                } else {
                    Some(emitter.alter_column(table, new, old)?)
                };
                ChangeDdl { forward, backward }
            }
            ChangeKind::IndexAdded => {
                let index = new_index(change)?;
                ChangeDdl {
                    forward: vec![emitter.create_index(table, index)],
                    backward: Some(vec![emitter.drop_index(table, &index.name)]),
                }
            }
            ChangeKind::IndexRemoved => {
                let index = old_index(change)?;
                ChangeDdl {
                    forward: vec![emitter.drop_index(table, &index.name)],
                    backward: Some(vec![emitter.create_index(table, index)]),
                }
            }
        };

        Ok(ddl)
    }
}

fn classify_alteration(old: &ColumnDefinition, new: &ColumnDefinition) -> RiskLevel {
    let mut risk = RiskLevel::Safe;

    if old.column_type.width_change(&new.column_type).is_lossy() {
        return RiskLevel::Destructive;
    }
    if old.column_type.comparable() != new.column_type.comparable() {
        risk = RiskLevel::Warning;
    }

    if old.nullable && !new.nullable {
        return RiskLevel::Destructive;
    }
    if !old.nullable && new.nullable {
        risk = RiskLevel::Warning;
    }

    if old.normalized_default() != new.normalized_default() {
        risk = RiskLevel::Warning;
    }

    risk
}

/// Split consecutive changes into per-table groups, keeping order.
fn group_by_table(changes: &[SchemaChange]) -> Vec<Vec<&SchemaChange>> {
    let mut groups: Vec<Vec<&SchemaChange>> = Vec::new();
    for change in changes {
        match groups.last_mut() {
            Some(group) if group[0].table == change.table => group.push(change),
            _ => groups.push(vec![change]),
        }
    }
    groups
}

fn missing(change: &SchemaChange, side: &'static str) -> PlanError {
    PlanError::MissingDefinition {
        table: change.table.clone(),
        kind: change.kind.to_string(),
        side,
    }
}

fn new_table(change: &SchemaChange) -> Result<&TableSchema, PlanError> {
    match &change.new_definition {
        Some(Definition::Table(table)) => Ok(table),
        _ => Err(missing(change, "new")),
    }
}

fn new_column(change: &SchemaChange) -> Result<&ColumnDefinition, PlanError> {
    match &change.new_definition {
        Some(Definition::Column(column)) => Ok(column),
        _ => Err(missing(change, "new")),
    }
}

fn old_column(change: &SchemaChange) -> Result<&ColumnDefinition, PlanError> {
    match &change.old_definition {
        Some(Definition::Column(column)) => Ok(column),
        _ => Err(missing(change, "old")),
    }
}

fn new_index(change: &SchemaChange) -> Result<&IndexDefinition, PlanError> {
    match &change.new_definition {
        Some(Definition::Index(index)) => Ok(index),
        _ => Err(missing(change, "new")),
    }
}

fn old_index(change: &SchemaChange) -> Result<&IndexDefinition, PlanError> {
    match &change.old_definition {
        Some(Definition::Index(index)) => Ok(index),
        _ => Err(missing(change, "old")),
    }
}

/// Generates `{epoch_millis:013}_{seq:04}` versions above the last applied one
struct VersionSequence {
    millis: i64,
    sequence: u32,
}

impl VersionSequence {
    fn new(now: DateTime<Utc>, last_applied: Option<&str>) -> Self {
        let floor = last_applied
            .and_then(|version| version.split('_').next())
            .and_then(|millis| millis.parse::<i64>().ok())
            .map(|millis| millis + 1)
            .unwrap_or(0);

        Self {
            millis: now.timestamp_millis().max(floor),
            sequence: 0,
        }
    }

    fn next_version(&mut self) -> String {
        if self.sequence > MAX_SEQUENCE {
            self.millis += 1;
            self.sequence = 0;
        }
        let version = format!("{:013}_{:04}", self.millis, self.sequence);
        self.sequence += 1;
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddl::{PostgresEmitter, SqliteEmitter};
    use crate::diff::diff;
    use crate::migrations::PlanStatus;
    use crate::schema::{ColumnType, Schema};
    use chrono::TimeZone;

    fn planner() -> MigrationPlanner {
        MigrationPlanner::new(Arc::new(PostgresEmitter::new()))
    }

    fn items(columns: Vec<ColumnDefinition>) -> Schema {
        let mut table = TableSchema::new("items");
        table.columns = columns;
        Schema::new(vec![table])
    }

    fn id() -> ColumnDefinition {
        ColumnDefinition::new("id", ColumnType::Integer).primary_key()
    }

    #[test]
    fn test_add_nullable_column_scenario() {
        let live = items(vec![id()]);
        let declared = items(vec![
            id(),
            ColumnDefinition::new("category", ColumnType::VarChar(None)),
        ]);

        let plan = planner().plan(&diff(&declared, &live)).unwrap();
        assert_eq!(plan.status, PlanStatus::Pending);
        assert_eq!(plan.migrations.len(), 1);

        let migration = &plan.migrations[0];
        assert_eq!(migration.risk_level, RiskLevel::Safe);
        assert_eq!(
            migration.forward_ddl,
            vec!["ALTER TABLE items ADD COLUMN category VARCHAR".to_string()]
        );
        assert_eq!(
            migration.backward_ddl,
            vec!["ALTER TABLE items DROP COLUMN category".to_string()]
        );
    }

    #[test]
    fn test_destructive_changes_are_split_out() {
        let live = items(vec![
            id(),
            ColumnDefinition::new("legacy", ColumnType::Text),
            ColumnDefinition::new("old_flag", ColumnType::Boolean),
        ]);
        let declared = items(vec![
            id(),
            ColumnDefinition::new("category", ColumnType::VarChar(None)),
            ColumnDefinition::new("note", ColumnType::Text),
        ]);

        let plan = planner().plan(&diff(&declared, &live)).unwrap();
        let risks: Vec<_> = plan.migrations.iter().map(|m| m.risk_level).collect();
        assert_eq!(
            risks,
            vec![RiskLevel::Safe, RiskLevel::Destructive, RiskLevel::Destructive]
        );
        assert_eq!(
            plan.migrations[0].description,
            "add column items.category; add column items.note"
        );
        assert_eq!(plan.migrations[0].forward_ddl.len(), 2);
        assert!(plan.migrations[1].backward_ddl.is_empty());
        assert!(plan.migrations[2].backward_ddl.is_empty());
    }

    #[test]
    fn test_additive_table_changes_form_one_unit() {
        let live = items(vec![id()]);
        let declared = Schema::new(vec![TableSchema::new("items")
            .column(id())
            .column(ColumnDefinition::new("title", ColumnType::Text))
            .index(IndexDefinition::new("items_title_idx", vec!["title".into()]))]);

        let plan = planner().plan(&diff(&declared, &live)).unwrap();
        assert_eq!(plan.migrations.len(), 1);
        assert_eq!(
            plan.migrations[0].backward_ddl,
            vec![
                "DROP INDEX items_title_idx".to_string(),
                "ALTER TABLE items DROP COLUMN title".to_string(),
            ]
        );
    }

    #[test]
    fn test_alteration_risk() {
        let narrow = SchemaChange::column_changed(
            "items",
            &ColumnDefinition::new("title", ColumnType::VarChar(Some(200))),
            &ColumnDefinition::new("title", ColumnType::VarChar(Some(50))),
        );
        assert_eq!(MigrationPlanner::classify(&narrow), RiskLevel::Destructive);

        let widen = SchemaChange::column_changed(
            "items",
            &ColumnDefinition::new("title", ColumnType::VarChar(Some(50))),
            &ColumnDefinition::new("title", ColumnType::VarChar(Some(200))),
        );
        assert_eq!(MigrationPlanner::classify(&widen), RiskLevel::Warning);

        let tighten = SchemaChange::column_changed(
            "items",
            &ColumnDefinition::new("title", ColumnType::Text),
            &ColumnDefinition::new("title", ColumnType::Text).not_null(),
        );
        assert_eq!(MigrationPlanner::classify(&tighten), RiskLevel::Destructive);

        let relax = SchemaChange::column_changed(
            "items",
            &ColumnDefinition::new("title", ColumnType::Text).not_null(),
            &ColumnDefinition::new("title", ColumnType::Text),
        );
        assert_eq!(MigrationPlanner::classify(&relax), RiskLevel::Warning);

        let plan = planner().plan(&[widen]).unwrap();
        assert_eq!(
            plan.migrations[0].backward_ddl,
            vec!["ALTER TABLE items ALTER COLUMN title TYPE VARCHAR(50)".to_string()]
        );
        let plan = planner().plan(&[narrow]).unwrap();
        assert!(!plan.migrations[0].is_reversible());
    }

    #[test]
    fn test_required_column_without_default_is_warning() {
        let change = SchemaChange::column_added(
            "items",
            &ColumnDefinition::new("sku", ColumnType::Text).not_null(),
        );
        assert_eq!(MigrationPlanner::classify(&change), RiskLevel::Warning);

        let change = SchemaChange::column_added(
            "items",
            &ColumnDefinition::new("sku", ColumnType::Text)
                .not_null()
                .with_default("''"),
        );
        assert_eq!(MigrationPlanner::classify(&change), RiskLevel::Safe);
    }

    #[test]
    fn test_versions_are_monotonic_and_above_history() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let changes = vec![
            SchemaChange::table_removed(&TableSchema::new("a")),
            SchemaChange::table_removed(&TableSchema::new("b")),
        ];

        let plan = planner().plan_at(&changes, None, now).unwrap();
        let versions = plan.versions();
        assert_eq!(versions[0], format!("{:013}_0000", now.timestamp_millis()));
        assert!(versions[0] < versions[1]);

        // A clock behind the newest applied version still yields larger versions
        let ahead = format!("{:013}_0003", now.timestamp_millis() + 5_000);
        let plan = planner().plan_at(&changes, Some(&ahead), now).unwrap();
        assert!(plan.versions().iter().all(|v| *v > ahead.as_str()));
    }

    #[test]
    fn test_unsupported_alteration_is_planning_error() {
        let planner = MigrationPlanner::new(Arc::new(SqliteEmitter::new()));
        let change = SchemaChange::column_changed(
            "items",
            &ColumnDefinition::new("title", ColumnType::VarChar(Some(50))),
            &ColumnDefinition::new("title", ColumnType::VarChar(Some(200))),
        );
        assert!(matches!(planner.plan(&[change]), Err(PlanError::Ddl(_))));
    }
}
