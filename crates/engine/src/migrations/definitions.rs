//! Migration Definitions - Core types for planned and applied migrations
//!
//! A [`Migration`] is one executable unit produced by the planner, a
//! [`MigrationPlan`] is the ordered sequence of units for one invocation and a
//! [`MigrationRecord`] is what the store keeps once a unit has been applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Potential for data loss of a migration unit
///
/// The classification is fixed at planning time. Execution modes decide
/// whether a level may run, they never change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Safe,
    Warning,
    Destructive,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Safe => write!(f, "safe"),
            RiskLevel::Warning => write!(f, "warning"),
            RiskLevel::Destructive => write!(f, "destructive"),
        }
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "safe" => Ok(RiskLevel::Safe),
            "warning" => Ok(RiskLevel::Warning),
            "destructive" => Ok(RiskLevel::Destructive),
            _ => Err(format!("Unknown risk level: {}", s)),
        }
    }
}

/// How the executor treats each risk level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExecutionMode {
    /// Plan only, issue no DDL
    DryRun,
    /// Run safe and warning units, refuse destructive ones
    #[default]
    Safe,
    /// Run everything
    Force,
}

impl ExecutionMode {
    /// Whether a unit of the given risk may run in this mode
    pub fn allows(&self, risk: RiskLevel) -> bool {
        match self {
            ExecutionMode::DryRun => false,
            ExecutionMode::Safe => risk != RiskLevel::Destructive,
            ExecutionMode::Force => true,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::DryRun => write!(f, "dry-run"),
            ExecutionMode::Safe => write!(f, "safe"),
            ExecutionMode::Force => write!(f, "force"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dry-run" | "dry_run" | "dryrun" => Ok(ExecutionMode::DryRun),
            "safe" => Ok(ExecutionMode::Safe),
            "force" => Ok(ExecutionMode::Force),
            _ => Err(format!("Unknown execution mode: {}", s)),
        }
    }
}

/// Overall state of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PlanStatus {
    #[default]
    Pending,
    Applied,
    PartiallyApplied,
    Failed,
    NoChanges,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStatus::Pending => write!(f, "pending"),
            PlanStatus::Applied => write!(f, "applied"),
            PlanStatus::PartiallyApplied => write!(f, "partially applied"),
            PlanStatus::Failed => write!(f, "failed"),
            PlanStatus::NoChanges => write!(f, "no changes"),
        }
    }
}

/// One executable migration unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    /// Sortable, unique version (`{epoch_millis:013}_{seq:04}`)
    pub version: String,
    pub description: String,
    pub forward_ddl: Vec<String>,
    /// Empty when the unit cannot be reversed
    pub backward_ddl: Vec<String>,
    pub risk_level: RiskLevel,
}

impl Migration {
    pub fn is_reversible(&self) -> bool {
        !self.backward_ddl.is_empty()
    }
}

/// Ordered migration units for one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MigrationPlan {
    pub migrations: Vec<Migration>,
    pub status: PlanStatus,
}

impl MigrationPlan {
    /// New plan; an empty plan has nothing to do
    pub fn new(migrations: Vec<Migration>) -> Self {
        let status = if migrations.is_empty() {
            PlanStatus::NoChanges
        } else {
            PlanStatus::Pending
        };
        Self { migrations, status }
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn versions(&self) -> Vec<&str> {
        self.migrations.iter().map(|m| m.version.as_str()).collect()
    }

    pub fn has_destructive(&self) -> bool {
        self.migrations
            .iter()
            .any(|m| m.risk_level == RiskLevel::Destructive)
    }

    /// Total statement count across all units
    pub fn statement_count(&self) -> usize {
        self.migrations.iter().map(|m| m.forward_ddl.len()).sum()
    }
}

/// Persisted record of an applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: String,
    pub description: String,
    pub backward_ddl: Vec<String>,
    pub risk_level: RiskLevel,
    pub applied_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn from_migration(migration: &Migration, applied_at: DateTime<Utc>) -> Self {
        Self {
            version: migration.version.clone(),
            description: migration.description.clone(),
            backward_ddl: migration.backward_ddl.clone(),
            risk_level: migration.risk_level,
            applied_at,
        }
    }

    pub fn is_reversible(&self) -> bool {
        !self.backward_ddl.is_empty()
    }
}
