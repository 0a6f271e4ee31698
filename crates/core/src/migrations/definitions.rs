//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the fundamental types used throughout the migration system
//! including Migration, LedgerEntry, and the per-run result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::MigrateError;

/// A versioned schema change discovered on disk
///
/// Immutable once discovered; the filesystem view is advisory and is
/// reconciled against the ledger on every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    /// Version token (`YYYYMMDD_HHMMSS`), monotonically increasing
    pub version: String,
    /// Human-readable name parsed from the filename
    pub name: String,
    /// Source file the migration was parsed from
    pub path: PathBuf,
    /// SQL statements to apply the migration
    pub up_sql: String,
    /// SQL statements to revert the migration; empty means irreversible
    pub down_sql: String,
    /// When the migration was created, derived from the version token
    pub created_at: DateTime<Utc>,
}

impl Migration {
    /// Whether the migration carries a down transform.
    pub fn is_reversible(&self) -> bool {
        !self.down_sql.trim().is_empty()
    }
}

/// One row of the applied-migration ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Version token of the applied migration
    pub version: String,
    /// Name recorded at apply time
    pub name: String,
    /// Batch number; entries applied by one `latest` run share a batch
    pub batch: i32,
    /// When the migration was applied
    pub applied_at: DateTime<Utc>,
}

/// Migration state relative to the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MigrationStatus {
    /// Not yet applied
    Pending,
    /// Recorded in the ledger
    Applied {
        applied_at: DateTime<Utc>,
        batch: i32,
    },
}

/// What happened to one migration during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepStatus {
    Applied,
    Skipped,
    Reverted,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StepStatus::Applied => "applied",
            StepStatus::Skipped => "skipped",
            StepStatus::Reverted => "reverted",
            StepStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// One (version, status) pair in execution order
#[derive(Debug, Clone, Serialize)]
pub struct RunStep {
    pub version: String,
    pub status: StepStatus,
}

impl RunStep {
    pub fn new(version: impl Into<String>, status: StepStatus) -> Self {
        Self {
            version: version.into(),
            status,
        }
    }
}

/// Terminal state of one orchestrator invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Completed,
    Failed,
}

/// Outcome of one orchestrator invocation
///
/// Ordered steps in execution order plus an optional terminal error.
/// Transient, returned to the caller, never persisted.
#[derive(Debug)]
pub struct RunResult {
    pub outcome: RunOutcome,
    /// Steps in the order they were attempted
    pub steps: Vec<RunStep>,
    /// Batch number assigned to this run's applies, if any were planned
    pub batch: Option<i32>,
    /// The error that halted the run, when `outcome` is `Failed`
    pub error: Option<MigrateError>,
}

impl RunResult {
    pub fn completed(steps: Vec<RunStep>, batch: Option<i32>) -> Self {
        Self {
            outcome: RunOutcome::Completed,
            steps,
            batch,
            error: None,
        }
    }

    pub fn failed(steps: Vec<RunStep>, batch: Option<i32>, error: MigrateError) -> Self {
        Self {
            outcome: RunOutcome::Failed,
            steps,
            batch,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// Version of the last migration that completed (applied or reverted).
    pub fn last_completed(&self) -> Option<&str> {
        self.steps
            .iter()
            .rev()
            .find(|step| matches!(step.status, StepStatus::Applied | StepStatus::Reverted))
            .map(|step| step.version.as_str())
    }

    /// Version of the first migration that failed.
    pub fn first_failed(&self) -> Option<&str> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Failed)
            .map(|step| step.version.as_str())
    }
}

/// Applied/pending view of every discovered migration, plus ledger anomalies
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// One row per discovered migration, ascending by version
    pub rows: Vec<(Migration, MigrationStatus)>,
    /// Ledger entries whose migration file no longer exists
    pub ghosts: Vec<LedgerEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(version: &str, status: StepStatus) -> RunStep {
        RunStep::new(version, status)
    }

    #[test]
    fn reversibility_depends_on_down_sql() {
        let mut migration = Migration {
            version: "20240101_120000".to_string(),
            name: "create users".to_string(),
            path: PathBuf::from("20240101_120000_create_users.sql"),
            up_sql: "CREATE TABLE users (id SERIAL PRIMARY KEY);".to_string(),
            down_sql: "DROP TABLE users;".to_string(),
            created_at: Utc::now(),
        };
        assert!(migration.is_reversible());

        migration.down_sql = "   \n".to_string();
        assert!(!migration.is_reversible());
    }

    #[test]
    fn failed_run_reports_last_completed_and_first_failed() {
        let result = RunResult::failed(
            vec![
                step("20240101_120000", StepStatus::Applied),
                step("20240102_120000", StepStatus::Skipped),
                step("20240103_120000", StepStatus::Applied),
                step("20240104_120000", StepStatus::Failed),
            ],
            Some(3),
            MigrateError::execution("20240104_120000", "boom"),
        );

        assert!(!result.is_success());
        assert_eq!(result.last_completed(), Some("20240103_120000"));
        assert_eq!(result.first_failed(), Some("20240104_120000"));
    }

    #[test]
    fn empty_completed_run_has_no_versions_to_report() {
        let result = RunResult::completed(Vec::new(), None);
        assert!(result.is_success());
        assert_eq!(result.last_completed(), None);
        assert_eq!(result.first_failed(), None);
    }

    #[test]
    fn reverted_steps_count_as_completed() {
        let result = RunResult::completed(
            vec![
                step("20240103_120000", StepStatus::Reverted),
                step("20240102_120000", StepStatus::Reverted),
            ],
            None,
        );
        assert_eq!(result.last_completed(), Some("20240102_120000"));
    }
}
