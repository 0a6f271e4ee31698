//! Migration Runner - Orchestrates migration runs
//!
//! Computes the diff between discovered migrations and the ledger, decides
//! execution order, and drives the executor sequentially. Each invocation
//! is one logical run: plan, execute, report. Migrations within a run are
//! never parallelized.

use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use super::definitions::{
    LedgerEntry, Migration, MigrationStatus, RunResult, RunStep, StatusReport, StepStatus,
};
use super::executor::{ApplyOutcome, Executor};
use super::ledger::Ledger;
use super::repository::MigrationRepository;
use crate::error::{MigrateError, MigrateResult};

/// Drives one migration run end to end
pub struct Runner {
    repository: MigrationRepository,
    ledger: Ledger,
    executor: Executor,
}

impl Runner {
    pub fn new(repository: MigrationRepository, ledger: Ledger, executor: Executor) -> Self {
        Self {
            repository,
            ledger,
            executor,
        }
    }

    /// Wire repository, ledger, and executor to one pool.
    pub fn with_pool(
        pool: PgPool,
        migrations_dir: impl Into<PathBuf>,
        ledger_table: impl Into<String>,
    ) -> Self {
        let ledger = Ledger::new(pool.clone(), ledger_table);
        let executor = Executor::new(pool, ledger.clone());
        Self {
            repository: MigrationRepository::new(migrations_dir),
            ledger,
            executor,
        }
    }

    /// Set a per-migration deadline on the underlying executor.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.executor = self.executor.with_timeout(timeout);
        self
    }

    pub fn repository(&self) -> &MigrationRepository {
        &self.repository
    }

    /// Apply only the next (lowest-version) pending migration.
    pub async fn up(&self) -> MigrateResult<RunResult> {
        let (files, applied) = self.plan().await?;
        let pending = pending_migrations(&files, &applied);

        let Some(&next) = pending.first() else {
            return Ok(RunResult::completed(Vec::new(), None));
        };

        let batch = self.ledger.latest_batch().await? + 1;
        Ok(self.apply_sequence(&[next], batch).await)
    }

    /// Apply every pending migration, ascending, under one batch number.
    pub async fn latest(&self) -> MigrateResult<RunResult> {
        let (files, applied) = self.plan().await?;
        let pending = pending_migrations(&files, &applied);

        if pending.is_empty() {
            return Ok(RunResult::completed(Vec::new(), None));
        }

        let batch = self.ledger.latest_batch().await? + 1;
        Ok(self.apply_sequence(&pending, batch).await)
    }

    /// Revert the most recent batch, descending by version.
    pub async fn rollback(&self) -> MigrateResult<RunResult> {
        let (files, _) = self.plan().await?;

        let latest = self.ledger.latest_batch().await?;
        if latest == 0 {
            return Ok(RunResult::completed(Vec::new(), None));
        }

        let entries = self.ledger.entries_in_batch(latest).await?;
        Ok(self.revert_sequence(&files, &entries).await)
    }

    /// Revert every applied migration, across all batches, descending.
    pub async fn rollback_all(&self) -> MigrateResult<RunResult> {
        let (files, _) = self.plan().await?;

        let entries = self.ledger.entries().await?;
        if entries.is_empty() {
            return Ok(RunResult::completed(Vec::new(), None));
        }

        Ok(self.revert_sequence(&files, &entries).await)
    }

    /// Applied/pending status of every discovered migration, plus ghost
    /// ledger entries whose file no longer exists.
    pub async fn status(&self) -> MigrateResult<StatusReport> {
        self.ledger.ensure_storage().await?;

        let files = self.repository.list()?;
        let entries = self.ledger.entries().await?;
        let by_version: HashMap<&str, &LedgerEntry> =
            entries.iter().map(|e| (e.version.as_str(), e)).collect();

        let rows = files
            .iter()
            .map(|migration| {
                let status = match by_version.get(migration.version.as_str()) {
                    Some(entry) => MigrationStatus::Applied {
                        applied_at: entry.applied_at,
                        batch: entry.batch,
                    },
                    None => MigrationStatus::Pending,
                };
                (migration.clone(), status)
            })
            .collect();

        let known: HashSet<&str> = files.iter().map(|m| m.version.as_str()).collect();
        let ghosts = entries
            .iter()
            .filter(|entry| !known.contains(entry.version.as_str()))
            .cloned()
            .collect();

        Ok(StatusReport { rows, ghosts })
    }

    /// Planning: ensure ledger storage, load both views, report anomalies.
    async fn plan(&self) -> MigrateResult<(Vec<Migration>, HashSet<String>)> {
        self.ledger.ensure_storage().await?;

        let files = self.repository.list()?;
        let applied = self.ledger.applied_versions().await?;

        let known: HashSet<&str> = files.iter().map(|m| m.version.as_str()).collect();
        for version in &applied {
            if !known.contains(version.as_str()) {
                warn!(version = %version, "ledger entry has no matching migration file");
            }
        }

        Ok((files, applied))
    }

    async fn apply_sequence(&self, pending: &[&Migration], batch: i32) -> RunResult {
        let mut steps = Vec::new();

        for migration in pending {
            info!(
                version = %migration.version,
                name = %migration.name,
                batch,
                "applying migration"
            );

            match self.executor.apply(migration, batch).await {
                Ok(ApplyOutcome::Applied) => {
                    steps.push(RunStep::new(&migration.version, StepStatus::Applied));
                }
                Ok(ApplyOutcome::AlreadyApplied) => {
                    steps.push(RunStep::new(&migration.version, StepStatus::Skipped));
                }
                Err(err) => {
                    steps.push(RunStep::new(&migration.version, StepStatus::Failed));
                    return RunResult::failed(steps, Some(batch), err);
                }
            }
        }

        RunResult::completed(steps, Some(batch))
    }

    async fn revert_sequence(&self, files: &[Migration], entries: &[LedgerEntry]) -> RunResult {
        let by_version: HashMap<&str, &Migration> =
            files.iter().map(|m| (m.version.as_str(), m)).collect();

        let mut steps = Vec::new();
        for entry in entries {
            let Some(&migration) = by_version.get(entry.version.as_str()) else {
                // Ghost entry: the schema change is live but its down
                // transform is gone, so this revert cannot proceed.
                steps.push(RunStep::new(&entry.version, StepStatus::Failed));
                let err = MigrateError::execution(
                    &entry.version,
                    "no migration file exists for this ledger entry",
                );
                return RunResult::failed(steps, None, err);
            };

            info!(
                version = %migration.version,
                name = %migration.name,
                "reverting migration"
            );

            match self.executor.revert(migration).await {
                Ok(()) => {
                    steps.push(RunStep::new(&migration.version, StepStatus::Reverted));
                }
                Err(err) => {
                    steps.push(RunStep::new(&migration.version, StepStatus::Failed));
                    return RunResult::failed(steps, None, err);
                }
            }
        }

        RunResult::completed(steps, None)
    }
}

/// Pending = discovered minus applied, in ascending version order.
fn pending_migrations<'a>(
    files: &'a [Migration],
    applied: &HashSet<String>,
) -> Vec<&'a Migration> {
    files
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn migration(version: &str, name: &str) -> Migration {
        Migration {
            version: version.to_string(),
            name: name.to_string(),
            path: PathBuf::from(format!("{}_{}.sql", version, name)),
            up_sql: format!("CREATE TABLE {} (id SERIAL PRIMARY KEY);", name),
            down_sql: format!("DROP TABLE {};", name),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn pending_excludes_applied_and_keeps_order() {
        let files = vec![
            migration("20230101_000000", "users"),
            migration("20230102_000000", "posts"),
            migration("20230103_000000", "comments"),
        ];
        let applied: HashSet<String> = ["20230101_000000".to_string()].into_iter().collect();

        let pending = pending_migrations(&files, &applied);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].version, "20230102_000000");
        assert_eq!(pending[1].version, "20230103_000000");
    }

    #[test]
    fn nothing_pending_when_ledger_covers_all_files() {
        let files = vec![
            migration("20230101_000000", "users"),
            migration("20230102_000000", "posts"),
        ];
        let applied: HashSet<String> = files.iter().map(|m| m.version.clone()).collect();

        assert!(pending_migrations(&files, &applied).is_empty());
    }

    #[test]
    fn ghost_entries_do_not_block_planning() {
        // An applied version with no file is an anomaly, not a planning
        // failure: the pending set is unaffected.
        let files = vec![migration("20230102_000000", "posts")];
        let applied: HashSet<String> = ["20230101_000000".to_string()].into_iter().collect();

        let pending = pending_migrations(&files, &applied);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, "20230102_000000");
    }
}
