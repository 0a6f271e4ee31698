//! Migration Executor - Transactional execution of single migrations
//!
//! Applies or reverts exactly one migration per call, inside one
//! transaction that also carries the matching ledger mutation. The
//! transaction is committed or rolled back before control returns, so the
//! ledger can never disagree with the schema.
//!
//! Cross-process exclusion: every transaction takes an advisory lock scoped
//! to the ledger table, then re-checks the ledger before running the up
//! transform. A second runner racing on the same pending migration blocks on
//! the lock, observes the version as taken, and skips. The ledger's primary
//! key backstops both.

use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::definitions::Migration;
use super::ledger::Ledger;
use crate::error::{MigrateError, MigrateResult};

/// What a single apply attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The up transform ran and the ledger entry was written
    Applied,
    /// Another process recorded the version first; nothing was changed
    AlreadyApplied,
}

/// Executes one migration at a time against the target database
///
/// The only component permitted to open write transactions against
/// migration-affected schema.
pub struct Executor {
    pool: PgPool,
    ledger: Ledger,
    timeout: Option<Duration>,
}

impl Executor {
    pub fn new(pool: PgPool, ledger: Ledger) -> Self {
        Self {
            pool,
            ledger,
            timeout: None,
        }
    }

    /// Set a per-migration deadline. On expiry the in-flight transaction is
    /// dropped, rolling back that migration's schema and ledger writes
    /// together.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Apply one migration and record it under the given batch.
    pub async fn apply(&self, migration: &Migration, batch: i32) -> MigrateResult<ApplyOutcome> {
        self.with_deadline(&migration.version, self.apply_tx(migration, batch))
            .await
    }

    /// Revert one migration and erase its ledger entry.
    pub async fn revert(&self, migration: &Migration) -> MigrateResult<()> {
        if !migration.is_reversible() {
            return Err(MigrateError::Irreversible {
                version: migration.version.clone(),
            });
        }

        self.with_deadline(&migration.version, self.revert_tx(migration))
            .await
    }

    async fn apply_tx(&self, migration: &Migration, batch: i32) -> MigrateResult<ApplyOutcome> {
        let mut tx = self.pool.begin().await?;
        self.lock_ledger(&mut tx).await?;

        if self.ledger.is_applied(&mut tx, &migration.version).await? {
            warn!(
                version = %migration.version,
                "version already recorded by another process, skipping"
            );
            tx.rollback().await?;
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        run_statements(&mut tx, &migration.version, &migration.up_sql).await?;
        self.ledger
            .record(&mut tx, &migration.version, &migration.name, batch)
            .await?;

        tx.commit()
            .await
            .map_err(|e| MigrateError::execution(&migration.version, e))?;
        debug!(version = %migration.version, batch, "migration applied");
        Ok(ApplyOutcome::Applied)
    }

    async fn revert_tx(&self, migration: &Migration) -> MigrateResult<()> {
        let mut tx = self.pool.begin().await?;
        self.lock_ledger(&mut tx).await?;

        run_statements(&mut tx, &migration.version, &migration.down_sql).await?;
        self.ledger.erase(&mut tx, &migration.version).await?;

        tx.commit()
            .await
            .map_err(|e| MigrateError::execution(&migration.version, e))?;
        debug!(version = %migration.version, "migration reverted");
        Ok(())
    }

    /// Advisory lock scoped to the ledger table, held until commit/rollback.
    async fn lock_ledger(&self, tx: &mut Transaction<'_, Postgres>) -> MigrateResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ledger_lock_key(self.ledger.table()))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn with_deadline<T, F>(&self, version: &str, work: F) -> MigrateResult<T>
    where
        F: Future<Output = MigrateResult<T>>,
    {
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                // Dropping the in-flight future drops its transaction,
                // which rolls back schema and ledger writes together.
                Err(_) => Err(MigrateError::Timeout {
                    version: version.to_string(),
                    seconds: limit.as_secs(),
                }),
            },
            None => work.await,
        }
    }
}

async fn run_statements(
    tx: &mut Transaction<'_, Postgres>,
    version: &str,
    sql: &str,
) -> MigrateResult<()> {
    if sql.trim().is_empty() {
        return Ok(());
    }

    for statement in split_statements(sql) {
        sqlx::query(&statement)
            .execute(&mut **tx)
            .await
            .map_err(|e| MigrateError::execution(version, e))?;
    }
    Ok(())
}

/// Split migration SQL into executable statements using proper SQL parsing,
/// falling back to naive semicolon splitting when the parser rejects the
/// input.
pub(crate) fn split_statements(sql: &str) -> Vec<String> {
    let dialect = GenericDialect {};
    match Parser::parse_sql(&dialect, sql) {
        Ok(parsed) => parsed.into_iter().map(|stmt| format!("{};", stmt)).collect(),
        Err(e) => {
            warn!("SQL parsing failed, using naive semicolon splitting: {}", e);
            sql.split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| format!("{};", s))
                .collect()
        }
    }
}

/// Stable 64-bit advisory lock key derived from the ledger table name.
///
/// FNV-1a rather than the std hasher so the key stays identical across
/// builds; concurrent runners from different binaries must agree on it.
pub(crate) fn ledger_lock_key(table: &str) -> i64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in table.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_multiple_statements() {
        let statements = split_statements(
            "CREATE TABLE users (id SERIAL PRIMARY KEY); CREATE INDEX users_id_idx ON users (id);",
        );
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE"));
        assert!(statements[1].contains("CREATE INDEX"));
        assert!(statements.iter().all(|s| s.ends_with(';')));
    }

    #[test]
    fn unparseable_sql_falls_back_to_semicolon_splitting() {
        let statements =
            split_statements("CREATE EXTENSION whatever !!; ALTER SYSTEM frobnicate !!");
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE EXTENSION"));
    }

    #[test]
    fn empty_input_yields_no_statements() {
        assert!(split_statements("").is_empty());
        assert!(split_statements("   \n  ").is_empty());
    }

    #[test]
    fn lock_key_is_stable_and_table_scoped() {
        let a = ledger_lock_key("terrace_migrations");
        let b = ledger_lock_key("terrace_migrations");
        let c = ledger_lock_key("other_ledger");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
