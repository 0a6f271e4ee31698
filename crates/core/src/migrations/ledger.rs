//! Applied-Migration Ledger
//!
//! Persistent record, inside the target database, of which migration
//! versions have been applied and in which batch. The ledger is the single
//! source of truth for "what has run"; the repository's filesystem view is
//! reconciled against it on every run.
//!
//! Mutations (`record`, `erase`) go through a caller-supplied open
//! transaction so the ledger write commits or rolls back together with the
//! schema change it records. The PRIMARY KEY on `version` doubles as the
//! unique-constraint guard against concurrent double-apply.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashSet;

use super::definitions::LedgerEntry;
use crate::error::{MigrateError, MigrateResult};

/// Applied-migration ledger over one table in the target database
#[derive(Clone)]
pub struct Ledger {
    pool: PgPool,
    table: String,
}

impl Ledger {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// The ledger's backing table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Idempotently create the ledger's backing table.
    ///
    /// `CREATE TABLE IF NOT EXISTS` is resolved by the database itself, so
    /// concurrent callers from multiple processes are safe.
    pub async fn ensure_storage(&self) -> MigrateResult<()> {
        sqlx::query(&create_table_sql(&self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The set of applied version tokens.
    pub async fn applied_versions(&self) -> MigrateResult<HashSet<String>> {
        let rows = sqlx::query(&select_versions_sql(&self.table))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row.try_get("version").map_err(MigrateError::from))
            .collect()
    }

    /// All ledger entries, most recently applied first (batch desc, version desc).
    pub async fn entries(&self) -> MigrateResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(&select_entries_sql(&self.table))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_entry).collect()
    }

    /// Entries of one batch, version descending.
    pub async fn entries_in_batch(&self, batch: i32) -> MigrateResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(&select_batch_sql(&self.table))
            .bind(batch)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_entry).collect()
    }

    /// The highest existing batch number, 0 when the ledger is empty.
    pub async fn latest_batch(&self) -> MigrateResult<i32> {
        let row = sqlx::query(&select_latest_batch_sql(&self.table))
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get(0).unwrap_or(0))
    }

    /// Whether a version is recorded, checked inside the given transaction.
    pub async fn is_applied(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        version: &str,
    ) -> MigrateResult<bool> {
        let row = sqlx::query(&select_version_sql(&self.table))
            .bind(version)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(row.is_some())
    }

    /// Record a version as applied, inside the caller's transaction.
    pub async fn record(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        version: &str,
        name: &str,
        batch: i32,
    ) -> MigrateResult<()> {
        sqlx::query(&insert_entry_sql(&self.table))
            .bind(version)
            .bind(name)
            .bind(batch)
            .bind(Utc::now())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Erase a version's entry, inside the caller's transaction.
    pub async fn erase(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        version: &str,
    ) -> MigrateResult<()> {
        sqlx::query(&delete_entry_sql(&self.table))
            .bind(version)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

fn row_to_entry(row: &sqlx::postgres::PgRow) -> MigrateResult<LedgerEntry> {
    let version: String = row.try_get("version")?;
    let name: String = row.try_get("name")?;
    let batch: i32 = row.try_get("batch")?;
    let applied_at: DateTime<Utc> = row.try_get("applied_at")?;

    Ok(LedgerEntry {
        version,
        name,
        batch,
        applied_at,
    })
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    \
            version VARCHAR(255) PRIMARY KEY,\n    \
            name VARCHAR(255) NOT NULL,\n    \
            batch INTEGER NOT NULL,\n    \
            applied_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP\n\
        );",
        table
    )
}

fn select_versions_sql(table: &str) -> String {
    format!("SELECT version FROM {}", table)
}

fn select_version_sql(table: &str) -> String {
    format!("SELECT version FROM {} WHERE version = $1", table)
}

fn select_entries_sql(table: &str) -> String {
    format!(
        "SELECT version, name, batch, applied_at FROM {} ORDER BY batch DESC, version DESC",
        table
    )
}

fn select_batch_sql(table: &str) -> String {
    format!(
        "SELECT version, name, batch, applied_at FROM {} WHERE batch = $1 ORDER BY version DESC",
        table
    )
}

fn select_latest_batch_sql(table: &str) -> String {
    format!("SELECT COALESCE(MAX(batch), 0) FROM {}", table)
}

fn insert_entry_sql(table: &str) -> String {
    format!(
        "INSERT INTO {} (version, name, batch, applied_at) VALUES ($1, $2, $3, $4)",
        table
    )
}

fn delete_entry_sql(table: &str) -> String {
    format!("DELETE FROM {} WHERE version = $1", table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_sql_is_idempotent_and_keyed_by_version() {
        let sql = create_table_sql("terrace_migrations");
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS terrace_migrations"));
        assert!(sql.contains("version VARCHAR(255) PRIMARY KEY"));
        assert!(sql.contains("batch INTEGER NOT NULL"));
        assert!(sql.contains("applied_at TIMESTAMPTZ NOT NULL"));
    }

    #[test]
    fn mutation_sql_targets_a_single_version() {
        let insert = insert_entry_sql("terrace_migrations");
        assert!(insert.contains("INSERT INTO terrace_migrations"));
        assert!(insert.contains("(version, name, batch, applied_at)"));

        let delete = delete_entry_sql("terrace_migrations");
        assert_eq!(
            delete,
            "DELETE FROM terrace_migrations WHERE version = $1"
        );
    }

    #[test]
    fn read_sql_orders_most_recent_first() {
        let entries = select_entries_sql("terrace_migrations");
        assert!(entries.contains("ORDER BY batch DESC, version DESC"));

        let batch = select_batch_sql("terrace_migrations");
        assert!(batch.contains("WHERE batch = $1"));
        assert!(batch.contains("ORDER BY version DESC"));

        let latest = select_latest_batch_sql("terrace_migrations");
        assert!(latest.contains("COALESCE(MAX(batch), 0)"));
    }

    #[test]
    fn table_name_flows_through_every_statement() {
        for sql in [
            create_table_sql("custom_ledger"),
            select_versions_sql("custom_ledger"),
            select_version_sql("custom_ledger"),
            select_entries_sql("custom_ledger"),
            select_batch_sql("custom_ledger"),
            select_latest_batch_sql("custom_ledger"),
            insert_entry_sql("custom_ledger"),
            delete_entry_sql("custom_ledger"),
        ] {
            assert!(sql.contains("custom_ledger"), "missing table in: {}", sql);
        }
    }
}
