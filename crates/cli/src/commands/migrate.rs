use std::fs;
use std::path::Path;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use terrace_core::migrations::{MigrationStatus, RunOutcome, RunResult, Runner, StepStatus};
use terrace_core::{MigrateError, MigrateResult, MigrationRepository, TerraceConfig};

/// Scaffold a new migration file. Filesystem-only; never touches the database.
pub fn create(config_path: &Path, name: &str) -> MigrateResult<()> {
    let config = TerraceConfig::load(config_path)?;

    // Directory creation is the host's job; the repository itself insists
    // on an existing path.
    fs::create_dir_all(&config.migrations_dir)?;

    let repository = MigrationRepository::new(&config.migrations_dir);
    let filename = repository.create(name)?;

    println!(
        "Created migration: {}",
        config.migrations_dir.join(filename).display()
    );
    Ok(())
}

/// Apply the next pending migration.
pub async fn up(config_path: &Path, environment: &str) -> MigrateResult<()> {
    let config = TerraceConfig::load(config_path)?;
    let (pool, runner) = connect(&config, environment).await?;

    let result = runner.up().await;
    close(pool).await;

    report_applies(result?)
}

/// Apply all pending migrations as one batch.
pub async fn latest(config_path: &Path, environment: &str) -> MigrateResult<()> {
    let config = TerraceConfig::load(config_path)?;
    let (pool, runner) = connect(&config, environment).await?;

    let result = runner.latest().await;
    close(pool).await;

    report_applies(result?)
}

/// Rollback the most recent batch, or everything with `all`.
pub async fn rollback(config_path: &Path, environment: &str, all: bool) -> MigrateResult<()> {
    let config = TerraceConfig::load(config_path)?;
    let (pool, runner) = connect(&config, environment).await?;

    let result = if all {
        runner.rollback_all().await
    } else {
        runner.rollback().await
    };
    close(pool).await;

    report_reverts(result?)
}

/// Show applied and pending migrations, plus ghost ledger entries.
pub async fn status(config_path: &Path, environment: &str, json: bool) -> MigrateResult<()> {
    let config = TerraceConfig::load(config_path)?;
    let (pool, runner) = connect(&config, environment).await?;

    let report = runner.status().await;
    close(pool).await;
    let report = report?;

    if json {
        let rendered = serde_json::to_string_pretty(&report)
            .map_err(|e| MigrateError::Configuration(format!("failed to render status: {}", e)))?;
        println!("{}", rendered);
        return Ok(());
    }

    println!("Migration Status:");
    println!("================");

    if report.rows.is_empty() {
        println!("No migrations found");
    }

    for (migration, status) in &report.rows {
        match status {
            MigrationStatus::Applied { batch, applied_at } => {
                println!(
                    "  [x] {} {} (batch {}, applied {})",
                    migration.version,
                    migration.name,
                    batch,
                    applied_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            MigrationStatus::Pending => {
                println!("  [ ] {} {}", migration.version, migration.name);
            }
        }
    }

    if !report.ghosts.is_empty() {
        println!();
        println!("Ledger entries without a migration file:");
        for entry in &report.ghosts {
            println!("  [?] {} {} (batch {})", entry.version, entry.name, entry.batch);
        }
    }

    Ok(())
}

/// Resolve the environment, open a pool, and wire a runner to it.
async fn connect(config: &TerraceConfig, environment: &str) -> MigrateResult<(PgPool, Runner)> {
    let env = config.environment(environment)?;
    tracing::info!(environment, url = %env.masked_url(), "connecting");

    let pool = PgPoolOptions::new()
        .max_connections(env.max_connections)
        .connect(&env.url)
        .await
        .map_err(|e| {
            MigrateError::Configuration(format!(
                "failed to connect to '{}': {}",
                env.masked_url(),
                e
            ))
        })?;

    let mut runner = Runner::with_pool(
        pool.clone(),
        config.migrations_dir.clone(),
        config.ledger_table.clone(),
    );
    if let Some(seconds) = env.migration_timeout_secs {
        runner = runner.with_timeout(Duration::from_secs(seconds));
    }

    Ok((pool, runner))
}

async fn close(pool: PgPool) {
    pool.close().await;
    tracing::info!("connection closed");
}

fn report_applies(result: RunResult) -> MigrateResult<()> {
    print_steps(&result);

    match result.outcome {
        RunOutcome::Completed if result.steps.is_empty() => {
            println!("Already up to date");
            Ok(())
        }
        RunOutcome::Completed => {
            let applied = count(&result, StepStatus::Applied);
            let skipped = count(&result, StepStatus::Skipped);
            match result.batch {
                Some(batch) => println!("Batch {}: {} migration(s) applied", batch, applied),
                None => println!("{} migration(s) applied", applied),
            }
            if skipped > 0 {
                println!("{} migration(s) skipped (taken by another process)", skipped);
            }
            Ok(())
        }
        RunOutcome::Failed => fail(result),
    }
}

fn report_reverts(result: RunResult) -> MigrateResult<()> {
    print_steps(&result);

    match result.outcome {
        RunOutcome::Completed if result.steps.is_empty() => {
            println!("Nothing to rollback");
            Ok(())
        }
        RunOutcome::Completed => {
            println!(
                "{} migration(s) rolled back",
                count(&result, StepStatus::Reverted)
            );
            Ok(())
        }
        RunOutcome::Failed => fail(result),
    }
}

fn print_steps(result: &RunResult) {
    for step in &result.steps {
        println!("  {} {}", step.version, step.status);
    }
}

fn count(result: &RunResult, status: StepStatus) -> usize {
    result.steps.iter().filter(|s| s.status == status).count()
}

/// Report the database's true state, then surface the terminal error.
fn fail(result: RunResult) -> MigrateResult<()> {
    if let Some(version) = result.last_completed() {
        println!("Last completed migration: {}", version);
    }
    if let Some(version) = result.first_failed() {
        println!("First failed migration: {}", version);
    }

    let fallback = MigrateError::execution(
        result.first_failed().unwrap_or("unknown"),
        "run halted without error detail",
    );
    Err(result.error.unwrap_or(fallback))
}
