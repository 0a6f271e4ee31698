//! Migration Repository - File system operations for migrations
//!
//! Discovers migration files in one explicitly supplied directory, parses
//! version and name metadata out of filenames, and scaffolds new migration
//! files with collision-resistant version tokens.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::definitions::Migration;
use crate::error::{MigrateError, MigrateResult};

/// Filename timestamp format for version tokens
const VERSION_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Migration repository over one migrations directory
pub struct MigrationRepository {
    dir: PathBuf,
}

impl MigrationRepository {
    /// Create a repository over the given directory. The path is taken as-is;
    /// the repository never resolves directories from ambient state.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory this repository scans.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// List all migrations, ascending by version token.
    ///
    /// Two files sharing a version token sort by filename as a secondary key
    /// and are reported with a consistency warning; files whose names do not
    /// parse are skipped with a warning.
    pub fn list(&self) -> MigrateResult<Vec<Migration>> {
        if !self.dir.exists() {
            return Err(MigrateError::NotFound(self.dir.clone()));
        }

        let mut migrations = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "sql") {
                match parse_migration_file(&path)? {
                    Some(migration) => migrations.push(migration),
                    None => {
                        warn!(
                            path = %path.display(),
                            "skipping file that does not match <version>_<name>.sql"
                        );
                    }
                }
            }
        }

        migrations.sort_by(|a, b| (&a.version, &a.path).cmp(&(&b.version, &b.path)));

        for pair in migrations.windows(2) {
            if pair[0].version == pair[1].version {
                warn!(
                    version = %pair[0].version,
                    first = %pair[0].path.display(),
                    second = %pair[1].path.display(),
                    "two migration files share a version token; ordering by filename"
                );
            }
        }

        Ok(migrations)
    }

    /// Create a new scaffold migration file and return its filename.
    ///
    /// The version token is the current UTC time at second granularity; on
    /// collision with an existing token it is advanced by one second until
    /// unique, keeping tokens monotonic.
    pub fn create(&self, name: &str) -> MigrateResult<String> {
        if !self.dir.exists() {
            return Err(MigrateError::NotFound(self.dir.clone()));
        }

        let existing = self.list()?;
        let mut taken: HashMap<&str, &Path> = HashMap::new();
        for migration in &existing {
            if let Some(first) = taken.insert(&migration.version, &migration.path) {
                // Scaffolding on top of an ambiguous history would make the
                // new token's ordering undefined.
                return Err(MigrateError::DuplicateVersion {
                    version: migration.version.clone(),
                    first: first.display().to_string(),
                    second: migration.path.display().to_string(),
                });
            }
        }

        let version = next_version(Utc::now(), &existing);
        let slug = name.trim().replace(' ', "_").to_lowercase();
        let filename = format!("{}_{}.sql", version, slug);
        let filepath = self.dir.join(&filename);

        fs::write(&filepath, migration_template(name, &version))?;
        Ok(filename)
    }
}

/// Pick the first version token at or after `now` not already taken.
fn next_version(now: DateTime<Utc>, existing: &[Migration]) -> String {
    let mut at = now;
    loop {
        let token = at.format(VERSION_FORMAT).to_string();
        if !existing.iter().any(|m| m.version == token) {
            return token;
        }
        at = at + Duration::seconds(1);
    }
}

/// Parse a migration file into a Migration, or None if the filename does not
/// follow the `YYYYMMDD_HHMMSS_name.sql` convention.
fn parse_migration_file(path: &Path) -> MigrateResult<Option<Migration>> {
    let filename = match path.file_stem().and_then(|s| s.to_str()) {
        Some(stem) => stem,
        None => return Ok(None),
    };

    let parts: Vec<&str> = filename.split('_').collect();
    if parts.len() < 3 || parts[0].len() != 8 || parts[1].len() != 6 {
        return Ok(None);
    }

    let version = format!("{}_{}", parts[0], parts[1]);
    let created_at = match parse_version_timestamp(&version) {
        Some(ts) => ts,
        None => return Ok(None),
    };
    let name = parts[2..].join("_").replace('_', " ");

    let content = fs::read_to_string(path)?;
    let (up_sql, down_sql) = parse_migration_content(&content);

    Ok(Some(Migration {
        version,
        name,
        path: path.to_path_buf(),
        up_sql,
        down_sql,
        created_at,
    }))
}

/// Extract UP and DOWN SQL from a migration file's content.
fn parse_migration_content(content: &str) -> (String, String) {
    let mut up_sql = Vec::new();
    let mut down_sql = Vec::new();
    let mut current_section = "";

    for line in content.lines() {
        let trimmed = line.trim().to_lowercase();

        if trimmed.starts_with("-- up") || trimmed.contains("up migration") {
            current_section = "up";
            continue;
        } else if trimmed.starts_with("-- down") || trimmed.contains("down migration") {
            current_section = "down";
            continue;
        }

        // Skip comment lines and empty lines
        if line.trim().is_empty() || line.trim().starts_with("--") {
            continue;
        }

        match current_section {
            "up" => up_sql.push(line),
            "down" => down_sql.push(line),
            _ => {} // Before any section marker
        }
    }

    (
        up_sql.join("\n").trim().to_string(),
        down_sql.join("\n").trim().to_string(),
    )
}

/// Parse a `YYYYMMDD_HHMMSS` version token into its creation time.
fn parse_version_timestamp(version: &str) -> Option<DateTime<Utc>> {
    let compact = version.replace('_', "");
    let naive = NaiveDateTime::parse_from_str(&compact, "%Y%m%d%H%M%S").ok()?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// Scaffold template content
fn migration_template(name: &str, version: &str) -> String {
    format!(
        "-- Migration: {}\n\
         -- Version: {}\n\
         -- Created: {}\n\n\
         -- Up migration\n\n\n\
         -- Down migration\n\n",
        name,
        version,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )
}
