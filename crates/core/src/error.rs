//! Error types for the migration engine
//!
//! Every variant that concerns a single migration carries that migration's
//! version token, so callers can report which migration failed without
//! inspecting the ledger.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Error types for migration operations
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Bad or missing environment configuration. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A required directory or file does not exist
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Two migration files resolve to the same version token
    #[error("duplicate migration version {version}: {first} and {second}")]
    DuplicateVersion {
        version: String,
        first: String,
        second: String,
    },

    /// A migration's up or down transform failed; its transaction was rolled back
    #[error("migration {version} failed: {message}")]
    Execution { version: String, message: String },

    /// Rollback was attempted on a migration without a down transform
    #[error("migration {version} has no down transform and cannot be reverted")]
    Irreversible { version: String },

    /// A migration exceeded its deadline; the in-flight transaction was rolled back
    #[error("migration {version} exceeded the {seconds}s deadline and was rolled back")]
    Timeout { version: String, seconds: u64 },

    /// Filesystem error while reading or writing migration files
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error outside the scope of a single migration's transform
    #[error("database error: {0}")]
    Database(String),
}

impl MigrateError {
    /// Build an execution error for a specific migration.
    pub fn execution(version: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MigrateError::Execution {
            version: version.into(),
            message: message.to_string(),
        }
    }

    /// The version this error concerns, when it concerns a single migration.
    pub fn version(&self) -> Option<&str> {
        match self {
            MigrateError::Execution { version, .. }
            | MigrateError::Irreversible { version }
            | MigrateError::Timeout { version, .. } => Some(version),
            MigrateError::DuplicateVersion { version, .. } => Some(version),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        MigrateError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_errors_carry_the_version() {
        let err = MigrateError::execution("20240101_120000", "relation does not exist");
        assert_eq!(err.version(), Some("20240101_120000"));
        assert!(err.to_string().contains("20240101_120000"));
        assert!(err.to_string().contains("relation does not exist"));
    }

    #[test]
    fn infrastructure_errors_have_no_version() {
        let err = MigrateError::Configuration("missing url".to_string());
        assert_eq!(err.version(), None);

        let err = MigrateError::NotFound(PathBuf::from("migrations"));
        assert_eq!(err.version(), None);
        assert!(err.to_string().contains("migrations"));
    }

    #[test]
    fn irreversible_error_names_the_migration() {
        let err = MigrateError::Irreversible {
            version: "20240101_120000".to_string(),
        };
        assert!(err.to_string().contains("no down transform"));
        assert_eq!(err.version(), Some("20240101_120000"));
    }
}
