//! Error types for the ferry core library.

use serde::{Deserialize, Serialize};

use crate::mapping::FieldCategory;

/// Top-level error enum for the ferry core library.
///
/// Only run-level failures live here. Per-entity failures are recorded in the
/// ledger as [`crate::models::AttemptError`] values and never abort a batch.
#[derive(Debug, thiserror::Error)]
pub enum FerryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source repository read failed: {0}")]
    SourceRead(String),

    #[error("Target repository read failed: {0}")]
    TargetRead(String),

    #[error("Ledger write failed: {0}")]
    LedgerWrite(String),

    #[error("Invalid ledger record: {0}")]
    InvalidRecord(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type FerryResult<T> = Result<T, FerryError>;

/// Whether a repository failure is worth retrying with backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network failure, timeout, rate limit.
    Transient,
    /// Validation rejection, conflict, missing permission.
    Permanent,
}

/// Failure reported by a source or target repository.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class:?} repository error: {message}")]
pub struct RepositoryError {
    pub class: ErrorClass,
    pub message: String,
}

impl RepositoryError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

pub type RepoResult<T> = Result<T, RepositoryError>;

impl From<RepositoryError> for FerryError {
    fn from(err: RepositoryError) -> FerryError {
        FerryError::SourceRead(err.to_string())
    }
}

/// A source value with no rule in its category under the `fail` policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no {} mapping for value {:?} (field {})", .category.as_str(), .value, .field)]
pub struct UnmappedValue {
    pub category: FieldCategory,
    pub field: String,
    pub value: String,
}
