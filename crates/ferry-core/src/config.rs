//! Run configuration passed explicitly into each component.
//!
//! Every field has a default so a partial JSON document is enough:
//!
//! ```json
//! { "source_project": "OLD", "target_project": "NEW", "workers": 8 }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{FerryError, FerryResult};
use crate::guards::{
    clamp_int, clamp_page_size, clamp_sample_size, clamp_workers, DEFAULT_MAX_RETRIES,
    DEFAULT_PAGE_SIZE, DEFAULT_SAMPLE_SIZE, DEFAULT_WORKERS, MAX_BACKOFF_ATTEMPTS,
    MAX_BACKOFF_DELAY_MS,
};
use crate::mapping::{MappingResolver, MappingTable};
use crate::store::Ledger;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub source_project: String,
    pub target_project: String,
    pub ledger_path: PathBuf,
    pub mapping_path: Option<PathBuf>,
    pub workers: i64,
    pub page_size: i64,
    pub max_retries: i64,
    pub backoff: BackoffConfig,
    pub validation: ValidationConfig,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            source_project: String::new(),
            target_project: String::new(),
            ledger_path: PathBuf::from("data/ledger.sqlite3"),
            mapping_path: None,
            workers: DEFAULT_WORKERS,
            page_size: DEFAULT_PAGE_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

/// Exponential backoff for transient target errors within a single attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Calls per attempt, including the first (minimum 1).
    pub max_attempts: i64,
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl BackoffConfig {
    /// No sleeping between calls. Used by tests and dry rehearsals.
    pub fn immediate(max_attempts: i64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms.max(0) as u64)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(0) as u64)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentEquivalenceMode {
    #[default]
    Exact,
    NormalizedWhitespace,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Upper bound on entities inspected by mapping/content checks.
    /// `None` inspects every success record.
    pub sample_size: Option<i64>,
    pub content_equivalence: ContentEquivalenceMode,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            sample_size: Some(DEFAULT_SAMPLE_SIZE),
            content_equivalence: ContentEquivalenceMode::Exact,
        }
    }
}

impl FerryConfig {
    pub fn from_json_str(raw: &str) -> FerryResult<Self> {
        let config: FerryConfig = serde_json::from_str(raw)?;
        config.normalized()
    }

    pub fn from_path(path: &Path) -> FerryResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FerryError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Clamp numeric knobs into their guard ranges and reject configs that
    /// cannot drive a run.
    pub fn normalized(mut self) -> FerryResult<Self> {
        if self.max_retries < 1 {
            return Err(FerryError::Config(format!(
                "max_retries must be at least 1, got {}",
                self.max_retries
            )));
        }
        self.workers = clamp_workers(self.workers) as i64;
        self.page_size = clamp_page_size(self.page_size) as i64;
        self.backoff.max_attempts = clamp_int(self.backoff.max_attempts, 1, MAX_BACKOFF_ATTEMPTS);
        self.backoff.base_delay_ms = clamp_int(self.backoff.base_delay_ms, 0, MAX_BACKOFF_DELAY_MS);
        self.backoff.max_delay_ms = clamp_int(
            self.backoff.max_delay_ms,
            self.backoff.base_delay_ms,
            MAX_BACKOFF_DELAY_MS,
        );
        self.validation.sample_size = self
            .validation
            .sample_size
            .map(|n| clamp_sample_size(n) as i64);
        Ok(self)
    }

    pub fn worker_count(&self) -> usize {
        clamp_workers(self.workers)
    }

    pub fn page_len(&self) -> usize {
        clamp_page_size(self.page_size)
    }

    pub fn open_ledger(&self) -> FerryResult<Ledger> {
        Ledger::open(&self.ledger_path)
    }

    /// Load the mapping table named by `mapping_path`; without one, every
    /// category passes values through unchanged.
    pub fn load_mapping(&self) -> FerryResult<MappingResolver> {
        let table = match &self.mapping_path {
            Some(path) => MappingTable::from_path(path)?,
            None => MappingTable::default(),
        };
        Ok(MappingResolver::new(table))
    }
}
