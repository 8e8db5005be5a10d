//! Shared typed models used across the mapping, ledger, engine, and validation layers.

use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::guards::truncate_message;

// ---------------------------------------------------------------------------
// Entity kinds
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Issue,
    Comment,
    Attachment,
}

impl EntityKind {
    /// Parent-first processing order.
    pub const ALL: [EntityKind; 3] = [EntityKind::Issue, EntityKind::Comment, EntityKind::Attachment];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Issue => "issue",
            EntityKind::Comment => "comment",
            EntityKind::Attachment => "attachment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "issue" => Some(EntityKind::Issue),
            "comment" => Some(EntityKind::Comment),
            "attachment" => Some(EntityKind::Attachment),
            _ => None,
        }
    }

    /// Kind whose ledger record must reach success before this kind can be created.
    pub fn parent_kind(self) -> Option<EntityKind> {
        match self {
            EntityKind::Issue => None,
            EntityKind::Comment | EntityKind::Attachment => Some(EntityKind::Issue),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Source entities and target payloads
// ---------------------------------------------------------------------------

/// One record fetched from the source tracker. Immutable for the rest of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceEntity {
    pub kind: EntityKind,
    pub source_id: String,
    /// Source ID of the owning issue for comments and attachments.
    pub parent_id: Option<String>,
    pub fields: IndexMap<String, Value>,
    /// Download handle for attachment bytes; fetched on demand.
    pub payload_ref: Option<String>,
}

impl SourceEntity {
    pub fn issue(source_id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Issue,
            source_id: source_id.into(),
            parent_id: None,
            fields: IndexMap::new(),
            payload_ref: None,
        }
    }

    pub fn comment(parent_id: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Comment,
            source_id: source_id.into(),
            parent_id: Some(parent_id.into()),
            fields: IndexMap::new(),
            payload_ref: None,
        }
    }

    pub fn attachment(
        parent_id: impl Into<String>,
        source_id: impl Into<String>,
        payload_ref: impl Into<String>,
    ) -> Self {
        Self {
            kind: EntityKind::Attachment,
            source_id: source_id.into(),
            parent_id: Some(parent_id.into()),
            fields: IndexMap::new(),
            payload_ref: Some(payload_ref.into()),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn key(&self) -> (EntityKind, &str) {
        (self.kind, self.source_id.as_str())
    }
}

/// Target-compatible record produced by the mapping resolver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetPayload {
    pub kind: EntityKind,
    pub fields: IndexMap<String, Value>,
    pub payload_ref: Option<String>,
}

impl TargetPayload {
    /// SHA-256 hex digest of the canonical JSON encoding. Field order is the
    /// resolver's insertion order, so equal translations hash equally.
    pub fn digest(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        format!("{:x}", hasher.finalize())
    }
}

/// Entity as read back from the target tracker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetEntity {
    pub kind: EntityKind,
    pub target_id: String,
    pub fields: IndexMap<String, Value>,
    /// SHA-256 hex digest of uploaded attachment bytes, when the tracker reports one.
    pub content_digest: Option<String>,
}

/// SHA-256 hex digest of raw attachment bytes.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Ledger state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Success => "success",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Outcome::Pending),
            "success" => Some(Outcome::Success),
            "failed" => Some(Outcome::Failed),
            "skipped" => Some(Outcome::Skipped),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnmappedValue,
    ParentNotMigrated,
    TransientRepository,
    PermanentRepository,
    SourceEntityMissing,
    DryRun,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnmappedValue => "unmapped_value",
            ErrorKind::ParentNotMigrated => "parent_not_migrated",
            ErrorKind::TransientRepository => "transient_repository",
            ErrorKind::PermanentRepository => "permanent_repository",
            ErrorKind::SourceEntityMissing => "source_entity_missing",
            ErrorKind::DryRun => "dry_run",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unmapped_value" => Some(ErrorKind::UnmappedValue),
            "parent_not_migrated" => Some(ErrorKind::ParentNotMigrated),
            "transient_repository" => Some(ErrorKind::TransientRepository),
            "permanent_repository" => Some(ErrorKind::PermanentRepository),
            "source_entity_missing" => Some(ErrorKind::SourceEntityMissing),
            "dry_run" => Some(ErrorKind::DryRun),
            _ => None,
        }
    }
}

/// Structured error stored with a ledger attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: ErrorKind, message: impl AsRef<str>) -> Self {
        Self {
            kind,
            message: truncate_message(message.as_ref()),
        }
    }
}

/// Latest state for one `(kind, source_id)` key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub kind: EntityKind,
    pub source_id: String,
    pub parent_id: Option<String>,
    pub target_id: Option<String>,
    pub outcome: Outcome,
    pub attempt_count: i64,
    pub last_error: Option<AttemptError>,
    pub first_attempt_at: Option<String>,
    pub last_attempt_at: Option<String>,
}

/// One row of the append-only attempt history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptEntry {
    pub attempt_no: i64,
    pub outcome: Outcome,
    pub target_id: Option<String>,
    pub error: Option<AttemptError>,
    pub payload_digest: Option<String>,
    pub run_id: Option<i64>,
    pub attempted_at: String,
}

// ---------------------------------------------------------------------------
// Validation findings
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingCategory {
    CountMismatch,
    MappingViolation,
    ContentMismatch,
    MissingComment,
    MissingAttachment,
}

impl FindingCategory {
    pub fn missing_child(kind: EntityKind) -> Option<Self> {
        match kind {
            EntityKind::Comment => Some(FindingCategory::MissingComment),
            EntityKind::Attachment => Some(FindingCategory::MissingAttachment),
            EntityKind::Issue => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub category: FindingCategory,
    pub kind: EntityKind,
    pub source_id: Option<String>,
    pub field: Option<String>,
    pub expected: String,
    pub observed: String,
    pub severity: Severity,
}

// ---------------------------------------------------------------------------
// Run summaries
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSummary {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Entities skipped because the ledger already held a success record.
    pub already_migrated: usize,
    /// Entities left unstarted by a cancelled run.
    pub pending: usize,
    /// Source values replaced by a category fallback.
    #[serde(default)]
    pub substituted: usize,
}

impl KindSummary {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Pending => self.pending += 1,
        }
    }

    pub fn merge(&mut self, other: &KindSummary) {
        self.success += other.success;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.already_migrated += other.already_migrated;
        self.pending += other.pending;
        self.substituted += other.substituted;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Option<i64>,
    pub kinds: BTreeMap<EntityKind, KindSummary>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn kind(&self, kind: EntityKind) -> KindSummary {
        self.kinds.get(&kind).cloned().unwrap_or_default()
    }

    pub fn merge_kind(&mut self, kind: EntityKind, summary: &KindSummary) {
        self.kinds.entry(kind).or_default().merge(summary);
    }

    pub fn total_failed(&self) -> usize {
        self.kinds.values().map(|k| k.failed).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_and_outcome_round_trip_through_strings() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(Outcome::parse("failed"), Some(Outcome::Failed));
        assert_eq!(ErrorKind::parse("parent_not_migrated"), Some(ErrorKind::ParentNotMigrated));
        assert_eq!(EntityKind::parse("epic"), None);
    }

    #[test]
    fn payload_digest_is_stable_and_order_sensitive() {
        let mut a = TargetPayload {
            kind: EntityKind::Issue,
            fields: IndexMap::new(),
            payload_ref: None,
        };
        a.fields.insert("summary".into(), json!("Login broken"));
        a.fields.insert("status".into(), json!("Open"));
        let b = a.clone();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let mut c = a.clone();
        c.fields.insert("status".into(), json!("Closed"));
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn attempt_error_truncates_long_messages() {
        let err = AttemptError::new(ErrorKind::PermanentRepository, "x".repeat(2_000));
        assert_eq!(err.message.len(), crate::guards::MAX_ERROR_MESSAGE_LEN);
    }

    #[test]
    fn summary_merges_per_kind() {
        let mut summary = RunSummary::default();
        let mut issues = KindSummary::default();
        issues.record(Outcome::Success);
        issues.record(Outcome::Failed);
        summary.merge_kind(EntityKind::Issue, &issues);
        summary.merge_kind(EntityKind::Issue, &issues);
        assert_eq!(summary.kind(EntityKind::Issue).success, 2);
        assert_eq!(summary.total_failed(), 2);
        assert_eq!(summary.kind(EntityKind::Comment), KindSummary::default());
    }
}
