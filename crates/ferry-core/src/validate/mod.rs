//! Post-migration validation.
//!
//! The validator never writes: it reads the ledger, the source, and the
//! target, re-derives expected target values with the same mapping table the
//! engine used, and reports divergences as [`ValidationFinding`]s.

pub mod compare;
pub mod sample;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::FerryConfig;
use crate::errors::{FerryError, FerryResult};
use crate::mapping::MappingResolver;
use crate::models::{
    content_digest, EntityKind, FindingCategory, MigrationRecord, Outcome, Severity, SourceEntity,
    TargetEntity, ValidationFinding,
};
use crate::repository::{SourceRepository, TargetRepository};
use crate::store::Ledger;

pub use compare::{equivalence_for, ContentEquivalence, ExactEquivalence, NormalizedWhitespace};

const ABSENT: &str = "<absent>";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationScope {
    Counts,
    Mappings,
    Content,
    Comments,
    Attachments,
    Full,
}

impl ValidationScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationScope::Counts => "counts",
            ValidationScope::Mappings => "mappings",
            ValidationScope::Content => "content",
            ValidationScope::Comments => "comments",
            ValidationScope::Attachments => "attachments",
            ValidationScope::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "counts" => Some(ValidationScope::Counts),
            "mappings" => Some(ValidationScope::Mappings),
            "content" => Some(ValidationScope::Content),
            "comments" => Some(ValidationScope::Comments),
            "attachments" => Some(ValidationScope::Attachments),
            "full" => Some(ValidationScope::Full),
            _ => None,
        }
    }

    /// Whether running `self` includes the checks of `part`.
    pub fn covers(self, part: ValidationScope) -> bool {
        self == ValidationScope::Full || self == part
    }
}

impl fmt::Display for ValidationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub scope: ValidationScope,
    pub findings: Vec<ValidationFinding>,
    pub summary: BTreeMap<FindingCategory, usize>,
    /// Success records inspected by the sampled mapping/content checks.
    pub inspected: usize,
}

impl ValidationReport {
    fn new(scope: ValidationScope) -> Self {
        Self {
            scope,
            findings: Vec::new(),
            summary: BTreeMap::new(),
            inspected: 0,
        }
    }

    fn push(&mut self, finding: ValidationFinding) {
        *self.summary.entry(finding.category).or_insert(0) += 1;
        self.findings.push(finding);
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn count(&self, category: FindingCategory) -> usize {
        self.summary.get(&category).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> FerryResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Source data read once per validation.
#[derive(Default)]
struct SourceSnapshot {
    issues: Vec<SourceEntity>,
    children: HashMap<EntityKind, HashMap<String, Vec<SourceEntity>>>,
}

impl SourceSnapshot {
    fn find(&self, kind: EntityKind, parent: Option<&str>, source_id: &str) -> Option<&SourceEntity> {
        match kind {
            EntityKind::Issue => self.issues.iter().find(|i| i.source_id == source_id),
            _ => self
                .children
                .get(&kind)?
                .get(parent?)?
                .iter()
                .find(|c| c.source_id == source_id),
        }
    }

    fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Issue => self.issues.len(),
            _ => self
                .children
                .get(&kind)
                .map(|by_parent| by_parent.values().map(Vec::len).sum())
                .unwrap_or(0),
        }
    }
}

pub struct Validator<'a> {
    config: &'a FerryConfig,
    ledger: &'a Ledger,
    resolver: &'a MappingResolver,
    source: &'a dyn SourceRepository,
    target: &'a dyn TargetRepository,
    equivalence: Box<dyn ContentEquivalence>,
}

impl<'a> Validator<'a> {
    pub fn new(
        config: &'a FerryConfig,
        ledger: &'a Ledger,
        resolver: &'a MappingResolver,
        source: &'a dyn SourceRepository,
        target: &'a dyn TargetRepository,
    ) -> Self {
        Self {
            config,
            ledger,
            resolver,
            source,
            target,
            equivalence: equivalence_for(config.validation.content_equivalence),
        }
    }

    pub fn with_equivalence(mut self, equivalence: Box<dyn ContentEquivalence>) -> Self {
        self.equivalence = equivalence;
        self
    }

    pub fn validate(&self, scope: ValidationScope) -> FerryResult<ValidationReport> {
        let mut report = ValidationReport::new(scope);
        let snapshot = self.snapshot(scope)?;

        if scope.covers(ValidationScope::Counts) {
            self.check_counts(&snapshot, &mut report)?;
        }
        let mappings = scope.covers(ValidationScope::Mappings);
        let content = scope.covers(ValidationScope::Content);
        if mappings || content {
            self.check_fields(&snapshot, mappings, content, &mut report)?;
        }
        for kind in [EntityKind::Comment, EntityKind::Attachment] {
            let part = match kind {
                EntityKind::Comment => ValidationScope::Comments,
                _ => ValidationScope::Attachments,
            };
            if scope.covers(part) {
                self.check_children(kind, &snapshot, &mut report)?;
            }
        }

        for finding in &report.findings {
            warn!(
                category = ?finding.category,
                kind = %finding.kind,
                source_id = finding.source_id.as_deref().unwrap_or(""),
                field = finding.field.as_deref().unwrap_or(""),
                expected = %finding.expected,
                observed = %finding.observed,
                "validation finding"
            );
        }
        info!(
            scope = %scope,
            findings = report.findings.len(),
            inspected = report.inspected,
            "validation finished"
        );
        Ok(report)
    }

    fn snapshot(&self, scope: ValidationScope) -> FerryResult<SourceSnapshot> {
        let project = self.config.source_project.as_str();
        let issues = self
            .source
            .list_all_issues(project, self.config.page_len())
            .map_err(|e| FerryError::SourceRead(format!("listing issues of {project}: {e}")))?;

        let needs_children = |kind: EntityKind| match scope {
            ValidationScope::Full
            | ValidationScope::Counts
            | ValidationScope::Mappings
            | ValidationScope::Content => true,
            ValidationScope::Comments => kind == EntityKind::Comment,
            ValidationScope::Attachments => kind == EntityKind::Attachment,
        };

        let mut snapshot = SourceSnapshot {
            issues,
            children: HashMap::new(),
        };
        for kind in [EntityKind::Comment, EntityKind::Attachment] {
            if !needs_children(kind) {
                continue;
            }
            let mut by_parent = HashMap::with_capacity(snapshot.issues.len());
            for issue in &snapshot.issues {
                let children = self
                    .source
                    .list_children(kind, &issue.source_id)
                    .map_err(|e| FerryError::SourceRead(format!("listing {kind}s of {}: {e}", issue.source_id)))?;
                by_parent.insert(issue.source_id.clone(), children);
            }
            snapshot.children.insert(kind, by_parent);
        }
        debug!(
            issues = snapshot.issues.len(),
            comments = snapshot.count(EntityKind::Comment),
            attachments = snapshot.count(EntityKind::Attachment),
            "source snapshot loaded"
        );
        Ok(snapshot)
    }

    fn check_counts(&self, snapshot: &SourceSnapshot, report: &mut ValidationReport) -> FerryResult<()> {
        for kind in EntityKind::ALL {
            let expected = snapshot.count(kind);
            let observed = self.ledger.count_by_outcome(kind, Outcome::Success)?.max(0) as usize;
            if expected != observed {
                report.push(ValidationFinding {
                    category: FindingCategory::CountMismatch,
                    kind,
                    source_id: None,
                    field: None,
                    expected: expected.to_string(),
                    observed: observed.to_string(),
                    severity: Severity::Error,
                });
            }
        }
        Ok(())
    }

    fn sample_size(&self) -> Option<usize> {
        self.config
            .validation
            .sample_size
            .map(crate::guards::clamp_sample_size)
    }

    fn check_fields(
        &self,
        snapshot: &SourceSnapshot,
        mappings: bool,
        content: bool,
        report: &mut ValidationReport,
    ) -> FerryResult<()> {
        for kind in EntityKind::ALL {
            let records = self.ledger.list_by_outcome(kind, Outcome::Success)?;
            for record in sample::sample_records(records, self.sample_size()) {
                let Some(entity) = snapshot.find(kind, record.parent_id.as_deref(), &record.source_id) else {
                    debug!(kind = %kind, source_id = %record.source_id, "source entity gone, left to count check");
                    continue;
                };
                report.inspected += 1;
                self.check_record(&record, entity, mappings, content, report)?;
            }
        }
        Ok(())
    }

    fn check_record(
        &self,
        record: &MigrationRecord,
        entity: &SourceEntity,
        mappings: bool,
        content: bool,
        report: &mut ValidationReport,
    ) -> FerryResult<()> {
        let kind = record.kind;
        let target_id = record.target_id.as_deref().unwrap_or("");
        let finding = |category: FindingCategory,
                       field: Option<&str>,
                       expected: String,
                       observed: String| ValidationFinding {
            category,
            kind,
            source_id: Some(record.source_id.clone()),
            field: field.map(str::to_string),
            expected,
            observed,
            severity: match category {
                FindingCategory::ContentMismatch => Severity::Warning,
                _ => Severity::Error,
            },
        };

        let target = self
            .target
            .fetch(kind, target_id)
            .map_err(|e| FerryError::TargetRead(format!("{kind} {target_id}: {e}")))?;
        let Some(target) = target else {
            report.push(finding(
                FindingCategory::MappingViolation,
                None,
                target_id.to_string(),
                ABSENT.to_string(),
            ));
            return Ok(());
        };

        let payload = match self.resolver.translate(entity) {
            Ok(payload) => payload,
            Err(unmapped) => {
                if mappings {
                    for err in unmapped {
                        let observed = render(target.fields.get(&err.field));
                        report.push(finding(
                            FindingCategory::MappingViolation,
                            Some(err.field.as_str()),
                            err.to_string(),
                            observed,
                        ));
                    }
                }
                return Ok(());
            }
        };

        for (field, expected) in &payload.fields {
            let observed = target.fields.get(field);
            if self.resolver.is_mapped_target_field(field) {
                if mappings && observed != Some(expected) {
                    report.push(finding(
                        FindingCategory::MappingViolation,
                        Some(field.as_str()),
                        render(Some(expected)),
                        render(observed),
                    ));
                }
            } else if content {
                let observed_value = observed.cloned().unwrap_or(Value::Null);
                if !self.equivalence.equivalent(expected, &observed_value) {
                    report.push(finding(
                        FindingCategory::ContentMismatch,
                        Some(field.as_str()),
                        render(Some(expected)),
                        render(observed),
                    ));
                }
            }
        }

        if content && kind == EntityKind::Attachment {
            self.check_attachment_bytes(entity, &target, report, &finding)?;
        }
        Ok(())
    }

    fn check_attachment_bytes(
        &self,
        entity: &SourceEntity,
        target: &TargetEntity,
        report: &mut ValidationReport,
        finding: &dyn Fn(FindingCategory, Option<&str>, String, String) -> ValidationFinding,
    ) -> FerryResult<()> {
        let (Some(observed), Some(payload_ref)) = (&target.content_digest, &entity.payload_ref) else {
            return Ok(());
        };
        let bytes = self
            .source
            .fetch_attachment_payload(payload_ref)
            .map_err(|e| FerryError::SourceRead(format!("fetching attachment {payload_ref}: {e}")))?;
        let expected = content_digest(&bytes);
        if &expected != observed {
            report.push(finding(
                FindingCategory::ContentMismatch,
                Some("content"),
                expected,
                observed.clone(),
            ));
        }
        Ok(())
    }

    /// Every source child of a migrated issue must itself hold a success record.
    fn check_children(
        &self,
        kind: EntityKind,
        snapshot: &SourceSnapshot,
        report: &mut ValidationReport,
    ) -> FerryResult<()> {
        let Some(category) = FindingCategory::missing_child(kind) else {
            return Ok(());
        };
        let Some(by_parent) = snapshot.children.get(&kind) else {
            return Ok(());
        };
        for issue in self.ledger.list_by_outcome(EntityKind::Issue, Outcome::Success)? {
            let Some(children) = by_parent.get(&issue.source_id) else {
                continue;
            };
            for child in children {
                let observed = match self.ledger.lookup(kind, &child.source_id)? {
                    Some(record) if record.outcome == Outcome::Success => continue,
                    Some(record) => record.outcome.as_str().to_string(),
                    None => ABSENT.to_string(),
                };
                report.push(ValidationFinding {
                    category,
                    kind,
                    source_id: Some(child.source_id.clone()),
                    field: None,
                    expected: Outcome::Success.as_str().to_string(),
                    observed,
                    severity: Severity::Error,
                });
            }
        }
        Ok(())
    }
}

fn render(value: Option<&Value>) -> String {
    match value {
        None => ABSENT.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
