//! Run-level retries of failed ledger entries.
//!
//! Selection is purely ledger-driven: `failed` records whose attempt count is
//! still below the cap. Each selected entity is re-fetched from the source so
//! fixes made there since the failure are picked up, then pushed through the
//! engine's single-entity path. A pass reads the source once: issues are
//! listed on first need and each parent's children are listed at most once.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::{EntityOutcome, MigrateOptions, MigrationEngine};
use crate::errors::{FerryError, FerryResult, RepositoryError};
use crate::models::{
    AttemptError, EntityKind, ErrorKind, KindSummary, MigrationRecord, Outcome, RunSummary,
    SourceEntity,
};
use crate::store::NewAttempt;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    pub kind: Option<EntityKind>,
    pub run_id: Option<i64>,
    /// Source IDs re-attempted in this pass.
    pub selected: Vec<String>,
    pub succeeded: usize,
    pub failed: usize,
    /// Source IDs left untouched because they reached the retry cap.
    pub exhausted: Vec<String>,
    /// Selected entries not attempted because the run was cancelled.
    pub not_started: usize,
}

pub struct RetryCoordinator<'e, 'a> {
    engine: &'e MigrationEngine<'a>,
}

impl<'e, 'a> RetryCoordinator<'e, 'a> {
    pub fn new(engine: &'e MigrationEngine<'a>) -> Self {
        Self { engine }
    }

    /// Retry every `failed` entry of `kind` with `attempt_count < max_retries`.
    pub fn retry(&self, kind: EntityKind, max_retries: i64) -> FerryResult<RetryReport> {
        if max_retries < 1 {
            return Err(FerryError::Config(format!(
                "max_retries must be at least 1, got {max_retries}"
            )));
        }
        let ledger = self.engine.ledger();
        let (selected, exhausted): (Vec<MigrationRecord>, Vec<MigrationRecord>) = ledger
            .list_by_outcome(kind, Outcome::Failed)?
            .into_iter()
            .partition(|record| record.attempt_count < max_retries);

        let mut report = RetryReport {
            kind: Some(kind),
            selected: selected.iter().map(|r| r.source_id.clone()).collect(),
            exhausted: exhausted.iter().map(|r| r.source_id.clone()).collect(),
            ..RetryReport::default()
        };
        for record in &exhausted {
            warn!(
                kind = %kind,
                source_id = %record.source_id,
                attempts = record.attempt_count,
                "retry budget exhausted"
            );
        }
        if selected.is_empty() {
            info!(kind = %kind, exhausted = report.exhausted.len(), "nothing to retry");
            return Ok(report);
        }

        let run_id = ledger.begin_run(&format!("retry:{kind}"), false)?;
        report.run_id = Some(run_id);
        let result = self.retry_selected(kind, &selected, run_id, &mut report);

        let kind_summary = KindSummary {
            success: report.succeeded,
            failed: report.failed,
            pending: report.not_started,
            ..KindSummary::default()
        };
        let mut summary = RunSummary {
            run_id: Some(run_id),
            cancelled: report.not_started > 0 || result.is_err(),
            ..RunSummary::default()
        };
        summary.merge_kind(kind, &kind_summary);
        ledger.finish_run(run_id, &summary)?;
        result?;

        info!(
            kind = %kind,
            run_id,
            selected = report.selected.len(),
            succeeded = kind_summary.success,
            failed = kind_summary.failed,
            exhausted = report.exhausted.len(),
            "retry pass finished"
        );
        Ok(report)
    }

    /// [`Self::retry`] with the configured `max_retries`.
    pub fn retry_configured(&self, kind: EntityKind) -> FerryResult<RetryReport> {
        self.retry(kind, self.engine.config().max_retries)
    }

    pub fn retry_all_configured(&self) -> FerryResult<Vec<RetryReport>> {
        self.retry_all(self.engine.config().max_retries)
    }

    /// Retry issues, then comments, then attachments, so children see parents
    /// fixed earlier in the same pass.
    pub fn retry_all(&self, max_retries: i64) -> FerryResult<Vec<RetryReport>> {
        let mut reports = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            if self.engine.cancel_token().is_cancelled() {
                break;
            }
            reports.push(self.retry(kind, max_retries)?);
        }
        Ok(reports)
    }

    fn retry_selected(
        &self,
        kind: EntityKind,
        selected: &[MigrationRecord],
        run_id: i64,
        report: &mut RetryReport,
    ) -> FerryResult<()> {
        let options = MigrateOptions::default();
        let ledger = self.engine.ledger();
        let mut snapshot = SourceSnapshot::default();

        for (idx, record) in selected.iter().enumerate() {
            if self.engine.cancel_token().is_cancelled() {
                report.not_started = selected.len() - idx;
                break;
            }
            let outcome = match self.refetch(record, &mut snapshot)? {
                Some(entity) => self.engine.migrate_one(&entity, &options, Some(run_id))?,
                None => {
                    let missing = NewAttempt::failed(
                        kind,
                        &record.source_id,
                        AttemptError::new(
                            ErrorKind::SourceEntityMissing,
                            format!("{kind} {} no longer exists in the source", record.source_id),
                        ),
                    )
                    .with_parent(record.parent_id.as_deref())
                    .in_run(Some(run_id));
                    EntityOutcome::Recorded {
                        record: ledger.record_attempt(&missing)?,
                        substituted: 0,
                    }
                }
            };
            match outcome {
                EntityOutcome::Recorded { record: updated, .. } => match updated.outcome {
                    Outcome::Success => report.succeeded += 1,
                    _ => report.failed += 1,
                },
                EntityOutcome::AlreadyMigrated => report.succeeded += 1,
                EntityOutcome::Previewed { .. }
                | EntityOutcome::Duplicate
                | EntityOutcome::NotStarted => {}
            }
        }
        Ok(())
    }

    fn refetch(
        &self,
        record: &MigrationRecord,
        snapshot: &mut SourceSnapshot,
    ) -> FerryResult<Option<SourceEntity>> {
        let source = self.engine.source();
        let read_err = |e: RepositoryError| {
            FerryError::SourceRead(format!(
                "re-fetching {} {}: {e}",
                record.kind, record.source_id
            ))
        };
        let listed = match record.kind {
            EntityKind::Issue => {
                if snapshot.issues.is_none() {
                    let config = self.engine.config();
                    let issues = source
                        .list_all_issues(&config.source_project, config.page_len())
                        .map_err(read_err)?;
                    snapshot.issues = Some(
                        issues
                            .into_iter()
                            .map(|issue| (issue.source_id.clone(), issue))
                            .collect(),
                    );
                }
                return Ok(snapshot
                    .issues
                    .as_ref()
                    .and_then(|issues| issues.get(&record.source_id).cloned()));
            }
            kind => {
                let Some(parent) = record.parent_id.as_deref() else {
                    return Ok(None);
                };
                let key = (kind, parent.to_string());
                if !snapshot.children.contains_key(&key) {
                    let children = source.list_children(kind, parent).map_err(read_err)?;
                    snapshot.children.insert(key.clone(), children);
                }
                &snapshot.children[&key]
            }
        };
        Ok(listed
            .iter()
            .find(|child| child.source_id == record.source_id)
            .cloned())
    }
}

/// Source data read during one retry pass.
#[derive(Default)]
struct SourceSnapshot {
    issues: Option<HashMap<String, SourceEntity>>,
    children: HashMap<(EntityKind, String), Vec<SourceEntity>>,
}
