//! Migration engine: per-entity translate/create/record path and batch
//! scheduling over a rayon worker pool.

use std::collections::HashSet;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::cancel::CancelToken;
use crate::config::FerryConfig;
use crate::errors::{ErrorClass, FerryError, FerryResult, RepositoryError};
use crate::mapping::MappingResolver;
use crate::models::{
    AttemptError, EntityKind, ErrorKind, KindSummary, MigrationRecord, Outcome, RunSummary,
    SourceEntity, TargetPayload,
};
use crate::repository::{SourceRepository, TargetRepository};
use crate::store::{Ledger, NewAttempt};

/// Per-call switches for `migrate`, `migrate_project`, and retries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrateOptions {
    /// Translate and record `skipped`, never write to the target.
    pub dry_run: bool,
    /// Maximum number of entities (issues, for `migrate_project`) to take.
    pub limit: Option<usize>,
    /// Entities (issues, for `migrate_project`) to skip before taking `limit`.
    pub offset: usize,
    /// Reprocess keys that already hold a success record.
    pub force: bool,
    /// Kinds `migrate_project` processes. Empty means all three.
    pub kinds: Vec<EntityKind>,
}

impl MigrateOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn includes(&self, kind: EntityKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// What happened to one delivered entity.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityOutcome {
    /// An attempt was recorded in the ledger. `substituted` counts fallback
    /// values in the translated payload.
    Recorded {
        record: MigrationRecord,
        substituted: usize,
    },
    /// A dry run evaluated the entity but left its `failed` record as is, so
    /// it stays eligible for retry.
    Previewed { substituted: usize },
    /// The ledger already held a success record; nothing was written.
    AlreadyMigrated,
    /// Another worker held the key; this copy was dropped.
    Duplicate,
    /// The run was cancelled before this entity started.
    NotStarted,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchReport {
    pub kind: Option<EntityKind>,
    pub run_id: Option<i64>,
    pub summary: KindSummary,
    /// Source ID and last error of every entity recorded as failed.
    pub failures: Vec<(String, AttemptError)>,
    pub cancelled: bool,
}

/// Releases an in-flight claim when the attempt finishes, even on error.
struct InFlightClaim<'e> {
    set: &'e Mutex<HashSet<(EntityKind, String)>>,
    key: (EntityKind, String),
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

pub struct MigrationEngine<'a> {
    config: &'a FerryConfig,
    ledger: &'a Ledger,
    resolver: &'a MappingResolver,
    source: &'a dyn SourceRepository,
    target: &'a dyn TargetRepository,
    backoff: BackoffPolicy,
    cancel: CancelToken,
    in_flight: Mutex<HashSet<(EntityKind, String)>>,
}

impl<'a> MigrationEngine<'a> {
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
            backoff: BackoffPolicy::from_config(&config.backoff),
            cancel: CancelToken::new(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn config(&self) -> &FerryConfig {
        self.config
    }

    pub fn ledger(&self) -> &Ledger {
        self.ledger
    }

    pub fn resolver(&self) -> &MappingResolver {
        self.resolver
    }

    pub fn source(&self) -> &dyn SourceRepository {
        self.source
    }

    pub fn target(&self) -> &dyn TargetRepository {
        self.target
    }

    // -----------------------------------------------------------------------
    // Public entry points
    // -----------------------------------------------------------------------

    /// Migrate one kind's entities in delivery order, windowed by
    /// `options.offset`/`options.limit`. Opens and closes its own run record.
    pub fn migrate(
        &self,
        kind: EntityKind,
        entities: &[SourceEntity],
        options: &MigrateOptions,
    ) -> FerryResult<BatchReport> {
        let window: Vec<SourceEntity> = entities
            .iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        let run_id = self
            .ledger
            .begin_run(&format!("migrate:{kind}"), options.dry_run)?;
        let result = self.run_batch(kind, &window, options, Some(run_id));
        let mut summary = RunSummary {
            run_id: Some(run_id),
            ..RunSummary::default()
        };
        match result {
            Ok(mut report) => {
                summary.merge_kind(kind, &report.summary);
                summary.cancelled = report.cancelled;
                self.ledger.finish_run(run_id, &summary)?;
                report.run_id = Some(run_id);
                Ok(report)
            }
            Err(err) => {
                summary.cancelled = true;
                if let Err(finish_err) = self.ledger.finish_run(run_id, &summary) {
                    warn!(run_id, error = %finish_err, "could not close aborted run");
                }
                Err(err)
            }
        }
    }

    /// Page the source project's issues (windowed by offset/limit), migrate
    /// them, then migrate the comments and attachments of those issues.
    pub fn migrate_project(&self, options: &MigrateOptions) -> FerryResult<RunSummary> {
        let project = self.config.source_project.as_str();
        let run_id = self
            .ledger
            .begin_run(&format!("project:{project}"), options.dry_run)?;
        let mut summary = RunSummary {
            run_id: Some(run_id),
            ..RunSummary::default()
        };

        let outcome = self.migrate_project_kinds(project, options, run_id, &mut summary);
        if let Err(err) = &outcome {
            summary.cancelled = true;
            warn!(run_id, error = %err, "project run aborted");
        }
        self.ledger.finish_run(run_id, &summary)?;
        outcome?;

        info!(
            run_id,
            failed = summary.total_failed(),
            cancelled = summary.cancelled,
            "project run finished"
        );
        Ok(summary)
    }

    fn migrate_project_kinds(
        &self,
        project: &str,
        options: &MigrateOptions,
        run_id: i64,
        summary: &mut RunSummary,
    ) -> FerryResult<()> {
        let issues = self.fetch_issue_window(project, options.offset, options.limit)?;
        info!(project, issues = issues.len(), "fetched issue window");

        if options.includes(EntityKind::Issue) {
            let report = self.run_batch(EntityKind::Issue, &issues, options, Some(run_id))?;
            summary.merge_kind(EntityKind::Issue, &report.summary);
            if report.cancelled {
                summary.cancelled = true;
                return Ok(());
            }
        }

        for kind in [EntityKind::Comment, EntityKind::Attachment] {
            if !options.includes(kind) {
                continue;
            }
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(());
            }
            let mut children = Vec::new();
            for issue in &issues {
                let listed = self
                    .source
                    .list_children(kind, &issue.source_id)
                    .map_err(|e| FerryError::SourceRead(format!("listing {kind}s of {}: {e}", issue.source_id)))?;
                children.extend(listed);
            }
            let report = self.run_batch(kind, &children, options, Some(run_id))?;
            summary.merge_kind(kind, &report.summary);
            if report.cancelled {
                summary.cancelled = true;
                return Ok(());
            }
        }
        Ok(())
    }

    fn fetch_issue_window(
        &self,
        project: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> FerryResult<Vec<SourceEntity>> {
        let page_size = self.config.page_len();
        let wanted = limit.unwrap_or(usize::MAX);
        let mut issues = Vec::new();
        let mut cursor = offset;
        while issues.len() < wanted {
            let request = page_size.min(wanted - issues.len());
            let page = self
                .source
                .list_issues(project, request, cursor)
                .map_err(|e| FerryError::SourceRead(format!("listing issues at offset {cursor}: {e}")))?;
            let len = page.len();
            issues.extend(page);
            if len < request {
                break;
            }
            cursor += len;
        }
        Ok(issues)
    }

    // -----------------------------------------------------------------------
    // Batch scheduling
    // -----------------------------------------------------------------------

    /// Process one kind's batch on the worker pool. Per-entity failures are
    /// recorded and counted; only ledger failures abort the batch.
    pub fn run_batch(
        &self,
        kind: EntityKind,
        entities: &[SourceEntity],
        options: &MigrateOptions,
        run_id: Option<i64>,
    ) -> FerryResult<BatchReport> {
        if let Some(stray) = entities.iter().find(|e| e.kind != kind) {
            return Err(FerryError::InvalidRecord(format!(
                "{} {} delivered in a {kind} batch",
                stray.kind, stray.source_id
            )));
        }

        let mut seen = HashSet::new();
        let work: Vec<&SourceEntity> = entities
            .iter()
            .filter(|e| seen.insert(e.source_id.clone()))
            .collect();
        if work.len() < entities.len() {
            debug!(kind = %kind, dropped = entities.len() - work.len(), "dropped duplicate keys from batch");
        }

        let workers = self.config.worker_count();
        info!(kind = %kind, entities = work.len(), workers, dry_run = options.dry_run, "migrating batch");

        let outcomes: Vec<EntityOutcome> = if workers <= 1 || work.len() <= 1 {
            self.process_sequential(&work, options, run_id)?
        } else {
            match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                Ok(pool) => pool.install(|| {
                    work.par_iter()
                        .map(|entity| self.process_unless_cancelled(entity, options, run_id))
                        .collect::<FerryResult<Vec<_>>>()
                })?,
                Err(err) => {
                    warn!(error = %err, "worker pool unavailable, running sequentially");
                    self.process_sequential(&work, options, run_id)?
                }
            }
        };

        let mut report = BatchReport {
            kind: Some(kind),
            run_id,
            ..BatchReport::default()
        };
        let mut unstarted = Vec::new();
        for (entity, outcome) in work.iter().zip(outcomes) {
            match outcome {
                EntityOutcome::Recorded { record, substituted } => {
                    report.summary.substituted += substituted;
                    report.summary.record(record.outcome);
                    if record.outcome == Outcome::Failed {
                        if let Some(error) = record.last_error {
                            report.failures.push((record.source_id, error));
                        }
                    }
                }
                EntityOutcome::Previewed { substituted } => {
                    report.summary.substituted += substituted;
                    report.summary.skipped += 1;
                }
                EntityOutcome::AlreadyMigrated => report.summary.already_migrated += 1,
                EntityOutcome::Duplicate => {}
                EntityOutcome::NotStarted => {
                    unstarted.push((entity.source_id.clone(), entity.parent_id.clone()));
                }
            }
        }

        if !unstarted.is_empty() {
            report.cancelled = true;
            report.summary.pending += unstarted.len();
            if !options.dry_run {
                let added = self.ledger.mark_pending(kind, &unstarted)?;
                info!(kind = %kind, unstarted = unstarted.len(), added, "run cancelled, registered pending entities");
            }
        }
        if self.cancel.is_cancelled() {
            report.cancelled = true;
        }

        info!(
            kind = %kind,
            success = report.summary.success,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            substituted = report.summary.substituted,
            already_migrated = report.summary.already_migrated,
            pending = report.summary.pending,
            "batch finished"
        );
        Ok(report)
    }

    fn process_sequential(
        &self,
        work: &[&SourceEntity],
        options: &MigrateOptions,
        run_id: Option<i64>,
    ) -> FerryResult<Vec<EntityOutcome>> {
        work.iter()
            .map(|entity| self.process_unless_cancelled(entity, options, run_id))
            .collect()
    }

    fn process_unless_cancelled(
        &self,
        entity: &SourceEntity,
        options: &MigrateOptions,
        run_id: Option<i64>,
    ) -> FerryResult<EntityOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(EntityOutcome::NotStarted);
        }
        self.migrate_one(entity, options, run_id)
    }

    // -----------------------------------------------------------------------
    // Single-entity path
    // -----------------------------------------------------------------------

    fn claim(&self, entity: &SourceEntity) -> Option<InFlightClaim<'_>> {
        let key = (entity.kind, entity.source_id.clone());
        if !self.in_flight.lock().insert(key.clone()) {
            return None;
        }
        Some(InFlightClaim {
            set: &self.in_flight,
            key,
        })
    }

    /// Skip check, parent resolution, translation, target write (or dry-run
    /// simulation), and ledger record for one entity.
    pub fn migrate_one(
        &self,
        entity: &SourceEntity,
        options: &MigrateOptions,
        run_id: Option<i64>,
    ) -> FerryResult<EntityOutcome> {
        let Some(_claim) = self.claim(entity) else {
            debug!(kind = %entity.kind, source_id = %entity.source_id, "key already in flight");
            return Ok(EntityOutcome::Duplicate);
        };

        let existing = self.ledger.lookup(entity.kind, &entity.source_id)?;
        if let Some(record) = &existing {
            // Dry runs never overwrite a success, forced or not.
            if record.outcome == Outcome::Success && (!options.force || options.dry_run) {
                debug!(kind = %entity.kind, source_id = %entity.source_id, "already migrated");
                return Ok(EntityOutcome::AlreadyMigrated);
            }
        }

        let (attempt, substituted) = self.attempt(entity, options)?;
        if options.dry_run {
            // A dry run must not consume retry budget or hide a failure.
            if let Some(record) = existing.as_ref().filter(|r| r.outcome == Outcome::Failed) {
                info!(
                    kind = %entity.kind,
                    source_id = %entity.source_id,
                    attempts = record.attempt_count,
                    preview = attempt.error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                    "dry run left failed record untouched"
                );
                return Ok(EntityOutcome::Previewed { substituted });
            }
        }
        let attempt = attempt
            .with_parent(entity.parent_id.as_deref())
            .in_run(run_id);
        let record = self.ledger.record_attempt(&attempt)?;

        match (&record.outcome, &record.last_error) {
            (Outcome::Failed, Some(err)) => warn!(
                kind = %entity.kind,
                source_id = %entity.source_id,
                error_kind = err.kind.as_str(),
                attempt = record.attempt_count,
                "migration failed: {}",
                err.message
            ),
            _ => debug!(
                kind = %entity.kind,
                source_id = %entity.source_id,
                outcome = record.outcome.as_str(),
                target_id = record.target_id.as_deref().unwrap_or(""),
                "recorded attempt"
            ),
        }
        Ok(EntityOutcome::Recorded { record, substituted })
    }

    /// Decide the attempt to record, with the number of fallback
    /// substitutions in its payload. Never writes the ledger.
    fn attempt(
        &self,
        entity: &SourceEntity,
        options: &MigrateOptions,
    ) -> FerryResult<(NewAttempt, usize)> {
        let kind = entity.kind;
        let source_id = entity.source_id.as_str();

        let parent_target = match kind.parent_kind() {
            None => None,
            Some(parent_kind) => {
                let parent = entity.parent_id.as_deref().unwrap_or("");
                match self.ledger.target_id(parent_kind, parent)? {
                    Some(target_id) => Some(target_id),
                    None if options.dry_run => {
                        let reason = AttemptError::new(
                            ErrorKind::DryRun,
                            format!("dry-run: parent issue {parent} not migrated"),
                        );
                        return Ok((NewAttempt::skipped(kind, source_id, reason), 0));
                    }
                    None => {
                        let error = AttemptError::new(
                            ErrorKind::ParentNotMigrated,
                            format!("parent issue {parent:?} has no successful migration"),
                        );
                        return Ok((NewAttempt::failed(kind, source_id, error), 0));
                    }
                }
            }
        };

        let translation = match self.resolver.translate_traced(entity) {
            Ok(translation) => translation,
            Err(unmapped) => {
                let message = unmapped
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                let attempt = if options.dry_run {
                    NewAttempt::skipped(
                        kind,
                        source_id,
                        AttemptError::new(ErrorKind::DryRun, format!("dry-run: would fail: {message}")),
                    )
                } else {
                    NewAttempt::failed(kind, source_id, AttemptError::new(ErrorKind::UnmappedValue, message))
                };
                return Ok((attempt, 0));
            }
        };
        for sub in &translation.substitutions {
            warn!(
                kind = %kind,
                source_id,
                field = %sub.field,
                category = sub.category.as_str(),
                source_value = %sub.source_value,
                fallback = %sub.target_value,
                "unmapped value replaced by fallback"
            );
        }
        let substituted = translation.substitutions.len();
        let payload = translation.payload;
        let digest = payload.digest();

        if options.dry_run {
            let attempt = NewAttempt::skipped(kind, source_id, AttemptError::new(ErrorKind::DryRun, "dry-run"))
                .with_digest(Some(digest));
            return Ok((attempt, substituted));
        }

        let created = self.create_in_target(entity, &payload, parent_target.as_deref());
        let attempt = match created {
            Ok(target_id) => NewAttempt::success(kind, source_id, target_id),
            Err(err) => NewAttempt::failed(kind, source_id, repository_failure(&err)),
        };
        Ok((attempt.with_digest(Some(digest)), substituted))
    }

    fn create_in_target(
        &self,
        entity: &SourceEntity,
        payload: &TargetPayload,
        parent_target: Option<&str>,
    ) -> Result<String, RepositoryError> {
        let parent = parent_target.unwrap_or("");
        let (result, calls) = match entity.kind {
            EntityKind::Issue => self
                .backoff
                .run("create_issue", || self.target.create_issue(payload)),
            EntityKind::Comment => self
                .backoff
                .run("create_comment", || self.target.create_comment(parent, payload)),
            EntityKind::Attachment => {
                let payload_ref = entity.payload_ref.as_deref().ok_or_else(|| {
                    RepositoryError::permanent("attachment has no payload reference")
                })?;
                let (bytes, _) = self.backoff.run("fetch_attachment_payload", || {
                    self.source.fetch_attachment_payload(payload_ref)
                });
                let bytes = bytes?;
                self.backoff.run("create_attachment", || {
                    self.target.create_attachment(parent, payload, &bytes)
                })
            }
        };
        if calls > 1 {
            debug!(kind = %entity.kind, source_id = %entity.source_id, calls, "target call needed backoff");
        }
        result
    }
}

fn repository_failure(err: &RepositoryError) -> AttemptError {
    let kind = match err.class {
        ErrorClass::Transient => ErrorKind::TransientRepository,
        ErrorClass::Permanent => ErrorKind::PermanentRepository,
    };
    AttemptError::new(kind, &err.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::errors::RepositoryError;
    use crate::mapping::{DefaultPolicy, FieldCategory, MappingTable};
    use crate::repository::{MemorySource, MemoryTarget};

    fn config(workers: i64) -> FerryConfig {
        FerryConfig {
            source_project: "OLD".to_string(),
            target_project: "NEW".to_string(),
            workers,
            backoff: BackoffConfig::immediate(3),
            ..FerryConfig::default()
        }
    }

    fn resolver() -> MappingResolver {
        let mut table = MappingTable::default();
        table.add_rule(FieldCategory::Status, "Open", "To Do").unwrap();
        table.add_rule(FieldCategory::Status, "Closed", "Done").unwrap();
        table.set_policy(FieldCategory::Status, DefaultPolicy::Fail);
        MappingResolver::new(table)
    }

    fn issue(id: &str, status: &str) -> SourceEntity {
        SourceEntity::issue(id)
            .with_field("summary", format!("summary of {id}"))
            .with_field("status", status)
    }

    #[test]
    fn success_records_target_id_and_digest() {
        let (cfg, ledger, resolver) = (config(1), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);

        let report = engine
            .migrate(EntityKind::Issue, &[issue("OLD-1", "Open")], &MigrateOptions::default())
            .unwrap();
        assert_eq!(report.summary.success, 1);
        assert!(report.run_id.is_some());

        let record = ledger.lookup(EntityKind::Issue, "OLD-1").unwrap().unwrap();
        assert_eq!(record.target_id.as_deref(), Some("NEW-1"));
        let stored = target.fetch(EntityKind::Issue, "NEW-1").unwrap().unwrap();
        assert_eq!(stored.fields["status"], "To Do");
        let history = ledger.history(EntityKind::Issue, "OLD-1").unwrap();
        assert!(history[0].payload_digest.is_some());
        assert_eq!(history[0].run_id, report.run_id);
    }

    #[test]
    fn unmapped_value_fails_without_target_write() {
        let (cfg, ledger, resolver) = (config(1), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);

        let report = engine
            .migrate(EntityKind::Issue, &[issue("OLD-1", "Blocked")], &MigrateOptions::default())
            .unwrap();
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.failures[0].1.kind, ErrorKind::UnmappedValue);
        assert!(report.failures[0].1.message.contains("Blocked"));
        assert_eq!(target.write_calls(), 0);
    }

    #[test]
    fn transient_errors_back_off_then_succeed() {
        let (cfg, ledger, resolver) = (config(1), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        target.push_failure(RepositoryError::transient("429 rate limited"));
        target.push_failure(RepositoryError::transient("429 rate limited"));
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);

        let report = engine
            .migrate(EntityKind::Issue, &[issue("OLD-1", "Open")], &MigrateOptions::default())
            .unwrap();
        assert_eq!(report.summary.success, 1);
        assert_eq!(target.write_calls(), 3);
        // Backoff calls inside one attempt do not count as ledger attempts.
        let record = ledger.lookup(EntityKind::Issue, "OLD-1").unwrap().unwrap();
        assert_eq!(record.attempt_count, 1);
    }

    #[test]
    fn exhausted_backoff_records_transient_failure() {
        let (cfg, ledger, resolver) = (config(1), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        for _ in 0..3 {
            target.push_failure(RepositoryError::transient("timeout"));
        }
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);

        let report = engine
            .migrate(EntityKind::Issue, &[issue("OLD-1", "Open")], &MigrateOptions::default())
            .unwrap();
        assert_eq!(report.failures[0].1.kind, ErrorKind::TransientRepository);
        assert_eq!(target.write_calls(), 3);
    }

    #[test]
    fn permanent_rejection_is_isolated_to_its_entity() {
        let (cfg, ledger, resolver) = (config(4), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        target.reject_when("summary", "summary of OLD-2", RepositoryError::permanent("400 invalid"));
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);

        let batch: Vec<_> = (1..=5).map(|n| issue(&format!("OLD-{n}"), "Open")).collect();
        let report = engine
            .migrate(EntityKind::Issue, &batch, &MigrateOptions::default())
            .unwrap();
        assert_eq!(report.summary.success, 4);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.failures[0].0, "OLD-2");
        assert_eq!(report.failures[0].1.kind, ErrorKind::PermanentRepository);
    }

    #[test]
    fn duplicate_keys_in_a_batch_are_processed_once() {
        let (cfg, ledger, resolver) = (config(4), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);

        let batch = vec![issue("OLD-1", "Open"), issue("OLD-1", "Open"), issue("OLD-2", "Closed")];
        let report = engine
            .migrate(EntityKind::Issue, &batch, &MigrateOptions::default())
            .unwrap();
        assert_eq!(report.summary.success, 2);
        assert_eq!(target.created_count(EntityKind::Issue), 2);
    }

    #[test]
    fn offset_and_limit_window_the_batch() {
        let (cfg, ledger, resolver) = (config(1), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);

        let batch: Vec<_> = (1..=5).map(|n| issue(&format!("OLD-{n}"), "Open")).collect();
        let options = MigrateOptions {
            offset: 1,
            limit: Some(2),
            ..MigrateOptions::default()
        };
        engine.migrate(EntityKind::Issue, &batch, &options).unwrap();
        assert!(ledger.lookup(EntityKind::Issue, "OLD-1").unwrap().is_none());
        assert!(ledger.lookup(EntityKind::Issue, "OLD-2").unwrap().is_some());
        assert!(ledger.lookup(EntityKind::Issue, "OLD-3").unwrap().is_some());
        assert!(ledger.lookup(EntityKind::Issue, "OLD-4").unwrap().is_none());
    }

    #[test]
    fn force_reprocesses_success_but_dry_run_never_downgrades() {
        let (cfg, ledger, resolver) = (config(1), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);
        let batch = [issue("OLD-1", "Open")];

        engine.migrate(EntityKind::Issue, &batch, &MigrateOptions::default()).unwrap();
        let forced_dry = MigrateOptions {
            dry_run: true,
            force: true,
            ..MigrateOptions::default()
        };
        let report = engine.migrate(EntityKind::Issue, &batch, &forced_dry).unwrap();
        assert_eq!(report.summary.already_migrated, 1);
        let record = ledger.lookup(EntityKind::Issue, "OLD-1").unwrap().unwrap();
        assert_eq!(record.outcome, Outcome::Success);

        let forced = MigrateOptions {
            force: true,
            ..MigrateOptions::default()
        };
        engine.migrate(EntityKind::Issue, &batch, &forced).unwrap();
        let record = ledger.lookup(EntityKind::Issue, "OLD-1").unwrap().unwrap();
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.target_id.as_deref(), Some("NEW-2"));
    }

    #[test]
    fn dry_run_leaves_failed_record_for_retry() {
        let (cfg, ledger, resolver) = (config(1), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);
        let batch = [issue("OLD-1", "Blocked")];

        engine.migrate(EntityKind::Issue, &batch, &MigrateOptions::default()).unwrap();
        let report = engine.migrate(EntityKind::Issue, &batch, &MigrateOptions::dry_run()).unwrap();
        assert_eq!(report.summary.skipped, 1);
        assert!(report.failures.is_empty());

        let record = ledger.lookup(EntityKind::Issue, "OLD-1").unwrap().unwrap();
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.last_error.unwrap().kind, ErrorKind::UnmappedValue);
        assert_eq!(ledger.history(EntityKind::Issue, "OLD-1").unwrap().len(), 1);
        assert_eq!(ledger.list_by_outcome(EntityKind::Issue, Outcome::Failed).unwrap().len(), 1);
    }

    #[test]
    fn fallback_substitutions_are_counted() {
        let (cfg, ledger) = (config(1), Ledger::open_in_memory().unwrap());
        let mut table = MappingTable::default();
        table.add_rule(FieldCategory::Status, "Open", "To Do").unwrap();
        table.set_policy(
            FieldCategory::Priority,
            DefaultPolicy::Fallback {
                value: "Medium".to_string(),
            },
        );
        let resolver = MappingResolver::new(table);
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);

        let batch = [
            issue("OLD-1", "Open").with_field("priority", "Urgent"),
            issue("OLD-2", "Open").with_field("priority", "Blocker"),
            issue("OLD-3", "Open"),
        ];
        let report = engine.migrate(EntityKind::Issue, &batch, &MigrateOptions::default()).unwrap();
        assert_eq!(report.summary.success, 3);
        assert_eq!(report.summary.substituted, 2);
        let stored = target.fetch(EntityKind::Issue, "NEW-1").unwrap().unwrap();
        assert_eq!(stored.fields["priority"], "Medium");

        let persisted = ledger.run_summary(report.run_id.unwrap()).unwrap().unwrap();
        assert_eq!(persisted.kind(EntityKind::Issue).substituted, 2);
    }

    #[test]
    fn mixed_kinds_in_one_batch_are_rejected() {
        let (cfg, ledger, resolver) = (config(1), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);

        let batch = [issue("OLD-1", "Open"), SourceEntity::comment("OLD-1", "300")];
        let err = engine
            .migrate(EntityKind::Issue, &batch, &MigrateOptions::default())
            .unwrap_err();
        assert!(matches!(err, FerryError::InvalidRecord(_)));
    }

    #[test]
    fn cancelled_run_registers_pending_and_resumes() {
        let (cfg, ledger, resolver) = (config(1), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        let token = CancelToken::new();
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target)
            .with_cancel_token(token.clone());
        let batch: Vec<_> = (1..=3).map(|n| issue(&format!("OLD-{n}"), "Open")).collect();

        token.cancel();
        let report = engine
            .migrate(EntityKind::Issue, &batch, &MigrateOptions::default())
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.summary.pending, 3);
        assert_eq!(ledger.count_by_outcome(EntityKind::Issue, Outcome::Pending).unwrap(), 3);
        assert_eq!(target.write_calls(), 0);

        token.reset();
        let report = engine
            .migrate(EntityKind::Issue, &batch, &MigrateOptions::default())
            .unwrap();
        assert_eq!(report.summary.success, 3);
        assert_eq!(ledger.count_by_outcome(EntityKind::Issue, Outcome::Pending).unwrap(), 0);
    }

    #[test]
    fn attachment_bytes_flow_from_source_to_target() {
        let (cfg, ledger, resolver) = (config(1), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        let attachment = SourceEntity::attachment("OLD-1", "900", "blob://900").with_field("filename", "log.txt");
        source.add_attachment(attachment.clone(), b"payload".to_vec());
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);

        engine
            .migrate(EntityKind::Issue, &[issue("OLD-1", "Open")], &MigrateOptions::default())
            .unwrap();
        let report = engine
            .migrate(EntityKind::Attachment, &[attachment], &MigrateOptions::default())
            .unwrap();
        assert_eq!(report.summary.success, 1);
        let stored = &target.entities(EntityKind::Attachment)[0];
        assert_eq!(stored.content_digest, Some(crate::models::content_digest(b"payload")));
        assert_eq!(stored.fields["issue"], "NEW-1");
    }

    #[test]
    fn migrate_project_pages_issues_then_children() {
        let mut cfg = config(2);
        cfg.page_size = 2;
        let (ledger, resolver) = (Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        for n in 1..=5 {
            source.add_issue(issue(&format!("OLD-{n}"), "Open"));
            source.add_comment(SourceEntity::comment(format!("OLD-{n}"), format!("{}", 300 + n)).with_field("body", "hi"));
        }
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);

        let options = MigrateOptions {
            offset: 1,
            limit: Some(3),
            ..MigrateOptions::default()
        };
        let summary = engine.migrate_project(&options).unwrap();
        assert_eq!(summary.kind(EntityKind::Issue).success, 3);
        assert_eq!(summary.kind(EntityKind::Comment).success, 3);
        assert!(ledger.lookup(EntityKind::Issue, "OLD-1").unwrap().is_none());
        assert!(ledger.lookup(EntityKind::Comment, "302").unwrap().is_some());
        assert!(ledger.lookup(EntityKind::Comment, "305").unwrap().is_none());

        let persisted = ledger.run_summary(summary.run_id.unwrap()).unwrap().unwrap();
        assert_eq!(persisted, summary);
    }

    #[test]
    fn migrate_project_aborts_on_source_read_failure() {
        let (cfg, ledger, resolver) = (config(1), Ledger::open_in_memory().unwrap(), resolver());
        let (source, target) = (MemorySource::new(), MemoryTarget::new("NEW"));
        source.add_issue(issue("OLD-1", "Open"));
        source.set_read_failure(Some(RepositoryError::transient("connection reset")));
        let engine = MigrationEngine::new(&cfg, &ledger, &resolver, &source, &target);

        let err = engine.migrate_project(&MigrateOptions::default()).unwrap_err();
        assert!(matches!(err, FerryError::SourceRead(_)));
        assert_eq!(target.write_calls(), 0);
    }
}
