//! In-process trackers used by tests, dry rehearsals, and the benchmarks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::{sort_by_source_id, SourceRepository, TargetRepository};
use crate::errors::{RepoResult, RepositoryError};
use crate::models::{content_digest, EntityKind, SourceEntity, TargetEntity, TargetPayload};

#[derive(Default)]
struct SourceState {
    issues: Vec<SourceEntity>,
    comments: HashMap<String, Vec<SourceEntity>>,
    attachments: HashMap<String, Vec<SourceEntity>>,
    payloads: HashMap<String, Vec<u8>>,
    read_failure: Option<RepositoryError>,
}

/// Mutable in-memory source tracker. Entities can be edited between runs to
/// simulate fixes made at the source.
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<SourceState>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an issue.
    pub fn add_issue(&self, issue: SourceEntity) {
        let mut state = self.state.lock();
        state.issues.retain(|existing| existing.source_id != issue.source_id);
        state.issues.push(issue);
        sort_by_source_id(&mut state.issues);
    }

    pub fn add_comment(&self, comment: SourceEntity) {
        let parent = comment.parent_id.clone().unwrap_or_default();
        let mut state = self.state.lock();
        let list = state.comments.entry(parent).or_default();
        list.retain(|existing| existing.source_id != comment.source_id);
        list.push(comment);
        sort_by_source_id(list);
    }

    pub fn add_attachment(&self, attachment: SourceEntity, bytes: impl Into<Vec<u8>>) {
        let parent = attachment.parent_id.clone().unwrap_or_default();
        let mut state = self.state.lock();
        if let Some(payload_ref) = attachment.payload_ref.clone() {
            state.payloads.insert(payload_ref, bytes.into());
        }
        let list = state.attachments.entry(parent).or_default();
        list.retain(|existing| existing.source_id != attachment.source_id);
        list.push(attachment);
        sort_by_source_id(list);
    }

    /// Remove any entity (and, for issues, its children) from the source.
    pub fn remove(&self, kind: EntityKind, source_id: &str) {
        let mut state = self.state.lock();
        match kind {
            EntityKind::Issue => {
                state.issues.retain(|issue| issue.source_id != source_id);
                state.comments.remove(source_id);
                state.attachments.remove(source_id);
            }
            EntityKind::Comment => {
                for list in state.comments.values_mut() {
                    list.retain(|c| c.source_id != source_id);
                }
            }
            EntityKind::Attachment => {
                for list in state.attachments.values_mut() {
                    list.retain(|a| a.source_id != source_id);
                }
            }
        }
    }

    /// Every read fails with `error` until cleared with `None`.
    pub fn set_read_failure(&self, error: Option<RepositoryError>) {
        self.state.lock().read_failure = error;
    }

    fn check_reads(state: &SourceState) -> RepoResult<()> {
        match &state.read_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl SourceRepository for MemorySource {
    fn list_issues(&self, _project: &str, limit: usize, offset: usize) -> RepoResult<Vec<SourceEntity>> {
        let state = self.state.lock();
        Self::check_reads(&state)?;
        Ok(state.issues.iter().skip(offset).take(limit).cloned().collect())
    }

    fn list_comments(&self, issue_source_id: &str) -> RepoResult<Vec<SourceEntity>> {
        let state = self.state.lock();
        Self::check_reads(&state)?;
        Ok(state.comments.get(issue_source_id).cloned().unwrap_or_default())
    }

    fn list_attachments(&self, issue_source_id: &str) -> RepoResult<Vec<SourceEntity>> {
        let state = self.state.lock();
        Self::check_reads(&state)?;
        Ok(state.attachments.get(issue_source_id).cloned().unwrap_or_default())
    }

    fn fetch_attachment_payload(&self, payload_ref: &str) -> RepoResult<Vec<u8>> {
        let state = self.state.lock();
        Self::check_reads(&state)?;
        state
            .payloads
            .get(payload_ref)
            .cloned()
            .ok_or_else(|| RepositoryError::permanent(format!("attachment payload {payload_ref} not found")))
    }
}

/// Rejects every create whose payload carries `field == value`.
struct Rejection {
    field: String,
    value: Value,
    error: RepositoryError,
}

#[derive(Default)]
struct TargetState {
    entities: IndexMap<(EntityKind, String), TargetEntity>,
    counters: HashMap<EntityKind, u64>,
    queued_failures: VecDeque<RepositoryError>,
    rejections: Vec<Rejection>,
}

/// In-memory target tracker with scripted failures and a write counter.
pub struct MemoryTarget {
    project: String,
    state: Mutex<TargetState>,
    write_calls: AtomicUsize,
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new("NEW")
    }
}

impl MemoryTarget {
    /// Issues are keyed `<project>-<n>`; comments and attachments get numeric IDs.
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            state: Mutex::new(TargetState::default()),
            write_calls: AtomicUsize::new(0),
        }
    }

    /// The next create call fails with `error`. Queued failures are consumed
    /// in order, one per call.
    pub fn push_failure(&self, error: RepositoryError) {
        self.state.lock().queued_failures.push_back(error);
    }

    pub fn reject_when(&self, field: impl Into<String>, value: impl Into<Value>, error: RepositoryError) {
        self.state.lock().rejections.push(Rejection {
            field: field.into(),
            value: value.into(),
            error,
        });
    }

    pub fn clear_rejections(&self) {
        self.state.lock().rejections.clear();
    }

    /// Every create call, successful or not.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn created_count(&self, kind: EntityKind) -> usize {
        self.state
            .lock()
            .entities
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn entities(&self, kind: EntityKind) -> Vec<TargetEntity> {
        self.state
            .lock()
            .entities
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Overwrite a stored field, simulating drift after migration.
    pub fn set_field(&self, kind: EntityKind, target_id: &str, field: &str, value: impl Into<Value>) {
        if let Some(entity) = self
            .state
            .lock()
            .entities
            .get_mut(&(kind, target_id.to_string()))
        {
            entity.fields.insert(field.to_string(), value.into());
        }
    }

    pub fn remove(&self, kind: EntityKind, target_id: &str) {
        self.state
            .lock()
            .entities
            .shift_remove(&(kind, target_id.to_string()));
    }

    fn create(
        &self,
        kind: EntityKind,
        parent_target_id: Option<&str>,
        payload: &TargetPayload,
        content: Option<&[u8]>,
    ) -> RepoResult<String> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(err) = state.queued_failures.pop_front() {
            return Err(err);
        }
        if let Some(rejection) = state
            .rejections
            .iter()
            .find(|r| payload.fields.get(&r.field) == Some(&r.value))
        {
            return Err(rejection.error.clone());
        }
        if let Some(parent) = parent_target_id {
            if !state
                .entities
                .contains_key(&(EntityKind::Issue, parent.to_string()))
            {
                return Err(RepositoryError::permanent(format!("issue {parent} does not exist")));
            }
        }

        let counter = state.counters.entry(kind).or_insert(0);
        *counter += 1;
        let target_id = match kind {
            EntityKind::Issue => format!("{}-{}", self.project, counter),
            EntityKind::Comment => format!("{}", 10_000 + *counter),
            EntityKind::Attachment => format!("{}", 20_000 + *counter),
        };
        let mut fields = payload.fields.clone();
        if let Some(parent) = parent_target_id {
            fields.insert("issue".to_string(), Value::String(parent.to_string()));
        }
        state.entities.insert(
            (kind, target_id.clone()),
            TargetEntity {
                kind,
                target_id: target_id.clone(),
                fields,
                content_digest: content.map(content_digest),
            },
        );
        Ok(target_id)
    }
}

impl TargetRepository for MemoryTarget {
    fn create_issue(&self, payload: &TargetPayload) -> RepoResult<String> {
        self.create(EntityKind::Issue, None, payload, None)
    }

    fn create_comment(&self, issue_target_id: &str, payload: &TargetPayload) -> RepoResult<String> {
        self.create(EntityKind::Comment, Some(issue_target_id), payload, None)
    }

    fn create_attachment(
        &self,
        issue_target_id: &str,
        payload: &TargetPayload,
        content: &[u8],
    ) -> RepoResult<String> {
        self.create(EntityKind::Attachment, Some(issue_target_id), payload, Some(content))
    }

    fn fetch(&self, kind: EntityKind, target_id: &str) -> RepoResult<Option<TargetEntity>> {
        Ok(self
            .state
            .lock()
            .entities
            .get(&(kind, target_id.to_string()))
            .cloned())
    }
}
