//! Source repository backed by a tracker's JSON export.
//!
//! Layout: `{"issues": [{"key": "...", "fields": {..., "comment": {"comments": [...]},
//! "attachment": [...]}}]}`. Comments and attachments are split out of the
//! issue fields into child entities; attachment bytes are read from an
//! optional payload directory as `<dir>/<attachment id>/<filename>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{sort_by_source_id, SourceRepository};
use crate::errors::{FerryError, FerryResult, RepoResult, RepositoryError};
use crate::models::SourceEntity;

#[derive(Deserialize)]
struct ExportDocument {
    #[serde(default)]
    issues: Vec<ExportIssue>,
}

#[derive(Deserialize)]
struct ExportIssue {
    key: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

pub struct ExportFileSource {
    issues: Vec<SourceEntity>,
    comments: HashMap<String, Vec<SourceEntity>>,
    attachments: HashMap<String, Vec<SourceEntity>>,
    payload_dir: Option<PathBuf>,
}

impl ExportFileSource {
    pub fn from_path(path: &Path) -> FerryResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let source = Self::from_json_str(&raw)?;
        info!(
            path = %path.display(),
            issues = source.issues.len(),
            "loaded source export"
        );
        Ok(source)
    }

    pub fn from_json_str(raw: &str) -> FerryResult<Self> {
        let doc: ExportDocument = serde_json::from_str(raw)?;
        let mut issues = Vec::with_capacity(doc.issues.len());
        let mut comments = HashMap::new();
        let mut attachments = HashMap::new();

        for ExportIssue { key, mut fields } in doc.issues {
            if key.trim().is_empty() {
                return Err(FerryError::Config("export issue without a key".to_string()));
            }
            if let Some(comment_block) = fields.remove("comment") {
                let mut list = parse_comments(&key, comment_block)?;
                sort_by_source_id(&mut list);
                comments.insert(key.clone(), list);
            }
            if let Some(attachment_block) = fields.remove("attachment") {
                let mut list = parse_attachments(&key, attachment_block)?;
                sort_by_source_id(&mut list);
                attachments.insert(key.clone(), list);
            }
            let mut issue = SourceEntity::issue(key);
            issue.fields = fields.into_iter().collect();
            issues.push(issue);
        }
        sort_by_source_id(&mut issues);
        debug!(
            issues = issues.len(),
            comments = comments.values().map(Vec::len).sum::<usize>(),
            attachments = attachments.values().map(Vec::len).sum::<usize>(),
            "parsed export document"
        );
        Ok(Self {
            issues,
            comments,
            attachments,
            payload_dir: None,
        })
    }

    pub fn with_payload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.payload_dir = Some(dir.into());
        self
    }
}

/// Tracker IDs arrive as strings or numbers depending on the export version.
fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn object_fields(obj: Map<String, Value>, skip: &[&str]) -> IndexMap<String, Value> {
    obj.into_iter()
        .filter(|(name, _)| !skip.contains(&name.as_str()))
        .collect()
}

fn parse_comments(issue_key: &str, block: Value) -> FerryResult<Vec<SourceEntity>> {
    let entries = match block {
        Value::Object(mut obj) => match obj.remove("comments") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        Value::Array(items) => items,
        _ => Vec::new(),
    };
    entries
        .into_iter()
        .map(|entry| {
            let Value::Object(obj) = entry else {
                return Err(FerryError::Config(format!("malformed comment on {issue_key}")));
            };
            let id = id_string(obj.get("id"))
                .ok_or_else(|| FerryError::Config(format!("comment without id on {issue_key}")))?;
            let mut comment = SourceEntity::comment(issue_key, id);
            comment.fields = object_fields(obj, &["id"]);
            Ok(comment)
        })
        .collect()
}

fn parse_attachments(issue_key: &str, block: Value) -> FerryResult<Vec<SourceEntity>> {
    let Value::Array(entries) = block else {
        return Ok(Vec::new());
    };
    entries
        .into_iter()
        .map(|entry| {
            let Value::Object(obj) = entry else {
                return Err(FerryError::Config(format!("malformed attachment on {issue_key}")));
            };
            let id = id_string(obj.get("id"))
                .ok_or_else(|| FerryError::Config(format!("attachment without id on {issue_key}")))?;
            let filename = obj
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or("attachment")
                .to_string();
            let payload_ref = format!("{id}/{filename}");
            let mut attachment = SourceEntity::attachment(issue_key, id, payload_ref);
            attachment.fields = object_fields(obj, &["id", "content", "self"]);
            Ok(attachment)
        })
        .collect()
}

impl SourceRepository for ExportFileSource {
    fn list_issues(&self, _project: &str, limit: usize, offset: usize) -> RepoResult<Vec<SourceEntity>> {
        Ok(self.issues.iter().skip(offset).take(limit).cloned().collect())
    }

    fn list_comments(&self, issue_source_id: &str) -> RepoResult<Vec<SourceEntity>> {
        Ok(self.comments.get(issue_source_id).cloned().unwrap_or_default())
    }

    fn list_attachments(&self, issue_source_id: &str) -> RepoResult<Vec<SourceEntity>> {
        Ok(self.attachments.get(issue_source_id).cloned().unwrap_or_default())
    }

    fn fetch_attachment_payload(&self, payload_ref: &str) -> RepoResult<Vec<u8>> {
        let dir = self
            .payload_dir
            .as_ref()
            .ok_or_else(|| RepositoryError::permanent("no attachment payload directory configured"))?;
        if payload_ref.split('/').any(|part| part == "..") {
            return Err(RepositoryError::permanent(format!(
                "attachment reference {payload_ref} escapes the payload directory"
            )));
        }
        std::fs::read(dir.join(payload_ref)).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                RepositoryError::permanent(format!("attachment payload {payload_ref} not found"))
            }
            _ => RepositoryError::transient(format!("reading attachment payload {payload_ref}: {err}")),
        })
    }
}
