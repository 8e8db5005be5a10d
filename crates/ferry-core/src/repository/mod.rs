//! Source and target tracker seams.
//!
//! The engine, retry coordinator, and validator only talk to trackers through
//! these traits; HTTP clients, credentials, and wire formats live behind them.

pub mod export;
pub mod memory;

use std::cmp::Ordering;

use crate::errors::RepoResult;
use crate::models::{EntityKind, SourceEntity, TargetEntity, TargetPayload};

pub use export::ExportFileSource;
pub use memory::{MemorySource, MemoryTarget};

/// Read-only view of the tracker being migrated from.
pub trait SourceRepository: Send + Sync {
    /// One page of a project's issues, ordered by source ID ascending.
    fn list_issues(&self, project: &str, limit: usize, offset: usize)
        -> RepoResult<Vec<SourceEntity>>;

    fn list_comments(&self, issue_source_id: &str) -> RepoResult<Vec<SourceEntity>>;

    /// Attachment metadata only; bytes come from [`Self::fetch_attachment_payload`].
    fn list_attachments(&self, issue_source_id: &str) -> RepoResult<Vec<SourceEntity>>;

    fn fetch_attachment_payload(&self, payload_ref: &str) -> RepoResult<Vec<u8>>;

    fn list_children(&self, kind: EntityKind, issue_source_id: &str) -> RepoResult<Vec<SourceEntity>> {
        match kind {
            EntityKind::Issue => Ok(Vec::new()),
            EntityKind::Comment => self.list_comments(issue_source_id),
            EntityKind::Attachment => self.list_attachments(issue_source_id),
        }
    }

    /// Every issue of a project, paging until a short page.
    fn list_all_issues(&self, project: &str, page_size: usize) -> RepoResult<Vec<SourceEntity>> {
        let page_size = page_size.max(1);
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.list_issues(project, page_size, offset)?;
            let len = page.len();
            all.extend(page);
            if len < page_size {
                return Ok(all);
            }
            offset += len;
        }
    }
}

/// Write side of the tracker being migrated to, plus the read-back the
/// validator needs.
pub trait TargetRepository: Send + Sync {
    fn create_issue(&self, payload: &TargetPayload) -> RepoResult<String>;

    fn create_comment(&self, issue_target_id: &str, payload: &TargetPayload) -> RepoResult<String>;

    fn create_attachment(
        &self,
        issue_target_id: &str,
        payload: &TargetPayload,
        content: &[u8],
    ) -> RepoResult<String>;

    fn fetch(&self, kind: EntityKind, target_id: &str) -> RepoResult<Option<TargetEntity>>;
}

/// Order tracker keys like `PROJ-9` before `PROJ-10`; keys without a numeric
/// suffix fall back to plain string order.
pub fn compare_source_ids(a: &str, b: &str) -> Ordering {
    fn split(id: &str) -> (&str, Option<u64>) {
        match id.rsplit_once('-') {
            Some((prefix, num)) => match num.parse::<u64>() {
                Ok(n) => (prefix, Some(n)),
                Err(_) => (id, None),
            },
            None => match id.parse::<u64>() {
                Ok(n) => ("", Some(n)),
                Err(_) => (id, None),
            },
        }
    }
    let (pa, na) = split(a);
    let (pb, nb) = split(b);
    pa.cmp(pb).then_with(|| match (na, nb) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    })
}

pub fn sort_by_source_id(entities: &mut [SourceEntity]) {
    entities.sort_by(|a, b| compare_source_ids(&a.source_id, &b.source_id));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_suffixes_sort_naturally() {
        let mut ids = vec!["OLD-10", "OLD-9", "OLD-100", "ABC-2", "7", "12"];
        ids.sort_by(|a, b| compare_source_ids(a, b));
        assert_eq!(ids, vec!["7", "12", "ABC-2", "OLD-9", "OLD-10", "OLD-100"]);
    }

    #[test]
    fn default_paging_reads_every_issue() {
        let source = MemorySource::default();
        for n in 1..=7 {
            source.add_issue(SourceEntity::issue(format!("OLD-{n}")));
        }
        let all = source.list_all_issues("OLD", 3).unwrap();
        assert_eq!(all.len(), 7);
        assert_eq!(all[6].source_id, "OLD-7");
    }
}
