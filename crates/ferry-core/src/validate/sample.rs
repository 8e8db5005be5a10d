use crate::models::MigrationRecord;

/// Stable pseudo-random ordering key for a source ID.
pub fn sample_key(source_id: &str) -> u32 {
    crc32fast::hash(source_id.as_bytes())
}

/// Pick up to `size` records, ordered by CRC-32 of the source ID so repeated
/// validations over the same ledger inspect the same subset. `None` keeps
/// every record, in ledger order.
pub fn sample_records(records: Vec<MigrationRecord>, size: Option<usize>) -> Vec<MigrationRecord> {
    let Some(size) = size else {
        return records;
    };
    let mut keyed: Vec<(u32, MigrationRecord)> = records
        .into_iter()
        .map(|r| (sample_key(&r.source_id), r))
        .collect();
    keyed.sort_by(|(ka, ra), (kb, rb)| ka.cmp(kb).then_with(|| ra.source_id.cmp(&rb.source_id)));
    keyed.into_iter().take(size).map(|(_, r)| r).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, Outcome};

    fn record(id: &str) -> MigrationRecord {
        MigrationRecord {
            kind: EntityKind::Issue,
            source_id: id.to_string(),
            parent_id: None,
            target_id: Some(format!("T-{id}")),
            outcome: Outcome::Success,
            attempt_count: 1,
            last_error: None,
            first_attempt_at: None,
            last_attempt_at: None,
        }
    }

    #[test]
    fn sampling_is_deterministic_and_bounded() {
        let records: Vec<_> = (0..50).map(|n| record(&format!("OLD-{n}"))).collect();
        let first = sample_records(records.clone(), Some(5));
        let mut reversed = records.clone();
        reversed.reverse();
        let second = sample_records(reversed, Some(5));
        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
    }

    #[test]
    fn no_size_keeps_everything() {
        let records: Vec<_> = (0..3).map(|n| record(&format!("OLD-{n}"))).collect();
        assert_eq!(sample_records(records.clone(), None), records);
        assert!(sample_records(records, Some(0)).is_empty());
    }
}
