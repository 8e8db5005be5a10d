//! SQLite-backed migration ledger.
//!
//! One row per `(entity_kind, source_id)` in `migration_records` holds the
//! latest state; `migration_attempts` keeps the append-only history. Both are
//! written in a single IMMEDIATE transaction per attempt, so a torn write can
//! never be observed as a success.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::errors::{FerryError, FerryResult};
use crate::models::{
    AttemptEntry, AttemptError, EntityKind, ErrorKind, MigrationRecord, Outcome, RunSummary,
};
use crate::store::schema::{self, NOW_SQL};

const RECORD_COLUMNS: &str = "entity_kind, source_id, parent_source_id, target_id, outcome, \
     attempt_count, error_kind, error_message, first_attempt_at, last_attempt_at";

/// One attempt to be appended to the ledger.
#[derive(Clone, Debug, PartialEq)]
pub struct NewAttempt {
    pub kind: EntityKind,
    pub source_id: String,
    pub parent_id: Option<String>,
    pub outcome: Outcome,
    pub target_id: Option<String>,
    pub error: Option<AttemptError>,
    pub payload_digest: Option<String>,
    pub run_id: Option<i64>,
}

impl NewAttempt {
    fn base(kind: EntityKind, source_id: &str, outcome: Outcome) -> Self {
        Self {
            kind,
            source_id: source_id.to_string(),
            parent_id: None,
            outcome,
            target_id: None,
            error: None,
            payload_digest: None,
            run_id: None,
        }
    }

    pub fn success(kind: EntityKind, source_id: &str, target_id: impl Into<String>) -> Self {
        let mut attempt = Self::base(kind, source_id, Outcome::Success);
        attempt.target_id = Some(target_id.into());
        attempt
    }

    pub fn failed(kind: EntityKind, source_id: &str, error: AttemptError) -> Self {
        let mut attempt = Self::base(kind, source_id, Outcome::Failed);
        attempt.error = Some(error);
        attempt
    }

    pub fn skipped(kind: EntityKind, source_id: &str, reason: AttemptError) -> Self {
        let mut attempt = Self::base(kind, source_id, Outcome::Skipped);
        attempt.error = Some(reason);
        attempt
    }

    pub fn with_parent(mut self, parent_id: Option<&str>) -> Self {
        self.parent_id = parent_id.map(str::to_string);
        self
    }

    pub fn with_digest(mut self, digest: Option<String>) -> Self {
        self.payload_digest = digest;
        self
    }

    pub fn in_run(mut self, run_id: Option<i64>) -> Self {
        self.run_id = run_id;
        self
    }

    fn check(&self) -> FerryResult<()> {
        match (self.outcome, &self.target_id) {
            (Outcome::Success, Some(id)) if !id.is_empty() => Ok(()),
            (Outcome::Success, _) => Err(FerryError::InvalidRecord(format!(
                "success for {} {} without a target id",
                self.kind, self.source_id
            ))),
            (Outcome::Pending, _) => Err(FerryError::InvalidRecord(format!(
                "pending is not an attempt outcome ({} {})",
                self.kind, self.source_id
            ))),
            (_, Some(_)) => Err(FerryError::InvalidRecord(format!(
                "{} outcome for {} {} carries a target id",
                self.outcome.as_str(),
                self.kind,
                self.source_id
            ))),
            (_, None) => Ok(()),
        }
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(FerryError::InvalidRecord(message)),
    )
}

fn parse_error(kind: Option<String>, message: Option<String>) -> Option<AttemptError> {
    let kind = ErrorKind::parse(kind.as_deref()?)?;
    Some(AttemptError {
        kind,
        message: message.unwrap_or_default(),
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MigrationRecord> {
    let kind_raw: String = row.get(0)?;
    let kind = EntityKind::parse(&kind_raw)
        .ok_or_else(|| conversion_error(0, format!("unknown entity kind {kind_raw:?}")))?;
    let outcome_raw: String = row.get(4)?;
    let outcome = Outcome::parse(&outcome_raw)
        .ok_or_else(|| conversion_error(4, format!("unknown outcome {outcome_raw:?}")))?;
    Ok(MigrationRecord {
        kind,
        source_id: row.get(1)?,
        parent_id: row.get(2)?,
        target_id: row.get(3)?,
        outcome,
        attempt_count: row.get(5)?,
        last_error: parse_error(row.get(6)?, row.get(7)?),
        first_attempt_at: row.get(8)?,
        last_attempt_at: row.get(9)?,
    })
}

fn write_err(err: rusqlite::Error) -> FerryError {
    FerryError::LedgerWrite(err.to_string())
}

/// Durable source-ID → target-ID correspondence and per-entity outcome state.
///
/// A single connection guarded by a mutex makes every upsert atomic per key;
/// the ledger is the only shared mutable resource of a run.
pub struct Ledger {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open (or create) a ledger file. Parent directories are created and the
    /// schema is migrated to the current version.
    pub fn open(path: &Path) -> FerryResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        Self::init(&conn)?;
        info!(path = %path.display(), "opened migration ledger");
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> FerryResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> FerryResult<()> {
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(conn)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lookup_with(
        conn: &Connection,
        kind: EntityKind,
        source_id: &str,
    ) -> FerryResult<Option<MigrationRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM migration_records \
             WHERE entity_kind = ?1 AND source_id = ?2;"
        );
        let record = conn
            .query_row(&sql, params![kind.as_str(), source_id], row_to_record)
            .optional()?;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn lookup(&self, kind: EntityKind, source_id: &str) -> FerryResult<Option<MigrationRecord>> {
        let conn = self.conn.lock();
        Self::lookup_with(&conn, kind, source_id)
    }

    /// Target ID of a successfully migrated entity, if any.
    pub fn target_id(&self, kind: EntityKind, source_id: &str) -> FerryResult<Option<String>> {
        Ok(self
            .lookup(kind, source_id)?
            .filter(|r| r.outcome == Outcome::Success)
            .and_then(|r| r.target_id))
    }

    /// Records of one kind with the given outcome, ordered by source ID.
    pub fn list_by_outcome(
        &self,
        kind: EntityKind,
        outcome: Outcome,
    ) -> FerryResult<Vec<MigrationRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM migration_records \
             WHERE entity_kind = ?1 AND outcome = ?2 ORDER BY source_id;"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![kind.as_str(), outcome.as_str()], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn count_by_outcome(&self, kind: EntityKind, outcome: Outcome) -> FerryResult<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM migration_records WHERE entity_kind = ?1 AND outcome = ?2;",
            params![kind.as_str(), outcome.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Full attempt history for one key, oldest first.
    pub fn history(&self, kind: EntityKind, source_id: &str) -> FerryResult<Vec<AttemptEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT attempt_no, outcome, target_id, error_kind, error_message, \
                    payload_digest, run_id, attempted_at \
             FROM migration_attempts \
             WHERE entity_kind = ?1 AND source_id = ?2 ORDER BY attempt_no;",
        )?;
        let rows = stmt.query_map(params![kind.as_str(), source_id], |row| {
            let outcome_raw: String = row.get(1)?;
            let outcome = Outcome::parse(&outcome_raw)
                .ok_or_else(|| conversion_error(1, format!("unknown outcome {outcome_raw:?}")))?;
            Ok(AttemptEntry {
                attempt_no: row.get(0)?,
                outcome,
                target_id: row.get(2)?,
                error: parse_error(row.get(3)?, row.get(4)?),
                payload_digest: row.get(5)?,
                run_id: row.get(6)?,
                attempted_at: row.get(7)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Append one attempt and upsert the latest state for its key.
    ///
    /// Increments `attempt_count`, overwrites outcome/target/error, keeps the
    /// first-attempt timestamp. Returns the updated record.
    pub fn record_attempt(&self, attempt: &NewAttempt) -> FerryResult<MigrationRecord> {
        attempt.check()?;
        let (error_kind, error_message) = match &attempt.error {
            Some(err) => (Some(err.kind.as_str()), Some(err.message.as_str())),
            None => (None, None),
        };

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(write_err)?;

        let now: String = tx
            .query_row(&format!("SELECT {NOW_SQL};"), [], |row| row.get(0))
            .map_err(write_err)?;
        let previous: i64 = tx
            .query_row(
                "SELECT attempt_count FROM migration_records \
                 WHERE entity_kind = ?1 AND source_id = ?2;",
                params![attempt.kind.as_str(), attempt.source_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(write_err)?
            .unwrap_or(0);
        let attempt_no = previous + 1;

        tx.execute(
            "INSERT INTO migration_attempts ( \
                 entity_kind, source_id, attempt_no, outcome, target_id, \
                 error_kind, error_message, payload_digest, run_id, attempted_at \
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            params![
                attempt.kind.as_str(),
                attempt.source_id,
                attempt_no,
                attempt.outcome.as_str(),
                attempt.target_id,
                error_kind,
                error_message,
                attempt.payload_digest,
                attempt.run_id,
                now,
            ],
        )
        .map_err(write_err)?;

        tx.execute(
            "INSERT INTO migration_records ( \
                 entity_kind, source_id, parent_source_id, target_id, outcome, \
                 attempt_count, error_kind, error_message, first_attempt_at, last_attempt_at \
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9) \
             ON CONFLICT(entity_kind, source_id) DO UPDATE SET \
                 parent_source_id = COALESCE(excluded.parent_source_id, parent_source_id), \
                 target_id = excluded.target_id, \
                 outcome = excluded.outcome, \
                 attempt_count = excluded.attempt_count, \
                 error_kind = excluded.error_kind, \
                 error_message = excluded.error_message, \
                 first_attempt_at = COALESCE(first_attempt_at, excluded.first_attempt_at), \
                 last_attempt_at = excluded.last_attempt_at;",
            params![
                attempt.kind.as_str(),
                attempt.source_id,
                attempt.parent_id,
                attempt.target_id,
                attempt.outcome.as_str(),
                attempt_no,
                error_kind,
                error_message,
                now,
            ],
        )
        .map_err(write_err)?;

        tx.commit().map_err(write_err)?;
        debug!(
            kind = attempt.kind.as_str(),
            source_id = %attempt.source_id,
            outcome = attempt.outcome.as_str(),
            attempt_no,
            "recorded attempt"
        );

        Self::lookup_with(&conn, attempt.kind, &attempt.source_id)?.ok_or_else(|| {
            FerryError::LedgerWrite(format!(
                "record for {} {} missing after commit",
                attempt.kind, attempt.source_id
            ))
        })
    }

    /// Register entities that were delivered but never attempted. Existing
    /// records are left untouched. Returns how many keys were added.
    pub fn mark_pending(
        &self,
        kind: EntityKind,
        entries: &[(String, Option<String>)],
    ) -> FerryResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(write_err)?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO migration_records \
                     (entity_kind, source_id, parent_source_id, outcome, attempt_count) \
                     VALUES (?1, ?2, ?3, 'pending', 0);",
                )
                .map_err(write_err)?;
            for (source_id, parent_id) in entries {
                inserted += stmt
                    .execute(params![kind.as_str(), source_id, parent_id])
                    .map_err(write_err)?;
            }
        }
        tx.commit().map_err(write_err)?;
        Ok(inserted)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    pub fn begin_run(&self, label: &str, dry_run: bool) -> FerryResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO migration_runs(label, dry_run, started_at) VALUES (?1, ?2, {NOW_SQL});"
            ),
            params![label, dry_run as i64],
        )
        .map_err(write_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_run(&self, run_id: i64, summary: &RunSummary) -> FerryResult<()> {
        let summary_json = serde_json::to_string(summary)?;
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "UPDATE migration_runs SET finished_at = {NOW_SQL}, summary_json = ?2 WHERE id = ?1;"
            ),
            params![run_id, summary_json],
        )
        .map_err(write_err)?;
        Ok(())
    }

    /// Stored summary of a finished run.
    pub fn run_summary(&self, run_id: i64) -> FerryResult<Option<RunSummary>> {
        let conn = self.conn.lock();
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT summary_json FROM migration_runs WHERE id = ?1;",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Backup
    // -----------------------------------------------------------------------

    /// Copy the ledger to `destination` using the SQLite backup API.
    pub fn backup_to(&self, destination: &Path) -> FerryResult<()> {
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = self.conn.lock();
        let mut dst_conn = Connection::open(destination)?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut dst_conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        Ok(())
    }
}
