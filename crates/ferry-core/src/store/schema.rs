//! SQLite schema DDL and migration framework for the migration ledger.

use rusqlite::Connection;

use crate::errors::FerryResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 2;

/// Core DDL statements: 5 CREATE TABLE + 3 CREATE INDEX.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised ledger. The `run_id` index is created by the v2 step,
/// since older ledgers lack the column until then.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (5) ──────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS ledger_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_records (
        entity_kind TEXT NOT NULL,
        source_id TEXT NOT NULL,
        parent_source_id TEXT,
        target_id TEXT,
        outcome TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        error_kind TEXT,
        error_message TEXT,
        first_attempt_at TEXT,
        last_attempt_at TEXT,
        PRIMARY KEY(entity_kind, source_id),
        CHECK ((outcome = 'success') = (target_id IS NOT NULL))
    );",
    "CREATE TABLE IF NOT EXISTS migration_attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_kind TEXT NOT NULL,
        source_id TEXT NOT NULL,
        attempt_no INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        target_id TEXT,
        error_kind TEXT,
        error_message TEXT,
        payload_digest TEXT,
        run_id INTEGER,
        attempted_at TEXT NOT NULL,
        UNIQUE(entity_kind, source_id, attempt_no)
    );",
    "CREATE TABLE IF NOT EXISTS migration_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        label TEXT NOT NULL,
        dry_run INTEGER NOT NULL DEFAULT 0,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        summary_json TEXT
    );",
    "CREATE TABLE IF NOT EXISTS schema_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    // ── indexes (3) ─────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_records_kind_outcome ON migration_records(entity_kind, outcome, source_id);",
    "CREATE INDEX IF NOT EXISTS idx_records_parent ON migration_records(parent_source_id, entity_kind);",
    "CREATE INDEX IF NOT EXISTS idx_attempts_key ON migration_attempts(entity_kind, source_id, attempt_no);",
];

/// ISO-8601 UTC timestamp with millisecond precision, evaluated by SQLite.
pub const NOW_SQL: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending migrations from the current stored version up to
/// [`SCHEMA_VERSION`].  Each step is wrapped in a SAVEPOINT so a failure
/// rolls back only that single step.
pub fn migrate_schema(conn: &Connection) -> FerryResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT ferry_migrate_step;")?;

        let step_result = (|| -> FerryResult<()> {
            match next_version {
                1 => migrate_to_v1(conn)?,
                2 => migrate_to_v2(conn)?,
                _ => {} // future versions: no-op until migration is defined
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT ferry_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                current_version = next_version;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT ferry_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT ferry_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Read the current schema version from `ledger_meta`.
/// Returns 0 when the key is absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM ledger_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> FerryResult<()> {
    conn.execute(
        "INSERT INTO ledger_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> FerryResult<()> {
    conn.execute(
        "INSERT INTO schema_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

// ─── Individual migration steps ─────────────────────────────────────────────

/// v0 -> v1: baseline, no-op.
fn migrate_to_v1(_conn: &Connection) -> FerryResult<()> {
    Ok(())
}

/// v1 -> v2: ledgers created before run tracking get `migration_runs` and a
/// `run_id` column on the attempt history.
fn migrate_to_v2(conn: &Connection) -> FerryResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migration_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            label TEXT NOT NULL,
            dry_run INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            summary_json TEXT
        );",
    )?;
    let has_run_id = conn
        .prepare("SELECT run_id FROM migration_attempts LIMIT 0;")
        .is_ok();
    if !has_run_id {
        conn.execute_batch("ALTER TABLE migration_attempts ADD COLUMN run_id INTEGER;")?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_attempts_run ON migration_attempts(run_id);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_statement_counts() {
        // 5 tables + 3 indexes
        assert_eq!(SCHEMA_STATEMENTS.len(), 8);
    }

    #[test]
    fn migrate_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
    }

    #[test]
    fn migrate_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        migrate_schema(&conn).unwrap();
        migrate_schema(&conn).unwrap();

        let steps: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM schema_history WHERE status = 'success';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(steps, SCHEMA_VERSION as i64);
    }

    /// A v1 ledger without run tracking upgrades in place.
    #[test]
    fn upgrades_v1_ledger_without_run_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE ledger_meta (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE schema_history (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 from_version INTEGER NOT NULL,
                 to_version INTEGER NOT NULL,
                 status TEXT NOT NULL,
                 error_message TEXT,
                 created_at TEXT DEFAULT CURRENT_TIMESTAMP
             );
             CREATE TABLE migration_attempts (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 entity_kind TEXT NOT NULL,
                 source_id TEXT NOT NULL,
                 attempt_no INTEGER NOT NULL,
                 outcome TEXT NOT NULL,
                 target_id TEXT,
                 error_kind TEXT,
                 error_message TEXT,
                 payload_digest TEXT,
                 attempted_at TEXT NOT NULL
             );
             INSERT INTO ledger_meta(key, value) VALUES ('schema_version', '1');",
        )
        .unwrap();

        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
        assert!(conn
            .prepare("SELECT run_id FROM migration_attempts LIMIT 0;")
            .is_ok());
        assert!(conn.prepare("SELECT id FROM migration_runs LIMIT 0;").is_ok());
    }
}
