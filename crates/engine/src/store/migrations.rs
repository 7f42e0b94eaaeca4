//! Embedded schema migrations.
//!
//! Each migration is applied once inside its own transaction and recorded in
//! `schema_migrations`.

use rusqlite::Connection;

/// V1: run table, live job records and the append-only conversion history.
const V1_INITIAL: &str = r#"
CREATE TABLE runs (
    id         TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    resumed    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE run_jobs (
    identity    TEXT PRIMARY KEY,
    path        TEXT NOT NULL,
    size_bytes  INTEGER NOT NULL,
    modified_ns INTEGER NOT NULL,
    seq         INTEGER NOT NULL,
    status      TEXT NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    error_kind  TEXT,
    verdict     TEXT,
    output_path TEXT,
    started_at  TEXT,
    finished_at TEXT,
    updated_at  TEXT NOT NULL
);

CREATE INDEX idx_run_jobs_status ON run_jobs(status, seq);

CREATE TABLE conversion_history (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    identity      TEXT NOT NULL,
    source_path   TEXT NOT NULL,
    output_path   TEXT NOT NULL,
    source_codec  TEXT,
    target_codec  TEXT NOT NULL,
    profile       TEXT,
    source_bytes  INTEGER NOT NULL,
    output_bytes  INTEGER NOT NULL,
    duration_secs REAL NOT NULL,
    completed_at  TEXT NOT NULL
);

CREATE INDEX idx_conversion_history_identity ON conversion_history(identity);
"#;

/// V2: probe results keyed by file identity.
const V2_PROBE_CACHE: &str = r#"
CREATE TABLE probe_cache (
    identity   TEXT PRIMARY KEY,
    descriptor TEXT NOT NULL,
    probed_at  TEXT NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL), (2, V2_PROBE_CACHE)];

/// Apply all pending migrations.
pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )?;

    for &(version, sql) in MIGRATIONS {
        let applied: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
            [version],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute("INSERT INTO schema_migrations (version) VALUES (?1)", [version])?;
        tx.commit()?;
        tracing::debug!(version, "applied schema migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_tables_exist() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["runs", "run_jobs", "conversion_history", "probe_cache"] {
            let found: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(found, 1, "missing table {}", table);
        }
    }
}
