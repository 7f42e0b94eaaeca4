//! Durable job state backed by SQLite.
//!
//! The store holds one [`JobRecord`] per file identity for the current run in
//! `run_jobs`, the append-only `conversion_history` used by the
//! [`ResultLedger`], and cached probe results in `probe_cache`. Every write
//! is a committed transaction on a WAL database with `synchronous = FULL`, so
//! a returned `Ok` means the record survives a crash.

pub mod ledger;
pub mod migrations;
pub mod probe_cache;

pub use ledger::{HistoryStats, LedgerEntry, ResultLedger};
pub use probe_cache::CachedProber;

use crate::jobs::{ErrorKind, JobRecord, JobStatus};
use crate::media::FileIdentity;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors from the state store. All of them are fatal to a run.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("illegal status transition {from} -> {to} for {identity}")]
    IllegalTransition {
        from: JobStatus,
        to: JobStatus,
        identity: String,
    },

    #[error("state store lock poisoned")]
    Poisoned,

    #[error("corrupt state record: {0}")]
    Corrupt(String),

    #[error("cannot create state directory: {0}")]
    Io(#[from] std::io::Error),
}

/// The persisted state of the most recent run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    /// None when job records exist without a recorded run header.
    pub run_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub resumed: bool,
    /// All job records, in discovery order.
    pub records: Vec<JobRecord>,
}

impl RunState {
    pub fn count(&self, status: JobStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    pub fn find(&self, identity: &FileIdentity) -> Option<&JobRecord> {
        self.records.iter().find(|r| &r.identity == identity)
    }
}

const JOB_COLS: &str = "identity, path, size_bytes, modified_ns, seq, status, attempts,
    last_error, error_kind, verdict, output_path, started_at, finished_at";

/// SQLite-backed state store.
#[derive(Debug)]
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (creating if needed) the database at `path` and apply migrations.
    pub fn open(path: &Path) -> Result<Self, StateStoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;",
        )?;
        migrations::run_migrations(&conn)?;
        debug!(path = %path.display(), "opened state store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for previews and tests.
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StateStoreError> {
        self.conn.lock().map_err(|_| StateStoreError::Poisoned)
    }

    /// Record the start of a run and return its id.
    pub fn begin_run(&self, resumed: bool) -> Result<String, StateStoreError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (id, started_at, resumed) VALUES (?1, ?2, ?3)",
            params![id, Utc::now().to_rfc3339(), resumed],
        )?;
        info!(run_id = %id, resumed, "run started");
        Ok(id)
    }

    /// Drop the previous run's job records. History is kept.
    pub fn start_fresh(&self) -> Result<(), StateStoreError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM run_jobs", [])?;
        debug!(removed, "cleared previous run state");
        Ok(())
    }

    /// Load the most recent run, or `None` when neither a run header nor any
    /// job record exists.
    pub fn load(&self) -> Result<Option<RunState>, StateStoreError> {
        let conn = self.lock()?;
        let run = conn
            .query_row(
                "SELECT id, started_at, resumed FROM runs ORDER BY rowid DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                    ))
                },
            )
            .optional()?;

        let records = query_records(
            &conn,
            &format!("SELECT {JOB_COLS} FROM run_jobs ORDER BY seq ASC"),
            [],
        )?;

        match run {
            Some((run_id, started_at, resumed)) => Ok(Some(RunState {
                run_id: Some(run_id),
                started_at: Some(parse_timestamp(&started_at)?),
                resumed,
                records,
            })),
            None if records.is_empty() => Ok(None),
            None => Ok(Some(RunState {
                run_id: None,
                started_at: None,
                resumed: false,
                records,
            })),
        }
    }

    /// Insert or update a record. Rejects status moves the lifecycle does not allow.
    pub fn upsert(&self, record: &JobRecord) -> Result<(), StateStoreError> {
        let key = record.key();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM run_jobs WHERE identity = ?1",
                [&key],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(current) = current {
            let from: JobStatus = current.parse().map_err(StateStoreError::Corrupt)?;
            if !from.can_transition_to(record.status) {
                return Err(StateStoreError::IllegalTransition {
                    from,
                    to: record.status,
                    identity: record.identity.to_string(),
                });
            }
        }

        write_record(&tx, &key, record)?;
        tx.commit()?;
        debug!(job = %record.identity, status = %record.status, "state recorded");
        Ok(())
    }

    /// Return a record to Pending regardless of its status, clearing attempts
    /// and errors. Returns false when the identity is unknown.
    pub fn force_reset(&self, identity: &FileIdentity) -> Result<bool, StateStoreError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE run_jobs SET status = ?2, attempts = 0, last_error = NULL,
                error_kind = NULL, verdict = NULL, output_path = NULL,
                started_at = NULL, finished_at = NULL, updated_at = ?3
             WHERE identity = ?1",
            params![
                identity.key(),
                JobStatus::Pending.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn get(&self, identity: &FileIdentity) -> Result<Option<JobRecord>, StateStoreError> {
        let conn = self.lock()?;
        let mut records = query_records(
            &conn,
            &format!("SELECT {JOB_COLS} FROM run_jobs WHERE identity = ?1"),
            [identity.key()],
        )?;
        Ok(records.pop())
    }

    /// Records with the given status, in discovery order.
    pub fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, StateStoreError> {
        let conn = self.lock()?;
        query_records(
            &conn,
            &format!("SELECT {JOB_COLS} FROM run_jobs WHERE status = ?1 ORDER BY seq ASC"),
            [status.as_str()],
        )
    }

    /// Highest sequence number in use, or -1 for an empty run.
    pub fn max_seq(&self) -> Result<i64, StateStoreError> {
        let conn = self.lock()?;
        let seq: Option<i64> = conn.query_row("SELECT MAX(seq) FROM run_jobs", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(-1))
    }
}

fn write_record(conn: &Connection, key: &str, record: &JobRecord) -> Result<(), StateStoreError> {
    conn.execute(
        "INSERT INTO run_jobs (identity, path, size_bytes, modified_ns, seq, status, attempts,
            last_error, error_kind, verdict, output_path, started_at, finished_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(identity) DO UPDATE SET
            seq = excluded.seq,
            status = excluded.status,
            attempts = excluded.attempts,
            last_error = excluded.last_error,
            error_kind = excluded.error_kind,
            verdict = excluded.verdict,
            output_path = excluded.output_path,
            started_at = excluded.started_at,
            finished_at = excluded.finished_at,
            updated_at = excluded.updated_at",
        params![
            key,
            record.identity.path.to_string_lossy().into_owned(),
            record.identity.size_bytes as i64,
            record.identity.modified_ns,
            record.seq,
            record.status.as_str(),
            record.attempts,
            record.last_error,
            record.error_kind.map(|k| k.as_str()),
            record.verdict,
            record.output_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
            record.started_at.map(|t| t.to_rfc3339()),
            record.finished_at.map(|t| t.to_rfc3339()),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Columns of one `run_jobs` row before validation.
struct JobRow {
    path: String,
    size_bytes: i64,
    modified_ns: i64,
    seq: i64,
    status: String,
    attempts: u32,
    last_error: Option<String>,
    error_kind: Option<String>,
    verdict: Option<String>,
    output_path: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            path: row.get(1)?,
            size_bytes: row.get(2)?,
            modified_ns: row.get(3)?,
            seq: row.get(4)?,
            status: row.get(5)?,
            attempts: row.get(6)?,
            last_error: row.get(7)?,
            error_kind: row.get(8)?,
            verdict: row.get(9)?,
            output_path: row.get(10)?,
            started_at: row.get(11)?,
            finished_at: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<JobRecord, StateStoreError> {
        Ok(JobRecord {
            identity: FileIdentity::new(
                PathBuf::from(self.path),
                self.size_bytes.max(0) as u64,
                self.modified_ns,
            ),
            seq: self.seq,
            status: self.status.parse().map_err(StateStoreError::Corrupt)?,
            attempts: self.attempts,
            last_error: self.last_error,
            error_kind: self
                .error_kind
                .map(|k| k.parse::<ErrorKind>())
                .transpose()
                .map_err(StateStoreError::Corrupt)?,
            verdict: self.verdict,
            output_path: self.output_path.map(PathBuf::from),
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn query_records<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<JobRecord>, StateStoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(JobRow::into_record).collect()
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StateStoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StateStoreError::Corrupt(format!("bad timestamp {:?}: {}", value, e)))
}
