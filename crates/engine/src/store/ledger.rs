//! Append-only history of completed conversions.

use super::{parse_timestamp, StateStore, StateStoreError};
use crate::media::FileIdentity;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;

/// One completed conversion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub identity: FileIdentity,
    pub output_path: PathBuf,
    pub source_codec: Option<String>,
    pub target_codec: String,
    /// Encoder profile summary, e.g. "hevc balanced crf 23 medium".
    pub profile: Option<String>,
    pub source_bytes: u64,
    pub output_bytes: u64,
    pub duration_secs: f64,
    pub completed_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn bytes_saved(&self) -> i64 {
        self.source_bytes as i64 - self.output_bytes as i64
    }
}

/// Write-only sink for completed jobs. Entries may arrive in any order.
pub trait ResultLedger: Send + Sync {
    fn append(&self, entry: &LedgerEntry) -> Result<(), StateStoreError>;
}

/// Aggregates over the whole conversion history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub conversions: u64,
    pub bytes_saved: i64,
    /// Mean of (1 - output/source) in percent.
    pub avg_compression: f64,
}

impl ResultLedger for StateStore {
    fn append(&self, entry: &LedgerEntry) -> Result<(), StateStoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO conversion_history (identity, source_path, output_path, source_codec,
                target_codec, profile, source_bytes, output_bytes, duration_secs, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.identity.key(),
                entry.identity.path.to_string_lossy().into_owned(),
                entry.output_path.to_string_lossy().into_owned(),
                entry.source_codec,
                entry.target_codec,
                entry.profile,
                entry.source_bytes as i64,
                entry.output_bytes as i64,
                entry.duration_secs,
                entry.completed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

impl StateStore {
    /// Output path of the latest recorded conversion of this exact identity.
    pub fn completed_conversion(
        &self,
        identity: &FileIdentity,
    ) -> Result<Option<PathBuf>, StateStoreError> {
        let conn = self.lock()?;
        let path: Option<String> = conn
            .query_row(
                "SELECT output_path FROM conversion_history WHERE identity = ?1
                 ORDER BY id DESC LIMIT 1",
                [identity.key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.map(PathBuf::from))
    }

    pub fn statistics(&self) -> Result<HistoryStats, StateStoreError> {
        let conn = self.lock()?;
        let (conversions, bytes_saved, avg_compression) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(source_bytes - output_bytes), 0),
                    COALESCE(AVG(CASE WHEN source_bytes > 0
                        THEN 100.0 * (1.0 - CAST(output_bytes AS REAL) / source_bytes) END), 0.0)
             FROM conversion_history",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            },
        )?;
        Ok(HistoryStats {
            conversions: conversions.max(0) as u64,
            bytes_saved,
            avg_compression,
        })
    }

    /// Most recent history entries, newest first.
    pub fn recent_conversions(&self, limit: usize) -> Result<Vec<LedgerEntry>, StateStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT source_path, identity, output_path, source_codec, target_codec, profile,
                    source_bytes, output_bytes, duration_secs, completed_at
             FROM conversion_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, f64>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(source, key, output, source_codec, target_codec, profile, sb, ob, dur, at)| {
                    Ok(LedgerEntry {
                        identity: identity_from_key(&key, source)?,
                        output_path: PathBuf::from(output),
                        source_codec,
                        target_codec,
                        profile,
                        source_bytes: sb.max(0) as u64,
                        output_bytes: ob.max(0) as u64,
                        duration_secs: dur,
                        completed_at: parse_timestamp(&at)?,
                    })
                },
            )
            .collect()
    }
}

/// Rebuild an identity from its `size:mtime:path` key.
fn identity_from_key(key: &str, path: String) -> Result<FileIdentity, StateStoreError> {
    let mut parts = key.splitn(3, ':');
    let size = parts.next().and_then(|s| s.parse::<u64>().ok());
    let mtime = parts.next().and_then(|s| s.parse::<i64>().ok());
    match (size, mtime) {
        (Some(size), Some(mtime)) => Ok(FileIdentity::new(PathBuf::from(path), size, mtime)),
        _ => Err(StateStoreError::Corrupt(format!("bad identity key {:?}", key))),
    }
}
