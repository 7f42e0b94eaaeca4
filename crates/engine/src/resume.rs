//! Run preparation: fresh starts and resume reconciliation.
//!
//! Both paths leave the state store holding exactly one record per discovered
//! identity and return the Pending queue in discovery order. Nothing is
//! scheduled until reconciliation has finished.

use crate::encode::staging_path_for;
use crate::jobs::{ErrorKind, JobRecord, JobStatus};
use crate::media::FileIdentity;
use crate::probe::Prober;
use crate::replace::{finalize_output, Finalized, OutputPolicy};
use crate::store::{LedgerEntry, ResultLedger, StateStore, StateStoreError};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// What resume reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    /// InProgress records found from the interrupted run.
    pub reconciled: usize,
    /// ...of which had a well-formed output and became Completed.
    pub promoted: usize,
    /// ...of which had no usable output and went back to Pending.
    pub reset: usize,
    /// ...of which had an output no smaller than the source, now Skipped.
    pub rejected: usize,
    /// ...of which could not be swapped into the source's place.
    pub failed: usize,
    /// Jobs cancelled by a previous shutdown and queued again.
    pub requeued_cancelled: usize,
    /// Terminal records reopened by `--force`.
    pub force_reset: usize,
    /// Newly discovered files.
    pub added: usize,
    /// Records whose source was not found this time.
    pub missing: usize,
}

/// Start a new run over `discovered`, replacing the previous run's records.
///
/// Files already present in the conversion history with their output still on
/// disk are recorded Skipped unless `force` is set. Staging files left by an
/// interrupted previous run are removed first.
pub fn prepare_fresh(
    store: &StateStore,
    discovered: &[FileIdentity],
    force: bool,
) -> Result<Vec<JobRecord>, StateStoreError> {
    for record in store.list_by_status(JobStatus::InProgress)? {
        if let Some(output) = &record.output_path {
            remove_stale_staging(output);
        }
    }
    store.start_fresh()?;

    let mut queue = Vec::with_capacity(discovered.len());
    for (seq, identity) in discovered.iter().enumerate() {
        let mut record = JobRecord::pending(identity.clone(), seq as i64);

        if !force {
            if let Some(output) = store.completed_conversion(identity)? {
                if output.exists() {
                    info!(job = %identity, output = %output.display(), "already converted");
                    record.output_path = Some(output.clone());
                    record.skip(&format!("already converted to {}", output.display()));
                    store.upsert(&record)?;
                    continue;
                }
            }
        }

        store.upsert(&record)?;
        queue.push(record);
    }

    Ok(queue)
}

/// Reconcile the previous run's records against the files discovered now.
///
/// InProgress records are never trusted: each is reset to Pending unless a
/// well-formed output exists at its planned path. A found output goes through
/// the same size gate and replacement as a freshly encoded one, ending
/// Completed, Skipped, or Failed when the replacement fails. Files no longer
/// on disk keep their records but are not scheduled.
pub async fn reconcile(
    store: &StateStore,
    prober: &dyn Prober,
    discovered: &[FileIdentity],
    force: bool,
    policy: &OutputPolicy,
) -> Result<(ResumeReport, Vec<JobRecord>), StateStoreError> {
    let mut report = ResumeReport::default();
    let previous = match store.load()? {
        Some(state) => {
            info!(
                run_id = state.run_id.as_deref().unwrap_or("unknown"),
                records = state.records.len(),
                "reconciling previous run"
            );
            state.records
        }
        None => Vec::new(),
    };
    let wanted: HashSet<&FileIdentity> = discovered.iter().collect();

    for mut record in previous.iter().cloned() {
        match record.status {
            JobStatus::InProgress => {
                report.reconciled += 1;
                let verified = match &record.output_path {
                    Some(output) => verify_output(prober, output).await,
                    None => None,
                };

                match (verified, record.output_path.clone()) {
                    (Some((duration_secs, codec)), Some(output)) => {
                        match finalize_output(&record.identity, &output, policy) {
                            Ok(Finalized::Kept { path, bytes }) => {
                                info!(job = %record.identity, output = %path.display(), "promoting interrupted job with complete output");
                                record.complete(path.clone());
                                store.upsert(&record)?;
                                store.append(&LedgerEntry {
                                    identity: record.identity.clone(),
                                    output_path: path,
                                    source_codec: None,
                                    target_codec: codec,
                                    profile: None,
                                    source_bytes: record.identity.size_bytes,
                                    output_bytes: bytes,
                                    duration_secs,
                                    completed_at: Utc::now(),
                                })?;
                                report.promoted += 1;
                            }
                            Ok(Finalized::Rejected { reason }) => {
                                info!(job = %record.identity, reason = %reason, "discarded interrupted job's output");
                                record.skip(&reason);
                                store.upsert(&record)?;
                                report.rejected += 1;
                            }
                            Err(e) => {
                                warn!(job = %record.identity, error = %e, "cannot finalize interrupted job's output");
                                record.fail(ErrorKind::Output, &e.to_string());
                                store.upsert(&record)?;
                                report.failed += 1;
                            }
                        }
                    }
                    _ => {
                        if let Some(output) = &record.output_path {
                            remove_stale_staging(output);
                        }
                        info!(job = %record.identity, "resetting interrupted job to pending");
                        record.requeue();
                        store.upsert(&record)?;
                        report.reset += 1;
                    }
                }
            }
            JobStatus::Failed
                if record.error_kind == Some(ErrorKind::Cancelled)
                    && wanted.contains(&record.identity) =>
            {
                record.requeue();
                store.upsert(&record)?;
                report.requeued_cancelled += 1;
            }
            _ => {}
        }

        if !wanted.contains(&record.identity) {
            report.missing += 1;
        }
    }

    if force {
        for record in &previous {
            if !wanted.contains(&record.identity) {
                continue;
            }
            if let Some(current) = store.get(&record.identity)? {
                if current.is_terminal() && store.force_reset(&record.identity)? {
                    report.force_reset += 1;
                }
            }
        }
    }

    let known: HashSet<&FileIdentity> = previous.iter().map(|r| &r.identity).collect();
    let mut next_seq = store.max_seq()? + 1;
    for identity in discovered {
        if known.contains(identity) {
            continue;
        }
        store.upsert(&JobRecord::pending(identity.clone(), next_seq))?;
        next_seq += 1;
        report.added += 1;
    }

    if report.missing > 0 {
        warn!(missing = report.missing, "previously recorded files not found; leaving their records untouched");
    }
    info!(
        reconciled = report.reconciled,
        promoted = report.promoted,
        reset = report.reset,
        rejected = report.rejected,
        added = report.added,
        "resume reconciliation finished"
    );

    let queue = store
        .list_by_status(JobStatus::Pending)?
        .into_iter()
        .filter(|r| wanted.contains(&r.identity))
        .collect();

    Ok((report, queue))
}

/// Duration and codec of an output that exists, is non-empty and probes with
/// a positive duration.
async fn verify_output(prober: &dyn Prober, output: &Path) -> Option<(f64, String)> {
    let size = tokio::fs::metadata(output).await.ok()?.len();
    if size == 0 {
        return None;
    }
    match prober.probe(output).await {
        Ok(desc) if desc.duration_secs > 0.0 => Some((desc.duration_secs, desc.video_codec)),
        Ok(_) => {
            warn!(output = %output.display(), "output has no duration");
            None
        }
        Err(e) => {
            warn!(output = %output.display(), error = %e, "output failed to probe");
            None
        }
    }
}

fn remove_stale_staging(output: &Path) {
    let staging = staging_path_for(output);
    match std::fs::remove_file(&staging) {
        Ok(()) => info!(path = %staging.display(), "removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %staging.display(), error = %e, "cannot remove partial output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ColorInfo, MediaDescriptor};
    use crate::probe::ProbeError;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Accepts any non-empty file whose contents are not "corrupt".
    struct FileProber;

    #[async_trait]
    impl Prober for FileProber {
        async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError> {
            let contents = std::fs::read_to_string(path)?;
            if contents.trim() == "corrupt" {
                return Err(ProbeError::Parse("invalid data".to_string()));
            }
            Ok(MediaDescriptor {
                identity: FileIdentity::from_path(path)?,
                container: "matroska,webm".to_string(),
                video_codec: "hevc".to_string(),
                audio_codec: None,
                width: 1920,
                height: 1080,
                frame_rate: 24.0,
                bit_depth: 8,
                hdr: false,
                color: ColorInfo::default(),
                duration_secs: 60.0,
                bitrate_bps: None,
                has_subtitles: false,
            })
        }
    }

    const KEEP: OutputPolicy = OutputPolicy {
        max_size_ratio: 1.0,
        replace_original: false,
        keep_backup: true,
    };

    fn identity(dir: &TempDir, name: &str) -> FileIdentity {
        FileIdentity::new(dir.path().join(name), 1_000, 1)
    }

    fn in_progress(store: &StateStore, identity: FileIdentity, seq: i64, output: PathBuf) {
        let mut record = JobRecord::pending(identity, seq);
        store.upsert(&record).unwrap();
        record.start(Some(output));
        store.upsert(&record).unwrap();
    }

    #[tokio::test]
    async fn test_in_progress_with_valid_output_is_promoted() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        store.begin_run(false).unwrap();

        let a = identity(&dir, "a.mkv");
        let output = dir.path().join("a-transcoded.mkv");
        std::fs::write(&output, "encoded").unwrap();
        in_progress(&store, a.clone(), 0, output.clone());

        let (report, queue) = reconcile(&store, &FileProber, &[a.clone()], false, &KEEP)
            .await
            .unwrap();

        assert_eq!(report.reconciled, 1);
        assert_eq!(report.promoted, 1);
        assert!(queue.is_empty());
        let record = store.get(&a).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.output_path, Some(output));
        assert_eq!(store.statistics().unwrap().conversions, 1);
    }

    #[tokio::test]
    async fn test_in_progress_without_usable_output_is_reset() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open_in_memory().unwrap();

        let missing = identity(&dir, "missing.mkv");
        let missing_out = dir.path().join("missing-transcoded.mkv");
        let staging = staging_path_for(&missing_out);
        std::fs::write(&staging, "half").unwrap();
        in_progress(&store, missing.clone(), 0, missing_out);

        let corrupt = identity(&dir, "corrupt.mkv");
        let corrupt_out = dir.path().join("corrupt-transcoded.mkv");
        std::fs::write(&corrupt_out, "corrupt").unwrap();
        in_progress(&store, corrupt.clone(), 1, corrupt_out);

        let empty = identity(&dir, "empty.mkv");
        let empty_out = dir.path().join("empty-transcoded.mkv");
        std::fs::write(&empty_out, "").unwrap();
        in_progress(&store, empty.clone(), 2, empty_out);

        let discovered = vec![missing.clone(), corrupt.clone(), empty.clone()];
        let (report, queue) = reconcile(&store, &FileProber, &discovered, false, &KEEP)
            .await
            .unwrap();

        assert_eq!(report.reconciled, 3);
        assert_eq!(report.reset, 3);
        assert!(!staging.exists());
        assert_eq!(
            queue.iter().map(|r| &r.identity).collect::<Vec<_>>(),
            vec![&missing, &corrupt, &empty]
        );
        assert!(store.list_by_status(JobStatus::InProgress).unwrap().is_empty());
        // The attempt that was interrupted still counts.
        assert!(queue.iter().all(|r| r.attempts == 1));
    }

    #[tokio::test]
    async fn test_promotion_applies_size_gate() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open_in_memory().unwrap();

        // Crashed after the encoder renamed its output, before the size check.
        let small = FileIdentity::new(dir.path().join("small.mkv"), 100, 1);
        let output = dir.path().join("small-transcoded.mkv");
        std::fs::write(&output, vec![b'x'; 500]).unwrap();
        in_progress(&store, small.clone(), 0, output.clone());

        let (report, queue) = reconcile(&store, &FileProber, &[small.clone()], false, &KEEP)
            .await
            .unwrap();

        assert_eq!(report.reconciled, 1);
        assert_eq!(report.promoted, 0);
        assert_eq!(report.rejected, 1);
        assert!(queue.is_empty());
        assert!(!output.exists());
        let record = store.get(&small).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Skipped);
        assert!(record.last_error.unwrap().contains("not smaller"));
        assert_eq!(store.statistics().unwrap().conversions, 0);
    }

    #[tokio::test]
    async fn test_promotion_replaces_source_when_configured() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open_in_memory().unwrap();

        let source = dir.path().join("film.mkv");
        std::fs::write(&source, vec![0u8; 1_000]).unwrap();
        let film = FileIdentity::new(source.clone(), 1_000, 1);
        let output = dir.path().join("film-transcoded.mkv");
        std::fs::write(&output, "encoded").unwrap();
        in_progress(&store, film.clone(), 0, output.clone());

        let policy = OutputPolicy {
            replace_original: true,
            keep_backup: false,
            ..KEEP
        };
        let (report, _) = reconcile(&store, &FileProber, &[film.clone()], false, &policy)
            .await
            .unwrap();

        assert_eq!(report.promoted, 1);
        assert_eq!(std::fs::read_to_string(&source).unwrap(), "encoded");
        assert!(!output.exists());
        let record = store.get(&film).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.output_path, Some(source));
    }

    #[tokio::test]
    async fn test_new_files_added_and_missing_left_alone() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open_in_memory().unwrap();

        let gone = identity(&dir, "gone.mkv");
        let kept = identity(&dir, "kept.mkv");
        let mut done = JobRecord::pending(kept.clone(), 1);
        store.upsert(&JobRecord::pending(gone.clone(), 0)).unwrap();
        store.upsert(&done).unwrap();
        done.start(None);
        store.upsert(&done).unwrap();
        done.complete(dir.path().join("kept-transcoded.mkv"));
        store.upsert(&done).unwrap();

        let fresh = identity(&dir, "fresh.mkv");
        let (report, queue) = reconcile(&store, &FileProber, &[kept.clone(), fresh.clone()], false, &KEEP)
            .await
            .unwrap();

        assert_eq!(report.added, 1);
        assert_eq!(report.missing, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].identity, fresh);
        assert_eq!(queue[0].seq, 2);
        assert_eq!(store.get(&gone).unwrap().unwrap().status, JobStatus::Pending);
        assert_eq!(store.get(&kept).unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_jobs_requeued_and_force_reopens_terminal() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open_in_memory().unwrap();

        let cancelled = identity(&dir, "cancelled.mkv");
        let mut record = JobRecord::pending(cancelled.clone(), 0);
        store.upsert(&record).unwrap();
        record.start(None);
        store.upsert(&record).unwrap();
        record.fail(ErrorKind::Cancelled, "interrupted");
        store.upsert(&record).unwrap();

        let skipped = identity(&dir, "skipped.mkv");
        let mut record = JobRecord::pending(skipped.clone(), 1);
        record.skip("already optimal");
        store.upsert(&record).unwrap();

        let (report, queue) = reconcile(
            &store,
            &FileProber,
            &[cancelled.clone(), skipped.clone()],
            false,
            &KEEP,
        )
        .await
        .unwrap();
        assert_eq!(report.requeued_cancelled, 1);
        assert_eq!(queue.len(), 1);

        let (report, queue) = reconcile(&store, &FileProber, &[cancelled, skipped.clone()], true, &KEEP)
            .await
            .unwrap();
        assert_eq!(report.force_reset, 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(store.get(&skipped).unwrap().unwrap().attempts, 0);
    }

    #[test]
    fn test_fresh_run_removes_stale_staging_files() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open_in_memory().unwrap();

        let a = identity(&dir, "a.mkv");
        let output = dir.path().join("a-transcoded.mkv");
        let staging = staging_path_for(&output);
        std::fs::write(&staging, "half").unwrap();
        in_progress(&store, a.clone(), 0, output);

        let queue = prepare_fresh(&store, &[a.clone()], false).unwrap();

        assert!(!staging.exists());
        assert_eq!(queue.len(), 1);
        assert_eq!(store.get(&a).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_fresh_run_skips_converted_files_unless_forced() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open_in_memory().unwrap();

        let a = identity(&dir, "a.mkv");
        let b = identity(&dir, "b.mkv");
        let output = dir.path().join("a-transcoded.mkv");
        std::fs::write(&output, "encoded").unwrap();
        store
            .append(&LedgerEntry {
                identity: a.clone(),
                output_path: output,
                source_codec: Some("h264".to_string()),
                target_codec: "hevc".to_string(),
                profile: None,
                source_bytes: 1_000,
                output_bytes: 400,
                duration_secs: 60.0,
                completed_at: Utc::now(),
            })
            .unwrap();

        let queue = prepare_fresh(&store, &[a.clone(), b.clone()], false).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].identity, b);
        assert_eq!(store.get(&a).unwrap().unwrap().status, JobStatus::Skipped);

        let queue = prepare_fresh(&store, &[a, b], true).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[1].seq, 1);
    }
}
