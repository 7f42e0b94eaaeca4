//! Output finalization: the size gate, then an optional swap of the verified
//! output into the source's place.
//!
//! Both the scheduler (after a successful encode) and resume reconciliation
//! (when promoting an interrupted job) go through [`finalize_output`], so an
//! output is kept, discarded or swapped in the same way regardless of which
//! path found it.

use crate::config::OutputConfig;
use crate::media::FileIdentity;
use crate::size_gate::{check_size_gate, SizeGateResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from finalizing an output. The encoded file is left in place on
/// every error.
#[derive(Debug, Error)]
pub enum ReplaceError {
    #[error("cannot read output {path}: {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to back up source: {0}")]
    BackupFailed(std::io::Error),

    #[error("failed to move output into place: {0}")]
    MoveFailed(std::io::Error),

    #[error("failed to delete backup: {0}")]
    DeleteBackupFailed(std::io::Error),

    #[error("replacement target {0} already exists")]
    TargetExists(PathBuf),
}

/// What happens to an output once the encoder has produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputPolicy {
    pub max_size_ratio: f64,
    pub replace_original: bool,
    pub keep_backup: bool,
}

impl Default for OutputPolicy {
    fn default() -> Self {
        Self {
            max_size_ratio: 1.0,
            replace_original: false,
            keep_backup: true,
        }
    }
}

impl OutputPolicy {
    pub fn from_config(output: &OutputConfig) -> Self {
        Self {
            max_size_ratio: output.max_size_ratio,
            replace_original: output.replace_original,
            keep_backup: output.keep_backup,
        }
    }
}

/// Result of [`finalize_output`].
#[derive(Debug, Clone, PartialEq)]
pub enum Finalized {
    /// The output passed the size gate and now lives at `path`.
    Kept { path: PathBuf, bytes: u64 },
    /// The output failed the size gate and was deleted.
    Rejected { reason: String },
}

/// Backup name for a replaced source: `<name>.orig.<unix seconds>`.
pub fn backup_path(original: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut backup = original.as_os_str().to_owned();
    backup.push(format!(".orig.{}", timestamp));
    PathBuf::from(backup)
}

/// Where a replacing output ends up: the source's path with the output's
/// extension.
pub fn replaced_path(source: &Path, output: &Path) -> PathBuf {
    match output.extension() {
        Some(ext) => source.with_extension(ext),
        None => source.to_path_buf(),
    }
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Cross-filesystem moves fall back to copy and delete.
    fs::copy(from, to)?;
    fs::remove_file(from)
}

/// Swap `encoded` into the place of `source` and return the final path.
///
/// The source is moved to its backup path first. If the output cannot be
/// moved into place the source is restored and both files are preserved.
/// With `keep_backup` false the backup is deleted once the swap succeeded.
pub fn replace_source(
    source: &Path,
    encoded: &Path,
    keep_backup: bool,
) -> Result<PathBuf, ReplaceError> {
    let target = replaced_path(source, encoded);
    if target != source && target.exists() {
        return Err(ReplaceError::TargetExists(target));
    }

    let backup = backup_path(source);
    move_file(source, &backup).map_err(ReplaceError::BackupFailed)?;

    if let Err(e) = move_file(encoded, &target) {
        if let Err(restore) = fs::rename(&backup, source) {
            warn!(backup = %backup.display(), error = %restore, "cannot restore source from backup");
        }
        return Err(ReplaceError::MoveFailed(e));
    }

    if keep_backup {
        debug!(backup = %backup.display(), "kept source backup");
    } else {
        fs::remove_file(&backup).map_err(ReplaceError::DeleteBackupFailed)?;
    }

    info!(source = %source.display(), replaced_by = %target.display(), "replaced source");
    Ok(target)
}

/// Apply the size gate to `output` and, when it passes and the policy asks
/// for it, replace the source with it. Rejected outputs are deleted.
pub fn finalize_output(
    source: &FileIdentity,
    output: &Path,
    policy: &OutputPolicy,
) -> Result<Finalized, ReplaceError> {
    let bytes = fs::metadata(output)
        .map_err(|e| ReplaceError::Output {
            path: output.to_path_buf(),
            source: e,
        })?
        .len();

    let gate = check_size_gate(source.size_bytes, bytes, policy.max_size_ratio);
    if let SizeGateResult::Reject { .. } = gate {
        if let Err(e) = fs::remove_file(output) {
            warn!(path = %output.display(), error = %e, "cannot remove rejected output");
        }
        return Ok(Finalized::Rejected {
            reason: gate.reason().unwrap_or_default(),
        });
    }

    let path = if policy.replace_original {
        replace_source(&source.path, output, policy.keep_backup)?
    } else {
        output.to_path_buf()
    };
    Ok(Finalized::Kept { path, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backups(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.to_string_lossy().contains(".orig."))
            .collect()
    }

    fn source(dir: &TempDir, name: &str, contents: &[u8]) -> FileIdentity {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        FileIdentity::new(path, contents.len() as u64, 1)
    }

    #[test]
    fn test_backup_path_format() {
        let backup = backup_path(Path::new("/media/movies/film.mkv"));
        let text = backup.to_string_lossy();
        assert!(text.starts_with("/media/movies/film.mkv.orig."));
        let stamp: u64 = text.rsplit(".orig.").next().unwrap().parse().unwrap();
        assert!(stamp > 0);
    }

    #[test]
    fn test_replaced_path_takes_output_extension() {
        assert_eq!(
            replaced_path(Path::new("/m/film.avi"), Path::new("/m/film-transcoded.mkv")),
            PathBuf::from("/m/film.mkv")
        );
        assert_eq!(
            replaced_path(Path::new("/m/film.mkv"), Path::new("/out/film.mkv")),
            PathBuf::from("/m/film.mkv")
        );
    }

    #[test]
    fn test_replace_keeps_backup() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, "film.mkv", b"original content");
        let encoded = dir.path().join("film-transcoded.mkv");
        fs::write(&encoded, b"encoded").unwrap();

        let target = replace_source(&src.path, &encoded, true).unwrap();

        assert_eq!(target, src.path);
        assert_eq!(fs::read(&target).unwrap(), b"encoded");
        assert!(!encoded.exists());
        let backups = backups(dir.path());
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read(&backups[0]).unwrap(), b"original content");
    }

    #[test]
    fn test_replace_without_backup_changes_extension() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, "film.avi", b"original content");
        let encoded = dir.path().join("film-transcoded.mkv");
        fs::write(&encoded, b"encoded").unwrap();

        let target = replace_source(&src.path, &encoded, false).unwrap();

        assert_eq!(target, dir.path().join("film.mkv"));
        assert!(!src.path.exists());
        assert!(backups(dir.path()).is_empty());
    }

    #[test]
    fn test_failed_move_restores_source() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, "film.mkv", b"original content");
        let missing = dir.path().join("never-written.mkv");

        let err = replace_source(&src.path, &missing, false).unwrap_err();

        assert!(matches!(err, ReplaceError::MoveFailed(_)));
        assert_eq!(fs::read(&src.path).unwrap(), b"original content");
        assert!(backups(dir.path()).is_empty());
    }

    #[test]
    fn test_existing_target_is_not_clobbered() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, "film.avi", b"original content");
        fs::write(dir.path().join("film.mkv"), b"someone else").unwrap();
        let encoded = dir.path().join("film-transcoded.mkv");
        fs::write(&encoded, b"encoded").unwrap();

        let err = replace_source(&src.path, &encoded, false).unwrap_err();

        assert!(matches!(err, ReplaceError::TargetExists(_)));
        assert!(src.path.exists());
        assert!(encoded.exists());
    }

    #[test]
    fn test_finalize_rejects_and_deletes_bloated_output() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, "film.mkv", &[0u8; 100]);
        let output = dir.path().join("film-transcoded.mkv");
        fs::write(&output, [0u8; 500]).unwrap();

        let result = finalize_output(&src, &output, &OutputPolicy::default()).unwrap();

        assert!(matches!(result, Finalized::Rejected { ref reason } if reason.contains("not smaller")));
        assert!(!output.exists());
        assert!(src.path.exists());
    }

    #[test]
    fn test_finalize_keeps_or_replaces() {
        let dir = TempDir::new().unwrap();
        let src = source(&dir, "film.mkv", &[0u8; 100]);
        let output = dir.path().join("film-transcoded.mkv");
        fs::write(&output, [1u8; 40]).unwrap();

        let kept = finalize_output(&src, &output, &OutputPolicy::default()).unwrap();
        assert_eq!(
            kept,
            Finalized::Kept {
                path: output.clone(),
                bytes: 40
            }
        );

        let policy = OutputPolicy {
            replace_original: true,
            ..OutputPolicy::default()
        };
        let replaced = finalize_output(&src, &output, &policy).unwrap();
        assert_eq!(
            replaced,
            Finalized::Kept {
                path: src.path.clone(),
                bytes: 40
            }
        );
        assert_eq!(fs::read(&src.path).unwrap(), vec![1u8; 40]);
        assert_eq!(backups(dir.path()).len(), 1);
    }
}
