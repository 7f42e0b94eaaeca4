//! Discovery of source video files.
//!
//! Walks the given roots, keeps files with a known video extension and
//! returns their identities in path order. That order is the discovery order
//! the scheduler drains jobs in.

use crate::media::FileIdentity;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Video file extensions accepted by discovery (case-insensitive).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "m4v", "ts", "m2ts", "wmv", "flv", "webm", "mpg", "mpeg", "3gp",
    "vob",
];

/// Discovery options.
#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    /// Output suffix; files whose stem ends with it are earlier outputs.
    pub suffix: String,
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Whether `path` looks like an output of a previous run.
pub fn is_previous_output(path: &Path, suffix: &str) -> bool {
    !suffix.is_empty()
        && path
            .file_stem()
            .and_then(|s| s.to_str())
            .map_or(false, |stem| stem.ends_with(suffix))
}

fn accept(path: &Path, options: &DiscoverOptions) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, is_hidden);
    !hidden && is_video_file(path) && !is_previous_output(path, &options.suffix)
}

/// Discover source files under `roots`.
///
/// Directories are walked recursively, skipping hidden directories (the root
/// itself may be hidden). File roots are taken as-is when they pass the same
/// filters. Unreadable entries are logged and skipped. The result is sorted by
/// path with duplicates removed.
pub fn discover(roots: &[PathBuf], options: &DiscoverOptions) -> Vec<FileIdentity> {
    let mut found: BTreeMap<PathBuf, FileIdentity> = BTreeMap::new();

    for root in roots {
        if root.is_file() {
            if accept(root, options) {
                match FileIdentity::from_path(root) {
                    Ok(identity) => {
                        found.insert(root.clone(), identity);
                    }
                    Err(e) => warn!(path = %root.display(), error = %e, "cannot stat file"),
                }
            }
            continue;
        }

        if !root.exists() {
            warn!(path = %root.display(), "path does not exist");
            continue;
        }

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            if entry.depth() > 0 && entry.file_type().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    return !is_hidden(name);
                }
            }
            true
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !accept(entry.path(), options) {
                continue;
            }
            let path = entry.path().to_path_buf();
            match entry.metadata() {
                Ok(meta) => {
                    let modified_ns = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_nanos() as i64)
                        .unwrap_or(0);
                    found.insert(
                        path.clone(),
                        FileIdentity::new(path, meta.len(), modified_ns),
                    );
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cannot stat file"),
            }
        }
    }

    debug!(count = found.len(), "discovery finished");
    found.into_values().collect()
}
