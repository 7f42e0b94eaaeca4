//! Network storage detection.

use std::path::{Path, PathBuf};
use sysinfo::Disks;

const NETWORK_FS_TYPES: &[&str] = &[
    "nfs", "nfs4", "cifs", "smb", "smbfs", "smb2", "smb3", "afs", "sshfs", "fuse.sshfs", "9p",
    "davfs", "ceph", "glusterfs",
];

pub fn is_network_fs_type(fs_type: &str) -> bool {
    NETWORK_FS_TYPES.contains(&fs_type.to_ascii_lowercase().as_str())
}

fn is_unc(path: &Path) -> bool {
    let s = path.to_string_lossy();
    s.starts_with(r"\\") || s.starts_with("//")
}

/// Classify `path` against a list of (mount point, filesystem type) pairs.
/// The longest mount point containing the path decides.
pub fn classify_with_mounts(path: &Path, mounts: &[(PathBuf, String)]) -> bool {
    if is_unc(path) {
        return true;
    }
    mounts
        .iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map_or(false, |(_, fs)| is_network_fs_type(fs))
}

/// Whether any of `paths` lives on network storage.
pub fn any_on_network_storage<'a, I>(paths: I) -> bool
where
    I: IntoIterator<Item = &'a Path>,
{
    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<(PathBuf, String)> = disks
        .list()
        .iter()
        .map(|d| {
            (
                d.mount_point().to_path_buf(),
                d.file_system().to_string_lossy().into_owned(),
            )
        })
        .collect();

    paths.into_iter().any(|p| {
        let absolute = std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
        let network = classify_with_mounts(&absolute, &mounts);
        if network {
            tracing::info!(path = %p.display(), "network storage detected");
        }
        network
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounts() -> Vec<(PathBuf, String)> {
        vec![
            (PathBuf::from("/"), "ext4".to_string()),
            (PathBuf::from("/mnt/nas"), "nfs4".to_string()),
            (PathBuf::from("/mnt/nas/local-cache"), "ext4".to_string()),
            (PathBuf::from("/media/share"), "CIFS".to_string()),
        ]
    }

    #[test]
    fn test_longest_mount_wins() {
        let mounts = mounts();
        assert!(!classify_with_mounts(Path::new("/home/user/video.mkv"), &mounts));
        assert!(classify_with_mounts(Path::new("/mnt/nas/movies/a.mkv"), &mounts));
        assert!(!classify_with_mounts(Path::new("/mnt/nas/local-cache/a.mkv"), &mounts));
        assert!(classify_with_mounts(Path::new("/media/share/a.mkv"), &mounts));
    }

    #[test]
    fn test_mount_prefix_matches_components() {
        // "/mnt/nasty" is not under "/mnt/nas".
        assert!(!classify_with_mounts(Path::new("/mnt/nasty/a.mkv"), &mounts()));
    }

    #[test]
    fn test_unc_paths_are_network() {
        assert!(classify_with_mounts(Path::new(r"\\server\share\a.mkv"), &[]));
        assert!(classify_with_mounts(Path::new("//server/share/a.mkv"), &[]));
    }

    #[test]
    fn test_unknown_mounts_are_local() {
        assert!(!classify_with_mounts(Path::new("/data/a.mkv"), &[]));
        assert!(!is_network_fs_type("btrfs"));
        assert!(is_network_fs_type("fuse.sshfs"));
    }
}
