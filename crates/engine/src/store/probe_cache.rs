//! Probe cache.
//!
//! Descriptors are stored as JSON under the file identity key, so a file that
//! changed size or modification time is simply a miss.

use super::{StateStore, StateStoreError};
use crate::media::{FileIdentity, MediaDescriptor};
use crate::probe::{ProbeError, Prober};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

impl StateStore {
    pub fn cached_descriptor(
        &self,
        identity: &FileIdentity,
    ) -> Result<Option<MediaDescriptor>, StateStoreError> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT descriptor FROM probe_cache WHERE identity = ?1",
                [identity.key()],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| {
            serde_json::from_str(&j)
                .map_err(|e| StateStoreError::Corrupt(format!("cached descriptor: {}", e)))
        })
        .transpose()
    }

    pub fn store_descriptor(
        &self,
        identity: &FileIdentity,
        descriptor: &MediaDescriptor,
    ) -> Result<(), StateStoreError> {
        let json = serde_json::to_string(descriptor)
            .map_err(|e| StateStoreError::Corrupt(format!("descriptor encoding: {}", e)))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO probe_cache (identity, descriptor, probed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(identity) DO UPDATE SET
                descriptor = excluded.descriptor,
                probed_at = excluded.probed_at",
            params![identity.key(), json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

/// A [`Prober`] that answers from the probe cache when the file is unchanged
/// and records fresh results. Cache errors are logged and fall through to the
/// inner prober; probe failures are never cached.
pub struct CachedProber {
    inner: Arc<dyn Prober>,
    store: Arc<StateStore>,
}

impl CachedProber {
    pub fn new(inner: Arc<dyn Prober>, store: Arc<StateStore>) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl Prober for CachedProber {
    async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError> {
        let identity = FileIdentity::from_path(path)?;
        match self.store.cached_descriptor(&identity) {
            Ok(Some(descriptor)) => {
                debug!(path = %path.display(), "probe cache hit");
                return Ok(descriptor);
            }
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "probe cache unreadable"),
        }

        let descriptor = self.inner.probe(path).await?;
        if let Err(e) = self.store.store_descriptor(&identity, &descriptor) {
            warn!(path = %path.display(), error = %e, "cannot cache probe result");
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ColorInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingProber {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Prober for CountingProber {
        async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if path.to_string_lossy().contains("corrupt") {
                return Err(ProbeError::NoVideoStream);
            }
            Ok(MediaDescriptor {
                identity: FileIdentity::from_path(path)?,
                container: "mov,mp4,m4a,3gp,3g2,mj2".to_string(),
                video_codec: "h264".to_string(),
                audio_codec: None,
                width: 1280,
                height: 720,
                frame_rate: 30.0,
                bit_depth: 8,
                hdr: false,
                color: ColorInfo::default(),
                duration_secs: 12.5,
                bitrate_bps: Some(3_000_000),
                has_subtitles: false,
            })
        }
    }

    fn cached(inner: &Arc<CountingProber>) -> CachedProber {
        CachedProber::new(inner.clone(), Arc::new(StateStore::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_unchanged_file_described_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"frames").unwrap();

        let inner = Arc::new(CountingProber::default());
        let prober = cached(&inner);
        let first = prober.probe(&path).await.unwrap();
        let second = prober.probe(&path).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_changed_file_is_described_again() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"frames").unwrap();

        let inner = Arc::new(CountingProber::default());
        let prober = cached(&inner);
        prober.probe(&path).await.unwrap();
        std::fs::write(&path, b"more frames than before").unwrap();
        let again = prober.probe(&path).await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(again.identity.size_bytes, 23);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt.mp4");
        std::fs::write(&path, b"junk").unwrap();

        let inner = Arc::new(CountingProber::default());
        let prober = cached(&inner);
        assert!(prober.probe(&path).await.is_err());
        assert!(prober.probe(&path).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_descriptor_round_trips_through_store() {
        let store = StateStore::open_in_memory().unwrap();
        let identity = FileIdentity::new("/media/a.mkv".into(), 10, 3);
        assert_eq!(store.cached_descriptor(&identity).unwrap(), None);

        let descriptor = MediaDescriptor {
            identity: identity.clone(),
            container: "matroska,webm".to_string(),
            video_codec: "hevc".to_string(),
            audio_codec: Some("opus".to_string()),
            width: 3840,
            height: 2160,
            frame_rate: 23.976,
            bit_depth: 10,
            hdr: true,
            color: ColorInfo::default(),
            duration_secs: 5400.0,
            bitrate_bps: None,
            has_subtitles: true,
        };
        store.store_descriptor(&identity, &descriptor).unwrap();
        assert_eq!(store.cached_descriptor(&identity).unwrap(), Some(descriptor));
    }
}
