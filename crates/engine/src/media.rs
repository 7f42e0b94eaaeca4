//! Media description types shared by the prober, advisor and command builder.

use crate::config::TargetCodec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Stable identity of a source file: path, size and modification time.
///
/// Used as the resume key. Touching or rewriting the source yields a new identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub modified_ns: i64,
}

impl FileIdentity {
    pub fn new(path: PathBuf, size_bytes: u64, modified_ns: i64) -> Self {
        Self {
            path,
            size_bytes,
            modified_ns,
        }
    }

    /// Capture the identity of an existing file.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified_ns = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Ok(Self::new(path.to_path_buf(), metadata.len(), modified_ns))
    }

    /// Key under which the job record for this identity is stored.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.size_bytes,
            self.modified_ns,
            self.path.to_string_lossy()
        )
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Colour description carried through to the output when the source is HDR.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColorInfo {
    pub primaries: Option<String>,
    pub transfer: Option<String>,
    pub matrix: Option<String>,
}

/// Immutable snapshot of one probed source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub identity: FileIdentity,
    /// Container format name as reported by the prober (e.g. "matroska,webm").
    pub container: String,
    pub video_codec: String,
    /// First audio stream's codec, None when the file has no audio.
    pub audio_codec: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub bit_depth: u8,
    pub hdr: bool,
    pub color: ColorInfo,
    pub duration_secs: f64,
    /// Video bitrate in bits per second when known.
    pub bitrate_bps: Option<u64>,
    pub has_subtitles: bool,
}

impl MediaDescriptor {
    pub fn path(&self) -> &Path {
        &self.identity.path
    }

    pub fn file_size(&self) -> u64 {
        self.identity.size_bytes
    }

    pub fn resolution_class(&self) -> ResolutionClass {
        ResolutionClass::from_dimensions(self.width, self.height)
    }

    pub fn source_family(&self) -> SourceFamily {
        SourceFamily::from_codec_name(&self.video_codec)
    }
}

/// Coarse resolution buckets used by the estimate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionClass {
    Sd,
    Hd,
    FullHd,
    Uhd,
}

impl ResolutionClass {
    /// Classify by whichever dimension reaches the higher class, so cropped
    /// widescreen (1920x800) still counts as 1080p.
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        if width >= 3200 || height >= 1800 {
            ResolutionClass::Uhd
        } else if width >= 1600 || height >= 900 {
            ResolutionClass::FullHd
        } else if width >= 1120 || height >= 630 {
            ResolutionClass::Hd
        } else {
            ResolutionClass::Sd
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionClass::Sd => "sd",
            ResolutionClass::Hd => "720p",
            ResolutionClass::FullHd => "1080p",
            ResolutionClass::Uhd => "2160p",
        }
    }
}

/// Source codec grouped by compression efficiency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFamily {
    /// MPEG-2, MPEG-4 Part 2, VC-1, WMV and similar.
    Legacy,
    H264,
    Hevc,
    Vp9,
    Av1,
    Other,
}

impl SourceFamily {
    pub fn from_codec_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "h264" | "avc" | "avc1" | "x264" => SourceFamily::H264,
            "hevc" | "h265" | "x265" => SourceFamily::Hevc,
            "vp9" => SourceFamily::Vp9,
            "av1" | "libaom-av1" | "libdav1d" => SourceFamily::Av1,
            "mpeg1video" | "mpeg2video" | "mpeg4" | "msmpeg4v2" | "msmpeg4v3" | "msmpeg4"
            | "vc1" | "wmv1" | "wmv2" | "wmv3" | "h263" | "flv1" | "theora" | "vp8"
            | "mjpeg" | "dvvideo" => SourceFamily::Legacy,
            _ => SourceFamily::Other,
        }
    }

    /// The encodable target in the same family, if any.
    pub fn as_target(&self) -> Option<TargetCodec> {
        match self {
            SourceFamily::H264 => Some(TargetCodec::H264),
            SourceFamily::Hevc => Some(TargetCodec::Hevc),
            SourceFamily::Vp9 => Some(TargetCodec::Vp9),
            SourceFamily::Av1 => Some(TargetCodec::Av1),
            SourceFamily::Legacy | SourceFamily::Other => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resolution_classes() {
        assert_eq!(ResolutionClass::from_dimensions(720, 480), ResolutionClass::Sd);
        assert_eq!(ResolutionClass::from_dimensions(1280, 720), ResolutionClass::Hd);
        assert_eq!(ResolutionClass::from_dimensions(1920, 1080), ResolutionClass::FullHd);
        assert_eq!(ResolutionClass::from_dimensions(1920, 800), ResolutionClass::FullHd);
        assert_eq!(ResolutionClass::from_dimensions(3840, 2160), ResolutionClass::Uhd);
        assert_eq!(ResolutionClass::from_dimensions(3840, 1600), ResolutionClass::Uhd);
    }

    #[test]
    fn test_source_family() {
        assert_eq!(SourceFamily::from_codec_name("H264"), SourceFamily::H264);
        assert_eq!(SourceFamily::from_codec_name("hevc"), SourceFamily::Hevc);
        assert_eq!(SourceFamily::from_codec_name("mpeg2video"), SourceFamily::Legacy);
        assert_eq!(SourceFamily::from_codec_name("prores"), SourceFamily::Other);
        assert_eq!(SourceFamily::Hevc.as_target(), Some(TargetCodec::Hevc));
        assert_eq!(SourceFamily::Legacy.as_target(), None);
    }

    #[test]
    fn test_identity_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mkv");
        std::fs::write(&path, b"0123456789").unwrap();

        let identity = FileIdentity::from_path(&path).unwrap();
        assert_eq!(identity.size_bytes, 10);
        assert_eq!(identity.path, path);
        assert_eq!(identity, FileIdentity::from_path(&path).unwrap());
    }

    // Identities that differ in any component never share a key.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_identity_key_distinguishes_components(
            name in "[a-z0-9_]{1,12}",
            size in 0u64..1_000_000,
            mtime in 0i64..2_000_000_000_000_000_000,
            delta in 1u64..1000,
        ) {
            let base = FileIdentity::new(PathBuf::from(format!("/media/{}.mkv", name)), size, mtime);
            let resized = FileIdentity::new(base.path.clone(), size + delta, mtime);
            let touched = FileIdentity::new(base.path.clone(), size, mtime + delta as i64);
            let moved = FileIdentity::new(PathBuf::from(format!("/media/{}x.mkv", name)), size, mtime);

            prop_assert_ne!(base.key(), resized.key());
            prop_assert_ne!(base.key(), touched.key());
            prop_assert_ne!(base.key(), moved.key());
        }
    }
}
