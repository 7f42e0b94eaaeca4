//! Media probing via ffprobe.
//!
//! Runs ffprobe against a source file and turns its JSON report into a
//! [`MediaDescriptor`]. Probing is a blocking external call bounded by a timeout.

use crate::media::{ColorInfo, FileIdentity, MediaDescriptor};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not be started.
    #[error("failed to start ffprobe: {0}")]
    Spawn(std::io::Error),

    /// ffprobe ran but rejected the file.
    #[error("ffprobe failed: {0}")]
    Failed(String),

    /// ffprobe did not answer within the timeout.
    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),

    /// Failed to parse ffprobe JSON output.
    #[error("failed to parse ffprobe output: {0}")]
    Parse(String),

    /// The file has no usable video stream.
    #[error("no video stream found")]
    NoVideoStream,

    /// The source file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that can describe a media file.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub pix_fmt: Option<String>,
        pub bits_per_raw_sample: Option<String>,
        pub color_primaries: Option<String>,
        pub color_transfer: Option<String>,
        pub color_space: Option<String>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        #[serde(default)]
        pub attached_pic: u8,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// ffprobe-backed [`Prober`].
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(ffprobe: PathBuf, timeout: Duration) -> Self {
        Self { ffprobe, timeout }
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    /// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`.
    async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError> {
        let identity = FileIdentity::from_path(path)?;

        let child = Command::new(&self.ffprobe)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ProbeError::Spawn)?;

        // Dropping the wait future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(ProbeError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Failed(format!(
                "exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout, identity)
    }
}

/// Parses ffprobe JSON output into a descriptor for `identity`.
pub fn parse_ffprobe_output(
    json_str: &str,
    identity: FileIdentity,
) -> Result<MediaDescriptor, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe
        .format
        .ok_or_else(|| ProbeError::Parse("missing format information".to_string()))?;

    // Cover art is reported as a video stream; skip it.
    let video = streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("video"))
        .find(|s| s.disposition.as_ref().map_or(true, |d| d.attached_pic == 0))
        .ok_or(ProbeError::NoVideoStream)?;

    let audio_codec = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .and_then(|s| s.codec_name.clone());

    let has_subtitles = streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("subtitle"));

    let frame_rate = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_rational)
        .or_else(|| video.avg_frame_rate.as_deref().and_then(parse_rational))
        .unwrap_or(30.0);

    let bit_depth = video
        .bits_per_raw_sample
        .as_deref()
        .and_then(|b| b.parse::<u8>().ok())
        .or_else(|| video.pix_fmt.as_deref().map(bit_depth_from_pix_fmt))
        .unwrap_or(8);

    let color = ColorInfo {
        primaries: video.color_primaries.clone(),
        transfer: video.color_transfer.clone(),
        matrix: video.color_space.clone(),
    };
    let hdr = is_hdr(&color);

    let bitrate_bps = video
        .bit_rate
        .as_deref()
        .and_then(|b| b.parse::<u64>().ok())
        .or_else(|| format.bit_rate.as_deref().and_then(|b| b.parse::<u64>().ok()));

    let duration_secs = format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(MediaDescriptor {
        identity,
        container: format.format_name.unwrap_or_default(),
        video_codec: video.codec_name.clone().unwrap_or_default(),
        audio_codec,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        frame_rate,
        bit_depth,
        hdr,
        color,
        duration_secs,
        bitrate_bps,
        has_subtitles,
    })
}

/// Parse an ffprobe rational like "24000/1001"; "0/0" yields None.
fn parse_rational(s: &str) -> Option<f64> {
    let (num, den) = s.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}

fn bit_depth_from_pix_fmt(pix_fmt: &str) -> u8 {
    if pix_fmt.contains("12le") || pix_fmt.contains("12be") {
        12
    } else if pix_fmt.contains("10le") || pix_fmt.contains("10be") || pix_fmt == "p010le" {
        10
    } else {
        8
    }
}

fn is_hdr(color: &ColorInfo) -> bool {
    matches!(
        color.transfer.as_deref(),
        Some("smpte2084") | Some("arib-std-b67")
    ) || color.primaries.as_deref() == Some("bt2020")
}
