//! Startup checks.
//!
//! Run once before any job is scheduled:
//! - ffmpeg and ffprobe must run
//! - ffmpeg must be version 4 or newer
//! - the encoder for the configured codec and hardware must be compiled in

use crate::advisor::effective_hardware;
use crate::config::Config;
use crate::encode::encoder_for;
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

/// Oldest ffmpeg major version with the options the command builder emits.
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("encoder {encoder} is not available in this ffmpeg build")]
    EncoderUnavailable { encoder: String },

    #[error("no {codec} encoder exists for {hardware}")]
    NoEncoder { codec: String, hardware: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the startup checks found.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolReport {
    pub ffmpeg_version: String,
    pub ffmpeg_major: u32,
    pub ffprobe_version: String,
    /// Encoders compiled into ffmpeg.
    pub encoders: BTreeSet<String>,
    /// The video encoder this configuration will use.
    pub required_encoder: String,
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles "ffmpeg version 6.1.1 ..." and n-prefixed builds such as
/// "ffmpeg version n7.0-12-g...".
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version = version_token(version_output)?;
    let version_str = version.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;
    major_str.parse().ok()
}

/// The token after "<tool> version" on the first matching line.
fn version_token(version_output: &str) -> Option<String> {
    let line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(" version "))?;
    line.to_lowercase()
        .split(" version ")
        .nth(1)?
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Parse `ffmpeg -encoders` output into encoder names.
///
/// Entries look like ` V....D libx265   libx265 H.265 / HEVC`; the legend lines
/// (` V..... = Video`) and the header are ignored.
pub fn parse_encoder_list(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            let is_entry = flags.len() == 6
                && matches!(flags.chars().next(), Some('V' | 'A' | 'S'))
                && flags.chars().skip(1).all(|c| c == '.' || c.is_ascii_uppercase())
                && name != "=";
            is_entry.then(|| name.to_string())
        })
        .collect()
}

/// Run `tool args...` and return its stdout.
fn run_tool(tool: &Path, args: &[&str]) -> Result<String, StartupError> {
    let name = tool.display().to_string();
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: name.clone(),
            reason: format!("{} (is it installed and in PATH?)", e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: name,
            reason: format!("`{}` exited with {}", args.join(" "), output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that `tool -version` runs and return its version token.
pub fn check_tool(tool: &Path) -> Result<String, StartupError> {
    let output = run_tool(tool, &["-version"])?;
    Ok(version_token(&output).unwrap_or_else(|| "unknown".to_string()))
}

/// Run all startup checks in order
///
/// 1. ffmpeg runs and is new enough
/// 2. ffprobe runs
/// 3. the configured encoder is available
pub fn run_startup_checks(cfg: &Config) -> Result<ToolReport, StartupError> {
    let ffmpeg = &cfg.tools.ffmpeg_path;
    let version_output = run_tool(ffmpeg, &["-version"])?;
    let ffmpeg_major = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;
    if ffmpeg_major < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, ffmpeg_major
        )));
    }
    let ffmpeg_version = version_token(&version_output).unwrap_or_else(|| ffmpeg_major.to_string());
    debug!(version = %ffmpeg_version, "ffmpeg found");

    let ffprobe_version = check_tool(&cfg.tools.ffprobe_path)?;
    debug!(version = %ffprobe_version, "ffprobe found");

    let encoders = parse_encoder_list(&run_tool(ffmpeg, &["-hide_banner", "-encoders"])?);
    let required_encoder = required_encoder(cfg)?;
    if !encoders.contains(&required_encoder) {
        return Err(StartupError::EncoderUnavailable {
            encoder: required_encoder,
        });
    }

    info!(
        ffmpeg = %ffmpeg_version,
        encoder = %required_encoder,
        encoders = encoders.len(),
        "startup checks passed"
    );

    Ok(ToolReport {
        ffmpeg_version,
        ffmpeg_major,
        ffprobe_version,
        encoders,
        required_encoder,
    })
}

/// The video encoder the configured codec and hardware selection resolve to.
pub fn required_encoder(cfg: &Config) -> Result<String, StartupError> {
    let codec = cfg.quality.target_codec;
    let hardware = effective_hardware(codec, cfg.hardware.selected());
    encoder_for(codec, hardware)
        .map(str::to_string)
        .ok_or_else(|| StartupError::NoEncoder {
            codec: codec.to_string(),
            hardware: hardware.map_or("software".to_string(), |g| g.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GpuType, HardwareConfig, TargetCodec};
    use proptest::prelude::*;
    use std::path::PathBuf;

    const ENCODERS: &str = "Encoders:
 V..... = Video
 A..... = Audio
 S..... = Subtitle
 .F.... = Frame-level multithreading
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D libx265              libx265 H.265 / HEVC (codec hevc)
 V....D hevc_nvenc           NVIDIA NVENC hevc encoder (codec hevc)
 V.S... libsvtav1            SVT-AV1 (codec av1)
 A....D aac                  AAC (Advanced Audio Coding)
 S..... srt                  SubRip subtitle
";

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(major in 1u32..100, minor in 0u32..10) {
            let output = format!("ffmpeg version {}.{} Copyright (c) 2000-2024", major, minor);
            prop_assert_eq!(parse_ffmpeg_version(&output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(major in 1u32..100, minor in 0u32..10) {
            let output = format!("ffmpeg version n{}.{}-3-gabcdef Copyright", major, minor);
            prop_assert_eq!(parse_ffmpeg_version(&output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_multiline(major in 1u32..100) {
            let output = format!("\nffmpeg version {}.0\nbuilt with gcc 13\nconfiguration: --enable-gpl", major);
            prop_assert_eq!(parse_ffmpeg_version(&output), Some(major));
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version(""), None);
        assert_eq!(parse_ffmpeg_version("not ffmpeg"), None);
        assert_eq!(parse_ffmpeg_version("ffmpeg version git-2024"), None);
    }

    #[test]
    fn test_parse_encoder_list() {
        let encoders = parse_encoder_list(ENCODERS);
        assert!(encoders.contains("libx265"));
        assert!(encoders.contains("hevc_nvenc"));
        assert!(encoders.contains("libsvtav1"));
        assert!(encoders.contains("aac"));
        assert!(encoders.contains("srt"));
        assert!(!encoders.contains("="));
        assert!(!encoders.contains("------"));
        assert_eq!(encoders.len(), 6);
    }

    #[test]
    fn test_required_encoder() {
        let mut cfg = Config::default();
        assert_eq!(required_encoder(&cfg).unwrap(), "libx265");

        cfg.hardware = HardwareConfig {
            enabled: true,
            gpu_type: GpuType::Nvidia,
        };
        assert_eq!(required_encoder(&cfg).unwrap(), "hevc_nvenc");

        // No VideoToolbox AV1 encoder: falls back to software.
        cfg.quality.target_codec = TargetCodec::Av1;
        cfg.hardware.gpu_type = GpuType::Videotoolbox;
        assert_eq!(required_encoder(&cfg).unwrap(), "libsvtav1");
    }

    #[test]
    fn test_missing_tool_reported() {
        let err = check_tool(&PathBuf::from("/nonexistent/ffprobe")).unwrap_err();
        assert!(matches!(err, StartupError::ToolUnavailable { .. }));
    }

    #[test]
    fn test_startup_fails_without_ffmpeg() {
        let mut cfg = Config::default();
        cfg.tools.ffmpeg_path = PathBuf::from("/nonexistent/ffmpeg");
        assert!(matches!(
            run_startup_checks(&cfg),
            Err(StartupError::ToolUnavailable { .. })
        ));
    }
}
