//! Command builder.
//!
//! Maps a [`Recommendation`] plus hardware selection to the exact ffmpeg
//! argument list that will run. Pure and deterministic: dry-run previews print
//! the same list the executor spawns.

use crate::advisor::{EncoderProfile, Recommendation, SpeedPreset, Verdict};
use crate::config::{Container, GpuType, OutputConfig, TargetCodec};
use crate::media::MediaDescriptor;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    /// Only Convert verdicts produce a command.
    #[error("recommendation verdict is {0}, nothing to build")]
    NotConvertible(Verdict),

    /// The recommendation was computed for a different hardware selection.
    #[error("recommendation targets {expected:?} but command requested {requested:?}")]
    HardwareMismatch {
        expected: Option<GpuType>,
        requested: Option<GpuType>,
    },

    /// No encoder exists for this codec and hardware combination.
    #[error("no {codec} encoder for {hardware}")]
    NoEncoder { codec: TargetCodec, hardware: String },

    /// The derived output path would overwrite the source.
    #[error("output path {0} is the source file")]
    WouldOverwriteSource(PathBuf),
}

/// ffmpeg encoder name for a codec, in software (`None`) or on a GPU vendor.
pub fn encoder_for(codec: TargetCodec, hardware: Option<GpuType>) -> Option<&'static str> {
    match (codec, hardware) {
        (TargetCodec::Hevc, None) => Some("libx265"),
        (TargetCodec::Hevc, Some(GpuType::Nvidia)) => Some("hevc_nvenc"),
        (TargetCodec::Hevc, Some(GpuType::Amd)) => Some("hevc_amf"),
        (TargetCodec::Hevc, Some(GpuType::Intel)) => Some("hevc_qsv"),
        (TargetCodec::Hevc, Some(GpuType::Videotoolbox)) => Some("hevc_videotoolbox"),
        (TargetCodec::Av1, None) => Some("libsvtav1"),
        (TargetCodec::Av1, Some(GpuType::Nvidia)) => Some("av1_nvenc"),
        (TargetCodec::Av1, Some(GpuType::Amd)) => Some("av1_amf"),
        (TargetCodec::Av1, Some(GpuType::Intel)) => Some("av1_qsv"),
        (TargetCodec::Av1, Some(GpuType::Videotoolbox)) => None,
        (TargetCodec::H264, None) => Some("libx264"),
        (TargetCodec::H264, Some(GpuType::Nvidia)) => Some("h264_nvenc"),
        (TargetCodec::H264, Some(GpuType::Amd)) => Some("h264_amf"),
        (TargetCodec::H264, Some(GpuType::Intel)) => Some("h264_qsv"),
        (TargetCodec::H264, Some(GpuType::Videotoolbox)) => Some("h264_videotoolbox"),
        (TargetCodec::Vp9, None) => Some("libvpx-vp9"),
        (TargetCodec::Vp9, Some(GpuType::Intel)) => Some("vp9_qsv"),
        (TargetCodec::Vp9, Some(_)) => None,
    }
}

/// Final output location for `input` under the output policy.
pub fn output_path_for(input: &Path, output: &OutputConfig) -> PathBuf {
    let dir = match &output.directory {
        Some(dir) => dir.clone(),
        None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!(
        "{}{}.{}",
        stem,
        output.suffix,
        output.container.extension()
    ))
}

/// Hidden sibling the encoder writes to; renamed onto the output on success.
pub fn staging_path_for(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!(".{}.partial", name))
}

/// A fully resolved encoder invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodeCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub input: PathBuf,
    pub output: PathBuf,
    /// Where the encoder writes while running.
    pub staging: PathBuf,
    /// Source duration, used to turn encoder timestamps into percentages.
    pub duration_secs: f64,
}

impl EncodeCommand {
    /// Shell-style rendering for dry-run output.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .map(|a| shell_quote(&a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Builds ffmpeg commands from recommendations.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    ffmpeg: PathBuf,
    output: OutputConfig,
    /// Encoder threads per job (software encoders only).
    threads: u32,
}

impl CommandBuilder {
    pub fn new(ffmpeg: PathBuf, output: OutputConfig, threads: u32) -> Self {
        Self {
            ffmpeg,
            output,
            threads,
        }
    }

    pub fn output_path_for(&self, input: &Path) -> PathBuf {
        output_path_for(input, &self.output)
    }

    /// Build the argument list for a Convert recommendation.
    ///
    /// Argument order: global flags, hardware decode, input, stream maps, video
    /// encoder and rate control, pixel format and HDR signalling, audio,
    /// subtitles, container flags, progress reporting, output.
    pub fn build(
        &self,
        recommendation: &Recommendation,
        hardware: Option<GpuType>,
    ) -> Result<EncodeCommand, BuildError> {
        let choice = match (&recommendation.verdict, &recommendation.choice) {
            (Verdict::Convert, Some(choice)) => choice,
            (verdict, _) => return Err(BuildError::NotConvertible(*verdict)),
        };
        if recommendation.hardware != hardware {
            return Err(BuildError::HardwareMismatch {
                expected: recommendation.hardware,
                requested: hardware,
            });
        }
        let profile = &choice.profile;
        let encoder = encoder_for(profile.codec, hardware).ok_or_else(|| BuildError::NoEncoder {
            codec: profile.codec,
            hardware: hardware.map_or("software".to_string(), |g| g.to_string()),
        })?;

        let source = &recommendation.source;
        let input = source.path().to_path_buf();
        let output = self.output_path_for(&input);
        if output == input {
            return Err(BuildError::WouldOverwriteSource(output));
        }
        let staging = staging_path_for(&output);

        let mut args: Vec<String> = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        push(&["-hide_banner", "-nostdin", "-y", "-loglevel", "error"]);

        if let Some(hwaccel) = hardware.and_then(hw_decode) {
            push(&["-hwaccel", hwaccel]);
        }

        let input_arg = input.to_string_lossy().into_owned();
        push(&["-i", input_arg.as_str()]);

        let container = self.output.container;
        push(&["-map", "0:v:0", "-map", "0:a?"]);
        if container == Container::Mkv && source.has_subtitles {
            push(&["-map", "0:s?"]);
        }

        push(&["-c:v", encoder]);
        let video_args = video_args(encoder, profile, hardware, source);
        push(&video_args.iter().map(String::as_str).collect::<Vec<_>>());

        if hardware.is_none() {
            let threads = self.threads.max(1).to_string();
            push(&["-threads", threads.as_str()]);
        }

        let ten_bit = source.bit_depth > 8 || source.hdr;
        let pix_fmt = match (ten_bit, hardware) {
            (false, _) => "yuv420p",
            (true, None) => "yuv420p10le",
            (true, Some(_)) => "p010le",
        };
        push(&["-pix_fmt", pix_fmt]);

        if source.hdr {
            let hdr = hdr_args(source);
            push(&hdr.iter().map(String::as_str).collect::<Vec<_>>());
        }

        let audio = audio_args(source, &self.output);
        push(&audio.iter().map(String::as_str).collect::<Vec<_>>());

        match container {
            Container::Mkv if source.has_subtitles => push(&["-c:s", "copy"]),
            Container::Mkv => {}
            Container::Mp4 => push(&["-sn", "-movflags", "+faststart"]),
        }

        push(&["-progress", "pipe:1", "-nostats"]);
        let staging_arg = staging.to_string_lossy().into_owned();
        push(&["-f", container.muxer(), staging_arg.as_str()]);

        Ok(EncodeCommand {
            program: self.ffmpeg.clone(),
            args,
            input,
            output,
            staging,
            duration_secs: source.duration_secs,
        })
    }
}

fn hw_decode(gpu: GpuType) -> Option<&'static str> {
    match gpu {
        GpuType::Nvidia => Some("cuda"),
        GpuType::Intel => Some("qsv"),
        GpuType::Videotoolbox => Some("videotoolbox"),
        GpuType::Amd => None,
    }
}

/// Encoder-specific rate control and preset flags.
fn video_args(
    encoder: &str,
    profile: &EncoderProfile,
    hardware: Option<GpuType>,
    source: &MediaDescriptor,
) -> Vec<String> {
    let quality = profile.quality.to_string();
    let q = quality.as_str();
    let preset = profile.preset;
    let v = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    match hardware {
        Some(GpuType::Nvidia) => v(&[
            "-rc", "vbr", "-cq", q, "-b:v", "0",
            "-preset", nvenc_preset(preset),
            "-tune", "hq", "-spatial-aq", "1", "-temporal-aq", "1",
        ]),
        Some(GpuType::Amd) => v(&[
            "-rc", "cqp", "-qp_i", q, "-qp_p", q,
            "-quality", amf_quality(preset),
        ]),
        Some(GpuType::Intel) => v(&[
            "-global_quality", q,
            "-preset", qsv_preset(preset),
        ]),
        Some(GpuType::Videotoolbox) => {
            let vt_quality = (100i32 - i32::from(profile.quality) * 2).clamp(1, 100).to_string();
            v(&["-q:v", vt_quality.as_str()])
        }
        None => match encoder {
            "libx265" => {
                let params = x265_params(source);
                v(&["-crf", q, "-preset", preset.as_str(), "-x265-params", params.as_str()])
            }
            "libx264" => v(&["-crf", q, "-preset", preset.as_str()]),
            "libsvtav1" => v(&["-crf", q, "-preset", svt_preset(preset)]),
            "libvpx-vp9" => v(&[
                "-crf", q, "-b:v", "0", "-deadline", "good",
                "-cpu-used", vpx_cpu_used(preset), "-row-mt", "1",
            ]),
            _ => v(&["-crf", q]),
        },
    }
}

fn nvenc_preset(preset: SpeedPreset) -> &'static str {
    match preset {
        SpeedPreset::VerySlow => "p7",
        SpeedPreset::Slow => "p6",
        SpeedPreset::Medium => "p4",
        SpeedPreset::Fast => "p2",
    }
}

fn amf_quality(preset: SpeedPreset) -> &'static str {
    match preset {
        SpeedPreset::VerySlow | SpeedPreset::Slow => "quality",
        SpeedPreset::Medium => "balanced",
        SpeedPreset::Fast => "speed",
    }
}

fn qsv_preset(preset: SpeedPreset) -> &'static str {
    match preset {
        SpeedPreset::VerySlow => "veryslow",
        SpeedPreset::Slow => "slow",
        SpeedPreset::Medium => "medium",
        SpeedPreset::Fast => "fast",
    }
}

fn svt_preset(preset: SpeedPreset) -> &'static str {
    match preset {
        SpeedPreset::VerySlow => "2",
        SpeedPreset::Slow => "4",
        SpeedPreset::Medium => "6",
        SpeedPreset::Fast => "8",
    }
}

fn vpx_cpu_used(preset: SpeedPreset) -> &'static str {
    match preset {
        SpeedPreset::VerySlow => "0",
        SpeedPreset::Slow => "1",
        SpeedPreset::Medium => "2",
        SpeedPreset::Fast => "4",
    }
}

fn color_values(source: &MediaDescriptor) -> (&str, &str, &str) {
    (
        source.color.primaries.as_deref().unwrap_or("bt2020"),
        source.color.transfer.as_deref().unwrap_or("smpte2084"),
        source.color.matrix.as_deref().unwrap_or("bt2020nc"),
    )
}

/// Colour signalling for HDR sources, defaulting to BT.2020 PQ.
fn hdr_args(source: &MediaDescriptor) -> Vec<String> {
    let (primaries, transfer, matrix) = color_values(source);
    vec![
        "-color_primaries".to_string(),
        primaries.to_string(),
        "-color_trc".to_string(),
        transfer.to_string(),
        "-colorspace".to_string(),
        matrix.to_string(),
    ]
}

fn x265_params(source: &MediaDescriptor) -> String {
    let mut params = String::from("log-level=error");
    if source.hdr {
        let (primaries, transfer, matrix) = color_values(source);
        params.push_str(&format!(
            ":hdr-opt=1:repeat-headers=1:colorprim={}:transfer={}:colormatrix={}",
            primaries, transfer, matrix
        ));
    }
    params
}

/// Copy audio unless a different codec is explicitly targeted.
fn audio_args(source: &MediaDescriptor, output: &OutputConfig) -> Vec<String> {
    let Some(source_codec) = source.audio_codec.as_deref() else {
        return vec!["-an".to_string()];
    };
    match output.audio_codec.as_deref() {
        Some(target) if !target.eq_ignore_ascii_case(source_codec) => vec![
            "-c:a".to_string(),
            audio_encoder(target).to_string(),
            "-b:a".to_string(),
            output.audio_bitrate.clone(),
        ],
        _ => vec!["-c:a".to_string(), "copy".to_string()],
    }
}

fn audio_encoder(codec: &str) -> &str {
    match codec {
        "opus" => "libopus",
        "mp3" => "libmp3lame",
        "vorbis" => "libvorbis",
        other => other,
    }
}
