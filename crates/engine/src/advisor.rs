//! Codec advisor.
//!
//! Decides per file whether and how to re-encode. All predictions come from a
//! static estimate table keyed by resolution class, source codec family, target
//! codec and profile tier. They are heuristics, not measurements: a predicted
//! 2% quality loss means "profiles like this typically lose about 2% VMAF on
//! sources like this", nothing more.
//!
//! Adding a codec or profile is a change to [`PROFILE_TABLE`] and the
//! adjustment functions below, not to the decision procedure.

use crate::encode::encoder_for;
use crate::config::{GpuType, ProfileTier, QualityConfig, TargetCodec};
use crate::media::{MediaDescriptor, ResolutionClass, SourceFamily};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Rate-control mode of an encoder profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControl {
    /// Software constant rate factor.
    Crf,
    /// Hardware constant quality (cq / qp / global_quality).
    ConstantQuality,
}

/// Encoder speed preset, slowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedPreset {
    VerySlow,
    Slow,
    Medium,
    Fast,
}

impl SpeedPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedPreset::VerySlow => "veryslow",
            SpeedPreset::Slow => "slow",
            SpeedPreset::Medium => "medium",
            SpeedPreset::Fast => "fast",
        }
    }
}

/// Concrete encoder parameters chosen by the advisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncoderProfile {
    pub codec: TargetCodec,
    pub tier: ProfileTier,
    pub rate_control: RateControl,
    /// CRF for software encoders, the equivalent quality index for hardware.
    pub quality: u8,
    pub preset: SpeedPreset,
}

impl fmt::Display for EncoderProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.rate_control {
            RateControl::Crf => "crf",
            RateControl::ConstantQuality => "cq",
        };
        write!(
            f,
            "{} {} ({} {}, {})",
            self.codec,
            self.tier,
            mode,
            self.quality,
            self.preset.as_str()
        )
    }
}

/// One row of the estimate table. Loss and compression are the reference
/// values for an h264 1080p source encoded in software.
#[derive(Debug, Clone, Copy)]
pub struct ProfileRow {
    pub codec: TargetCodec,
    pub tier: ProfileTier,
    pub quality: u8,
    pub preset: SpeedPreset,
    /// Predicted quality loss, percent.
    pub loss: f64,
    /// Predicted size reduction, percent.
    pub compression: f64,
}

const fn row(
    codec: TargetCodec,
    tier: ProfileTier,
    quality: u8,
    preset: SpeedPreset,
    loss: f64,
    compression: f64,
) -> ProfileRow {
    ProfileRow {
        codec,
        tier,
        quality,
        preset,
        loss,
        compression,
    }
}

pub const PROFILE_TABLE: &[ProfileRow] = &[
    row(TargetCodec::Hevc, ProfileTier::Quality, 18, SpeedPreset::Slow, 0.5, 45.0),
    row(TargetCodec::Hevc, ProfileTier::Archive, 22, SpeedPreset::VerySlow, 2.0, 63.0),
    row(TargetCodec::Hevc, ProfileTier::Balanced, 23, SpeedPreset::Medium, 2.0, 60.0),
    row(TargetCodec::Hevc, ProfileTier::Fast, 28, SpeedPreset::Fast, 5.0, 70.0),
    row(TargetCodec::Av1, ProfileTier::Quality, 25, SpeedPreset::Slow, 1.0, 65.0),
    row(TargetCodec::Av1, ProfileTier::Balanced, 30, SpeedPreset::Medium, 3.0, 72.0),
    row(TargetCodec::Av1, ProfileTier::Fast, 35, SpeedPreset::Fast, 5.0, 78.0),
    row(TargetCodec::H264, ProfileTier::Quality, 18, SpeedPreset::Slow, 0.5, 40.0),
    row(TargetCodec::H264, ProfileTier::Balanced, 23, SpeedPreset::Medium, 2.0, 50.0),
    row(TargetCodec::Vp9, ProfileTier::Quality, 25, SpeedPreset::Slow, 1.5, 60.0),
    row(TargetCodec::Vp9, ProfileTier::Balanced, 31, SpeedPreset::Medium, 3.0, 66.0),
];

/// Loss multiplier and compression shift per resolution class.
fn resolution_adjustment(class: ResolutionClass) -> (f64, f64) {
    match class {
        ResolutionClass::Sd => (1.3, -5.0),
        ResolutionClass::Hd => (1.1, -2.0),
        ResolutionClass::FullHd => (1.0, 0.0),
        ResolutionClass::Uhd => (0.9, 5.0),
    }
}

/// Compression shift per source family; efficient sources leave less to gain.
fn source_adjustment(family: SourceFamily) -> f64 {
    match family {
        SourceFamily::Legacy => 15.0,
        SourceFamily::H264 | SourceFamily::Other => 0.0,
        SourceFamily::Vp9 => -20.0,
        SourceFamily::Hevc => -25.0,
        SourceFamily::Av1 => -35.0,
    }
}

/// Added loss and compression shift for hardware encoders.
fn hardware_adjustment(gpu: Option<GpuType>) -> (f64, f64) {
    match gpu {
        None => (0.0, 0.0),
        Some(GpuType::Nvidia) | Some(GpuType::Intel) => (1.0, -5.0),
        Some(GpuType::Amd) => (1.5, -5.0),
        Some(GpuType::Videotoolbox) => (1.5, -8.0),
    }
}

/// Reference bitrate (bits/s) a well-encoded HEVC file needs at each class.
fn hevc_reference_bitrate(class: ResolutionClass) -> f64 {
    match class {
        ResolutionClass::Sd | ResolutionClass::Hd => 1_500_000.0,
        ResolutionClass::FullHd => 3_000_000.0,
        ResolutionClass::Uhd => 8_000_000.0,
    }
}

fn family_bitrate_factor(codec: TargetCodec) -> f64 {
    match codec {
        TargetCodec::Hevc => 1.0,
        TargetCodec::Av1 => 0.7,
        TargetCodec::Vp9 => 0.9,
        TargetCodec::H264 => 1.5,
    }
}

/// Sources within this multiple of the reference bitrate are already optimal.
const OPTIMAL_BITRATE_HEADROOM: f64 = 1.5;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Caller limits for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Maximum acceptable predicted quality loss, percent.
    pub max_quality_loss: f64,
    /// Minimum acceptable predicted compression, percent.
    pub min_compression: f64,
    pub target_codec: TargetCodec,
    pub hardware: Option<GpuType>,
    /// Only consider this tier.
    pub profile: Option<ProfileTier>,
    /// Re-encode sources that are already optimal (`--force`).
    pub reencode_optimal: bool,
}

impl Constraints {
    pub fn from_config(quality: &QualityConfig, hardware: Option<GpuType>, force: bool) -> Self {
        Self {
            max_quality_loss: quality.max_quality_loss,
            min_compression: quality.min_compression,
            target_codec: quality.target_codec,
            hardware,
            profile: quality.profile,
            reencode_optimal: force,
        }
    }
}

/// A profile together with its predicted outcome for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEstimate {
    pub profile: EncoderProfile,
    pub predicted_quality_loss: f64,
    pub predicted_compression: f64,
}

impl ProfileEstimate {
    pub fn satisfies(&self, constraints: &Constraints) -> bool {
        self.predicted_quality_loss <= constraints.max_quality_loss
            && self.predicted_compression >= constraints.min_compression
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Convert,
    SkipAlreadyOptimal,
    SkipConstraintsUnmet,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Convert => "convert",
            Verdict::SkipAlreadyOptimal => "skip-already-optimal",
            Verdict::SkipConstraintsUnmet => "skip-constraints-unmet",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisor output for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub source: MediaDescriptor,
    pub target: TargetCodec,
    /// Hardware encoder family, None for software encoding.
    pub hardware: Option<GpuType>,
    /// The chosen profile; present only when the verdict is Convert.
    pub choice: Option<ProfileEstimate>,
    pub verdict: Verdict,
    pub reason: String,
}

impl Recommendation {
    pub fn predicted_quality_loss(&self) -> Option<f64> {
        self.choice.as_ref().map(|c| c.predicted_quality_loss)
    }

    pub fn predicted_compression(&self) -> Option<f64> {
        self.choice.as_ref().map(|c| c.predicted_compression)
    }
}

/// The hardware family actually usable for `codec`, falling back to software
/// when the vendor has no encoder for it.
pub fn effective_hardware(codec: TargetCodec, requested: Option<GpuType>) -> Option<GpuType> {
    requested.filter(|gpu| encoder_for(codec, Some(*gpu)).is_some())
}

/// Estimate every profile of `codec` (optionally a single tier) for this source,
/// ordered by ascending predicted loss, then faster preset first.
pub fn estimates(
    descriptor: &MediaDescriptor,
    codec: TargetCodec,
    hardware: Option<GpuType>,
    tier: Option<ProfileTier>,
) -> Vec<ProfileEstimate> {
    let (loss_factor, res_shift) = resolution_adjustment(descriptor.resolution_class());
    let src_shift = source_adjustment(descriptor.source_family());
    let (hw_loss, hw_shift) = hardware_adjustment(hardware);
    let rate_control = if hardware.is_some() {
        RateControl::ConstantQuality
    } else {
        RateControl::Crf
    };

    let mut out: Vec<ProfileEstimate> = PROFILE_TABLE
        .iter()
        .filter(|r| r.codec == codec)
        .filter(|r| tier.map_or(true, |t| r.tier == t))
        .map(|r| ProfileEstimate {
            profile: EncoderProfile {
                codec: r.codec,
                tier: r.tier,
                rate_control,
                quality: r.quality,
                preset: r.preset,
            },
            predicted_quality_loss: round2(r.loss * loss_factor + hw_loss),
            predicted_compression: round2(
                (r.compression + res_shift + src_shift + hw_shift).clamp(0.0, 95.0),
            ),
        })
        .collect();

    out.sort_by(|a, b| {
        a.predicted_quality_loss
            .total_cmp(&b.predicted_quality_loss)
            .then_with(|| b.profile.preset.cmp(&a.profile.preset))
    });
    out
}

/// Profiles that satisfy both constraints, in preference order.
pub fn eligible_profiles(
    descriptor: &MediaDescriptor,
    constraints: &Constraints,
) -> Vec<ProfileEstimate> {
    let hardware = effective_hardware(constraints.target_codec, constraints.hardware);
    estimates(
        descriptor,
        constraints.target_codec,
        hardware,
        constraints.profile,
    )
    .into_iter()
    .filter(|e| e.satisfies(constraints))
    .collect()
}

/// Returns why the source needs no re-encode for `target`, if that is the case.
pub fn already_optimal(descriptor: &MediaDescriptor, target: TargetCodec) -> Option<String> {
    if descriptor.source_family().as_target() != Some(target) {
        return None;
    }
    let ceiling = hevc_reference_bitrate(descriptor.resolution_class())
        * family_bitrate_factor(target)
        * OPTIMAL_BITRATE_HEADROOM;
    match descriptor.bitrate_bps {
        None => Some(format!("already {} (bitrate unknown)", target)),
        Some(bps) if (bps as f64) <= ceiling => Some(format!(
            "already {} at {:.1} Mbps (ceiling {:.1} Mbps for {})",
            target,
            bps as f64 / 1e6,
            ceiling / 1e6,
            descriptor.resolution_class().as_str()
        )),
        Some(_) => None,
    }
}

/// Recommend how to handle one source under `constraints`.
pub fn recommend(descriptor: &MediaDescriptor, constraints: &Constraints) -> Recommendation {
    let target = constraints.target_codec;
    let hardware = effective_hardware(target, constraints.hardware);

    if !constraints.reencode_optimal {
        if let Some(reason) = already_optimal(descriptor, target) {
            return Recommendation {
                source: descriptor.clone(),
                target,
                hardware,
                choice: None,
                verdict: Verdict::SkipAlreadyOptimal,
                reason,
            };
        }
    }

    let candidates = estimates(descriptor, target, hardware, constraints.profile);
    match candidates.iter().find(|e| e.satisfies(constraints)) {
        Some(choice) => Recommendation {
            source: descriptor.clone(),
            target,
            hardware,
            reason: format!(
                "{}: predicted loss {:.1}%, compression {:.0}%",
                choice.profile, choice.predicted_quality_loss, choice.predicted_compression
            ),
            choice: Some(choice.clone()),
            verdict: Verdict::Convert,
        },
        None => {
            let best_loss = candidates
                .iter()
                .map(|c| c.predicted_quality_loss)
                .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            let best_compression = candidates
                .iter()
                .map(|c| c.predicted_compression)
                .max_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            Recommendation {
                source: descriptor.clone(),
                target,
                hardware,
                choice: None,
                verdict: Verdict::SkipConstraintsUnmet,
                reason: format!(
                    "no {} profile within max loss {:.1}% and min compression {:.0}% \
                     (best loss {}, best compression {})",
                    target,
                    constraints.max_quality_loss,
                    constraints.min_compression,
                    best_loss.map_or("n/a".to_string(), |l| format!("{:.1}%", l)),
                    best_compression.map_or("n/a".to_string(), |c| format!("{:.0}%", c)),
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ColorInfo, FileIdentity};
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn descriptor(codec: &str, width: u32, height: u32, bitrate: Option<u64>) -> MediaDescriptor {
        MediaDescriptor {
            identity: FileIdentity::new(PathBuf::from("/media/film.mkv"), 4_000_000_000, 1),
            container: "matroska,webm".to_string(),
            video_codec: codec.to_string(),
            audio_codec: Some("aac".to_string()),
            width,
            height,
            frame_rate: 23.976,
            bit_depth: 8,
            hdr: false,
            color: ColorInfo::default(),
            duration_secs: 5400.0,
            bitrate_bps: bitrate,
            has_subtitles: false,
        }
    }

    fn constraints(max_loss: f64, min_compression: f64) -> Constraints {
        Constraints {
            max_quality_loss: max_loss,
            min_compression,
            target_codec: TargetCodec::Hevc,
            hardware: None,
            profile: None,
            reencode_optimal: false,
        }
    }

    #[test]
    fn test_h264_1080p_picks_balanced() {
        let desc = descriptor("h264", 1920, 1080, Some(10_000_000));
        let rec = recommend(&desc, &constraints(3.0, 50.0));

        assert_eq!(rec.verdict, Verdict::Convert);
        let choice = rec.choice.unwrap();
        assert_eq!(choice.profile.tier, ProfileTier::Balanced);
        assert_eq!(choice.profile.quality, 23);
        assert_eq!(choice.profile.rate_control, RateControl::Crf);
        assert_eq!(choice.predicted_quality_loss, 2.0);
        assert_eq!(choice.predicted_compression, 60.0);
    }

    #[test]
    fn test_hevc_at_crf18_bitrate_is_already_optimal() {
        let desc = descriptor("hevc", 1920, 1080, Some(4_000_000));
        for (loss, compression) in [(0.1, 90.0), (3.0, 50.0), (50.0, 0.0)] {
            let rec = recommend(&desc, &constraints(loss, compression));
            assert_eq!(rec.verdict, Verdict::SkipAlreadyOptimal);
            assert!(rec.choice.is_none());
        }
    }

    #[test]
    fn test_strict_loss_budget_is_unmet() {
        let desc = descriptor("h264", 1920, 1080, Some(10_000_000));
        let rec = recommend(&desc, &constraints(0.2, 30.0));
        assert_eq!(rec.verdict, Verdict::SkipConstraintsUnmet);
        assert!(rec.reason.contains("best loss 0.5%"));
    }

    #[test]
    fn test_force_reencodes_optimal_source() {
        let desc = descriptor("hevc", 1920, 1080, Some(4_000_000));
        let mut c = constraints(5.0, 40.0);
        c.reencode_optimal = true;
        let rec = recommend(&desc, &c);
        assert_eq!(rec.verdict, Verdict::Convert);
        // HEVC sources leave 25 points less to gain; Fast is the only tier above 40%.
        assert_eq!(rec.choice.unwrap().profile.tier, ProfileTier::Fast);
    }

    #[test]
    fn test_bloated_hevc_is_converted() {
        let desc = descriptor("hevc", 1920, 1080, Some(15_000_000));
        let rec = recommend(&desc, &constraints(5.0, 30.0));
        assert_eq!(rec.verdict, Verdict::Convert);
    }

    #[test]
    fn test_tie_on_loss_prefers_faster_preset() {
        let desc = descriptor("h264", 1920, 1080, None);
        let ordered = estimates(&desc, TargetCodec::Hevc, None, None);
        let tiers: Vec<_> = ordered.iter().map(|e| e.profile.tier).collect();
        assert_eq!(
            tiers,
            vec![
                ProfileTier::Quality,
                ProfileTier::Balanced,
                ProfileTier::Archive,
                ProfileTier::Fast
            ]
        );
    }

    #[test]
    fn test_archive_chosen_when_compression_demands_it() {
        let desc = descriptor("h264", 1920, 1080, None);
        let rec = recommend(&desc, &constraints(3.0, 62.0));
        assert_eq!(rec.choice.unwrap().profile.tier, ProfileTier::Archive);
    }

    #[test]
    fn test_pinned_tier() {
        let desc = descriptor("mpeg2video", 720, 576, None);
        let mut c = constraints(10.0, 10.0);
        c.profile = Some(ProfileTier::Fast);
        let rec = recommend(&desc, &c);
        let choice = rec.choice.unwrap();
        assert_eq!(choice.profile.tier, ProfileTier::Fast);
        // SD multiplies loss by 1.3, legacy sources gain 15 points, SD loses 5.
        assert_eq!(choice.predicted_quality_loss, 6.5);
        assert_eq!(choice.predicted_compression, 80.0);
    }

    #[test]
    fn test_hardware_penalty_and_rate_control() {
        let desc = descriptor("h264", 1920, 1080, None);
        let mut c = constraints(5.0, 30.0);
        c.hardware = Some(GpuType::Nvidia);
        let rec = recommend(&desc, &c);
        assert_eq!(rec.hardware, Some(GpuType::Nvidia));
        let choice = rec.choice.unwrap();
        assert_eq!(choice.profile.rate_control, RateControl::ConstantQuality);
        assert_eq!(choice.predicted_quality_loss, 1.5);
        assert_eq!(choice.predicted_compression, 40.0);
    }

    #[test]
    fn test_vp9_without_vendor_encoder_falls_back_to_software() {
        let desc = descriptor("h264", 1920, 1080, None);
        let mut c = constraints(5.0, 30.0);
        c.target_codec = TargetCodec::Vp9;
        c.hardware = Some(GpuType::Nvidia);
        let rec = recommend(&desc, &c);
        assert_eq!(rec.hardware, None);
        assert_eq!(rec.choice.unwrap().profile.rate_control, RateControl::Crf);
    }

    fn codec_name_strategy() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec!["h264", "hevc", "vp9", "av1", "mpeg2video", "prores"])
    }

    fn target_strategy() -> impl Strategy<Value = TargetCodec> {
        prop::sample::select(TargetCodec::ALL.to_vec())
    }

    // Raising the loss budget never shrinks the eligible set.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_advisor_monotonic_in_max_loss(
            codec in codec_name_strategy(),
            target in target_strategy(),
            width in 320u32..7680,
            height in 240u32..4320,
            loss in 0.0f64..10.0,
            extra in 0.0f64..10.0,
            min_compression in 0.0f64..99.0,
        ) {
            let desc = descriptor(codec, width, height, None);
            let mut c = constraints(loss, min_compression);
            c.target_codec = target;
            let before = eligible_profiles(&desc, &c).len();
            c.max_quality_loss = loss + extra;
            let after = eligible_profiles(&desc, &c).len();
            prop_assert!(after >= before, "{} -> {}", before, after);
        }

        #[test]
        fn prop_recommendation_deterministic_and_consistent(
            codec in codec_name_strategy(),
            width in 320u32..7680,
            height in 240u32..4320,
            bitrate in prop::option::of(100_000u64..50_000_000),
            loss in 0.0f64..10.0,
            min_compression in 0.0f64..99.0,
        ) {
            let desc = descriptor(codec, width, height, bitrate);
            let c = constraints(loss, min_compression);
            let first = recommend(&desc, &c);
            prop_assert_eq!(&first, &recommend(&desc, &c));

            match first.verdict {
                Verdict::Convert => {
                    let choice = first.choice.as_ref().unwrap();
                    prop_assert!(choice.satisfies(&c));
                    let eligible = eligible_profiles(&desc, &c);
                    prop_assert_eq!(Some(choice), eligible.first());
                }
                Verdict::SkipConstraintsUnmet => {
                    prop_assert!(eligible_profiles(&desc, &c).is_empty());
                }
                Verdict::SkipAlreadyOptimal => {
                    prop_assert!(already_optimal(&desc, c.target_codec).is_some());
                }
            }
        }
    }
}
