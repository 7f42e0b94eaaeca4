//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value is out of its accepted range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Video codec families the engine can encode to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TargetCodec {
    Hevc,
    Av1,
    H264,
    Vp9,
}

impl TargetCodec {
    pub const ALL: [TargetCodec; 4] = [
        TargetCodec::Hevc,
        TargetCodec::Av1,
        TargetCodec::H264,
        TargetCodec::Vp9,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetCodec::Hevc => "hevc",
            TargetCodec::Av1 => "av1",
            TargetCodec::H264 => "h264",
            TargetCodec::Vp9 => "vp9",
        }
    }
}

impl fmt::Display for TargetCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetCodec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hevc" | "h265" | "x265" => Ok(TargetCodec::Hevc),
            "av1" => Ok(TargetCodec::Av1),
            "h264" | "avc" | "x264" => Ok(TargetCodec::H264),
            "vp9" => Ok(TargetCodec::Vp9),
            other => Err(ConfigError::Invalid(format!("unknown codec '{}'", other))),
        }
    }
}

/// GPU vendors with a supported hardware encoder family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GpuType {
    Nvidia,
    Amd,
    Intel,
    Videotoolbox,
}

impl GpuType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuType::Nvidia => "nvidia",
            GpuType::Amd => "amd",
            GpuType::Intel => "intel",
            GpuType::Videotoolbox => "videotoolbox",
        }
    }
}

impl fmt::Display for GpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GpuType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nvidia" | "cuda" | "nvenc" => Ok(GpuType::Nvidia),
            "amd" | "amf" => Ok(GpuType::Amd),
            "intel" | "qsv" => Ok(GpuType::Intel),
            "videotoolbox" | "apple" => Ok(GpuType::Videotoolbox),
            other => Err(ConfigError::Invalid(format!("unknown GPU type '{}'", other))),
        }
    }
}

/// Encoder profile tiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProfileTier {
    Quality,
    Archive,
    Balanced,
    Fast,
}

impl ProfileTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileTier::Quality => "quality",
            ProfileTier::Archive => "archive",
            ProfileTier::Balanced => "balanced",
            ProfileTier::Fast => "fast",
        }
    }
}

impl fmt::Display for ProfileTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "quality" => Ok(ProfileTier::Quality),
            "archive" => Ok(ProfileTier::Archive),
            "balanced" => Ok(ProfileTier::Balanced),
            "fast" => Ok(ProfileTier::Fast),
            other => Err(ConfigError::Invalid(format!("unknown profile '{}'", other))),
        }
    }
}

/// Output container format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mkv,
    Mp4,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mkv => "mkv",
            Container::Mp4 => "mp4",
        }
    }

    /// Muxer name passed to ffmpeg's `-f`.
    pub fn muxer(&self) -> &'static str {
        match self {
            Container::Mkv => "matroska",
            Container::Mp4 => "mp4",
        }
    }
}

/// External tool locations and timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// Seconds before a probe is abandoned
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Minimum spacing between progress callbacks
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_probe_timeout_secs() -> u64 {
    30
}

fn default_progress_interval_ms() -> u64 {
    1000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            probe_timeout_secs: default_probe_timeout_secs(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Target CPU utilization (0.5-1.0, default 0.85)
    #[serde(default = "default_target_cpu_utilization")]
    pub target_cpu_utilization: f32,
}

fn default_target_cpu_utilization() -> f32 {
    0.85
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            target_cpu_utilization: default_target_cpu_utilization(),
        }
    }
}

/// Worker pool limits and retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyConfig {
    /// Maximum concurrent jobs (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Job cap applied when a source or destination lives on network storage
    #[serde(default = "default_network_max_jobs")]
    pub network_max_jobs: u32,
    /// Concurrent hardware encoder sessions (0 = derive from GPU type)
    #[serde(default)]
    pub hardware_slots: u32,
    /// How long a job may wait for a hardware slot before it is requeued
    #[serde(default = "default_hardware_slot_timeout_secs")]
    pub hardware_slot_timeout_secs: u64,
    /// Retries after an encoder failure before a job is terminally failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_network_max_jobs() -> u32 {
    1
}

fn default_hardware_slot_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    1
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            network_max_jobs: default_network_max_jobs(),
            hardware_slots: 0,
            hardware_slot_timeout_secs: default_hardware_slot_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// Quality budget handed to the codec advisor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityConfig {
    /// Maximum predicted quality loss in percent
    #[serde(default = "default_max_quality_loss")]
    pub max_quality_loss: f64,
    /// Minimum predicted size reduction in percent
    #[serde(default = "default_min_compression")]
    pub min_compression: f64,
    #[serde(default = "default_target_codec")]
    pub target_codec: TargetCodec,
    /// Restrict the advisor to one tier
    #[serde(default)]
    pub profile: Option<ProfileTier>,
}

fn default_max_quality_loss() -> f64 {
    5.0
}

fn default_min_compression() -> f64 {
    30.0
}

fn default_target_codec() -> TargetCodec {
    TargetCodec::Hevc
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            max_quality_loss: default_max_quality_loss(),
            min_compression: default_min_compression(),
            target_codec: default_target_codec(),
            profile: None,
        }
    }
}

/// Hardware acceleration selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HardwareConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gpu_type")]
    pub gpu_type: GpuType,
}

fn default_gpu_type() -> GpuType {
    GpuType::Nvidia
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gpu_type: default_gpu_type(),
        }
    }
}

impl HardwareConfig {
    /// The selected vendor, or None when encoding in software.
    pub fn selected(&self) -> Option<GpuType> {
        self.enabled.then_some(self.gpu_type)
    }
}

/// Output placement and post-encode policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Destination directory (None = beside the source)
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_suffix")]
    pub suffix: String,
    #[serde(default)]
    pub container: Container,
    /// Outputs at or above `source_size * max_size_ratio` are discarded
    #[serde(default = "default_max_size_ratio")]
    pub max_size_ratio: f64,
    /// Audio codec to transcode to (None = copy)
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    /// Swap each verified output into the source's place
    #[serde(default)]
    pub replace_original: bool,
    /// Keep the replaced source as `<name>.orig.<timestamp>`
    #[serde(default = "default_keep_backup")]
    pub keep_backup: bool,
}

fn default_suffix() -> String {
    "-transcoded".to_string()
}

fn default_max_size_ratio() -> f64 {
    1.0
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

fn default_keep_backup() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: None,
            suffix: default_suffix(),
            container: Container::default(),
            max_size_ratio: default_max_size_ratio(),
            audio_codec: None,
            audio_bitrate: default_audio_bitrate(),
            replace_original: false,
            keep_backup: default_keep_backup(),
        }
    }
}

/// Durable state location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("batchcode.db")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Run summary delivery
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Recognized variables (values that fail to parse are ignored):
    /// - BATCHCODE_MAX_JOBS -> concurrency.max_concurrent_jobs
    /// - BATCHCODE_LOGICAL_CORES -> cpu.logical_cores
    /// - BATCHCODE_GPU_TYPE -> hardware.gpu_type
    /// - BATCHCODE_HARDWARE_ENABLED -> hardware.enabled
    /// - BATCHCODE_DATABASE -> state.database_path
    /// - BATCHCODE_FFMPEG / BATCHCODE_FFPROBE -> tools paths
    /// - BATCHCODE_MAX_QUALITY_LOSS -> quality.max_quality_loss
    /// - BATCHCODE_MIN_COMPRESSION -> quality.min_compression
    /// - BATCHCODE_WEBHOOK_URL -> notify.webhook_url
    /// - BATCHCODE_REPLACE_ORIGINAL -> output.replace_original
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("BATCHCODE_MAX_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.concurrency.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("BATCHCODE_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.cpu.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("BATCHCODE_GPU_TYPE") {
            if let Ok(gpu) = val.parse::<GpuType>() {
                self.hardware.gpu_type = gpu;
            }
        }

        if let Ok(val) = env::var("BATCHCODE_HARDWARE_ENABLED") {
            if let Some(enabled) = parse_bool(&val) {
                self.hardware.enabled = enabled;
            }
        }

        if let Ok(val) = env::var("BATCHCODE_DATABASE") {
            if !val.is_empty() {
                self.state.database_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("BATCHCODE_FFMPEG") {
            if !val.is_empty() {
                self.tools.ffmpeg_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("BATCHCODE_FFPROBE") {
            if !val.is_empty() {
                self.tools.ffprobe_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("BATCHCODE_MAX_QUALITY_LOSS") {
            if let Ok(loss) = val.parse::<f64>() {
                self.quality.max_quality_loss = loss;
            }
        }

        if let Ok(val) = env::var("BATCHCODE_MIN_COMPRESSION") {
            if let Ok(compression) = val.parse::<f64>() {
                self.quality.min_compression = compression;
            }
        }

        if let Ok(val) = env::var("BATCHCODE_WEBHOOK_URL") {
            self.notify.webhook_url = (!val.is_empty()).then_some(val);
        }

        if let Ok(val) = env::var("BATCHCODE_REPLACE_ORIGINAL") {
            if let Some(replace) = parse_bool(&val) {
                self.output.replace_original = replace;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject values the engine cannot act on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.quality.max_quality_loss.is_finite() || self.quality.max_quality_loss < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "max_quality_loss must be >= 0, got {}",
                self.quality.max_quality_loss
            )));
        }
        if !(0.0..100.0).contains(&self.quality.min_compression) {
            return Err(ConfigError::Invalid(format!(
                "min_compression must be in [0, 100), got {}",
                self.quality.min_compression
            )));
        }
        if !(self.output.max_size_ratio > 0.0 && self.output.max_size_ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "max_size_ratio must be in (0, 1], got {}",
                self.output.max_size_ratio
            )));
        }
        if self.tools.ffmpeg_path.as_os_str().is_empty()
            || self.tools.ffprobe_path.as_os_str().is_empty()
        {
            return Err(ConfigError::Invalid("tool paths must not be empty".to_string()));
        }
        if self.tools.progress_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "progress_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.concurrency.network_max_jobs == 0 {
            return Err(ConfigError::Invalid(
                "network_max_jobs must be at least 1".to_string(),
            ));
        }
        if self.concurrency.hardware_slot_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "hardware_slot_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.output.replace_original
            && self.output.suffix.is_empty()
            && self.output.directory.is_none()
        {
            return Err(ConfigError::Invalid(
                "replace_original needs a non-empty suffix or an output directory".to_string(),
            ));
        }
        Ok(())
    }
}
