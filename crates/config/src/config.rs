//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Built-in defaults could not be turned into a TOML table
    Serialize(toml::ser::Error),
    /// Configuration parsed but violates a constraint
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to serialize defaults: {}", e),
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

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

/// Folder name used for output when none is configured
pub const DEFAULT_OUTPUT_SUBFOLDER: &str = "auto-clips";

/// Folder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FoldersConfig {
    /// Folder the recorder saves into (watched root)
    #[serde(default)]
    pub watch: PathBuf,
    /// Folder finished clips are written to (defaults to `<watch>/auto-clips`)
    #[serde(default)]
    pub output: PathBuf,
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    /// Endpoint receiving the multipart POST
    #[serde(default)]
    pub url: String,
    /// Request timeout for the upload
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout_secs() -> u64 {
    120
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

/// How a clip is brought down to the size window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Single pass at `quick_quality`
    #[default]
    #[serde(alias = "Quick")]
    Quick,
    /// Multi-pass size search
    #[serde(alias = "Progressive")]
    Progressive,
}

impl std::fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionMethod::Quick => write!(f, "quick"),
            CompressionMethod::Progressive => write!(f, "progressive"),
        }
    }
}

impl std::str::FromStr for CompressionMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quick" => Ok(CompressionMethod::Quick),
            "progressive" => Ok(CompressionMethod::Progressive),
            other => Err(ConfigError::Invalid(format!(
                "unknown compression method '{}'",
                other
            ))),
        }
    }
}

/// Tunables for one compression run. Immutable once a run has started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionConfig {
    /// Lower bound of the accepted size window (MiB)
    #[serde(default = "default_min_size_mb")]
    pub min_size_mb: f64,
    /// Preferred size inside the window (MiB)
    #[serde(default = "default_target_size_mb")]
    pub target_size_mb: f64,
    /// Upper bound of the accepted size window (MiB)
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: f64,
    /// Soft budget of trial encodes for the progressive search
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Lowest quality parameter (highest fidelity) the search may use
    #[serde(default = "default_quality_min")]
    pub quality_min: u32,
    /// Highest quality parameter (smallest output) the search may use
    #[serde(default = "default_quality_max")]
    pub quality_max: u32,
    /// Unit step for small quality adjustments
    #[serde(default = "default_quality_step")]
    pub quality_step: u32,
    /// Quality parameter for the high-quality extract
    #[serde(default = "default_extract_quality")]
    pub extract_quality: u32,
    /// Encoder preset for the high-quality extract
    #[serde(default = "default_extract_preset")]
    pub extract_preset: String,
    /// Encoder preset for trial encodes
    #[serde(default = "default_compression_preset")]
    pub compression_preset: String,
    /// Trailing seconds kept from each recording
    #[serde(default = "default_clip_duration_secs")]
    pub clip_duration_secs: f64,
    /// Fraction of `min_size_mb` considered close to the window
    #[serde(default = "default_close_threshold")]
    pub close_threshold: f64,
    /// Fraction of `min_size_mb` below which a near miss gets a double step
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,
    /// Fraction of `min_size_mb` below which a miss counts as far off
    #[serde(default = "default_far_threshold")]
    pub far_threshold: f64,
    /// Compression method selector
    #[serde(default)]
    pub method: CompressionMethod,
    /// Quality parameter for the quick method
    #[serde(default = "default_quick_quality")]
    pub quick_quality: u32,
    /// Encoder thread cap (None = encoder decides)
    #[serde(default)]
    pub threads: Option<u32>,
    /// Name shown in the upload caption
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_min_size_mb() -> f64 {
    8.0
}

fn default_target_size_mb() -> f64 {
    9.0
}

fn default_max_size_mb() -> f64 {
    10.0
}

fn default_max_attempts() -> u32 {
    5
}

fn default_quality_min() -> u32 {
    1
}

fn default_quality_max() -> u32 {
    30
}

fn default_quality_step() -> u32 {
    1
}

fn default_extract_quality() -> u32 {
    18
}

fn default_extract_preset() -> String {
    "fast".to_string()
}

fn default_compression_preset() -> String {
    "medium".to_string()
}

fn default_clip_duration_secs() -> f64 {
    15.0
}

fn default_close_threshold() -> f64 {
    0.9
}

fn default_medium_threshold() -> f64 {
    0.75
}

fn default_far_threshold() -> f64 {
    0.5
}

fn default_quick_quality() -> u32 {
    40
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size_mb: default_min_size_mb(),
            target_size_mb: default_target_size_mb(),
            max_size_mb: default_max_size_mb(),
            max_attempts: default_max_attempts(),
            quality_min: default_quality_min(),
            quality_max: default_quality_max(),
            quality_step: default_quality_step(),
            extract_quality: default_extract_quality(),
            extract_preset: default_extract_preset(),
            compression_preset: default_compression_preset(),
            clip_duration_secs: default_clip_duration_secs(),
            close_threshold: default_close_threshold(),
            medium_threshold: default_medium_threshold(),
            far_threshold: default_far_threshold(),
            method: CompressionMethod::default(),
            quick_quality: default_quick_quality(),
            threads: None,
            display_name: None,
        }
    }
}

impl CompressionConfig {
    /// Whether a size (MiB) lies inside `[min_size_mb, max_size_mb]`
    pub fn in_window(&self, size_mb: f64) -> bool {
        size_mb >= self.min_size_mb && size_mb <= self.max_size_mb
    }

    /// Check the size window and quality bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_size_mb > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "min_size_mb must be positive, got {}",
                self.min_size_mb
            )));
        }
        if !(self.min_size_mb <= self.target_size_mb && self.target_size_mb <= self.max_size_mb) {
            return Err(ConfigError::Invalid(format!(
                "size window must satisfy min <= target <= max, got {} / {} / {}",
                self.min_size_mb, self.target_size_mb, self.max_size_mb
            )));
        }
        if self.quality_min > self.quality_max {
            return Err(ConfigError::Invalid(format!(
                "quality_min ({}) exceeds quality_max ({})",
                self.quality_min, self.quality_max
            )));
        }
        if self.quality_step == 0 {
            return Err(ConfigError::Invalid("quality_step must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        if !(self.clip_duration_secs > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "clip_duration_secs must be positive, got {}",
                self.clip_duration_secs
            )));
        }
        for (name, value) in [
            ("close_threshold", self.close_threshold),
            ("medium_threshold", self.medium_threshold),
            ("far_threshold", self.far_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.threads == Some(0) {
            return Err(ConfigError::Invalid("threads must be at least 1 when set".to_string()));
        }
        Ok(())
    }
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// ffmpeg executable
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    /// ffprobe executable
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    /// Suppress console windows spawned by the encoder (Windows only)
    #[serde(default = "default_hide_window")]
    pub hide_window: bool,
    /// Hard limit for a single encoder invocation
    #[serde(default = "default_encoder_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_hide_window() -> bool {
    true
}

fn default_encoder_timeout_secs() -> u64 {
    1800
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            hide_window: default_hide_window(),
            timeout_secs: default_encoder_timeout_secs(),
        }
    }
}

/// Folder watching configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Interval between folder scans
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Wait before a new file is considered finished
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Extra settle rounds while the file keeps growing
    #[serde(default = "default_settle_rounds")]
    pub settle_rounds: u32,
    /// Extensions (without dot, case-insensitive) treated as recordings
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_settle_rounds() -> u32 {
    3
}

fn default_extensions() -> Vec<String> {
    vec!["mp4".to_string(), "mov".to_string(), "avi".to_string()]
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            settle_rounds: default_settle_rounds(),
            extensions: default_extensions(),
        }
    }
}

/// Status endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusConfig {
    /// Address for the JSON status endpoint (disabled when None)
    #[serde(default)]
    pub bind: Option<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub folders: FoldersConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing optional fields take their built-in defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Resolve configuration from three tiers, key by key:
    /// user file, then defaults file, then built-in defaults.
    ///
    /// Either file may be absent. A file that exists but does not parse is an error.
    pub fn load_layered<P: AsRef<Path>, Q: AsRef<Path>>(
        user_path: P,
        defaults_path: Q,
    ) -> Result<Self, ConfigError> {
        let mut merged = match toml::Value::try_from(Config::default())? {
            toml::Value::Table(table) => table,
            _ => toml::Table::new(),
        };

        for path in [defaults_path.as_ref(), user_path.as_ref()] {
            if !path.exists() {
                continue;
            }
            let content = fs::read_to_string(path)?;
            let overlay: toml::Table = content.parse()?;
            merge_tables(&mut merged, overlay);
        }

        let config: Config = toml::Value::Table(merged).try_into()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CLIP_RELAY_WATCH_FOLDER -> folders.watch
    /// - CLIP_RELAY_OUTPUT_FOLDER -> folders.output
    /// - CLIP_RELAY_WEBHOOK_URL -> webhook.url
    /// - CLIP_RELAY_COMPRESSION_METHOD -> compression.method
    /// - CLIP_RELAY_THREADS -> compression.threads
    /// - CLIP_RELAY_STATUS_BIND -> status.bind
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CLIP_RELAY_WATCH_FOLDER") {
            self.folders.watch = PathBuf::from(val);
        }

        if let Ok(val) = env::var("CLIP_RELAY_OUTPUT_FOLDER") {
            self.folders.output = PathBuf::from(val);
        }

        if let Ok(val) = env::var("CLIP_RELAY_WEBHOOK_URL") {
            self.webhook.url = val;
        }

        if let Ok(val) = env::var("CLIP_RELAY_COMPRESSION_METHOD") {
            if let Ok(method) = val.parse::<CompressionMethod>() {
                self.compression.method = method;
            }
        }

        if let Ok(val) = env::var("CLIP_RELAY_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.compression.threads = Some(threads);
            }
        }

        if let Ok(val) = env::var("CLIP_RELAY_STATUS_BIND") {
            self.status.bind = if val.is_empty() { None } else { Some(val) };
        }
    }

    /// Load layered configuration and apply environment overrides
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        user_path: P,
        defaults_path: Q,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::load_layered(user_path, defaults_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Folder finished clips are written to
    pub fn output_folder(&self) -> PathBuf {
        if self.folders.output.as_os_str().is_empty() {
            self.folders.watch.join(DEFAULT_OUTPUT_SUBFOLDER)
        } else {
            self.folders.output.clone()
        }
    }

    /// Reject configurations the daemon cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.folders.watch.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("folders.watch is not set".to_string()));
        }
        if self.webhook.url.trim().is_empty() {
            return Err(ConfigError::Invalid("webhook.url is not set".to_string()));
        }
        if self.watch.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "watch.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.watch.extensions.is_empty() {
            return Err(ConfigError::Invalid("watch.extensions is empty".to_string()));
        }
        self.compression.validate()
    }
}

/// Recursively overlay `overlay` onto `base`; nested tables merge, other values replace.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
