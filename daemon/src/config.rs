use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TICK_MS: u64 = 200;
pub const DEFAULT_RECORD_SECS: u64 = 10_800;
pub const DEFAULT_START_CONFIRM_TICKS: u32 = 5;
pub const DEFAULT_RECORDING_DIR: &str = "recordings";
pub const DEFAULT_FILENAME_FORMAT: &str = "STELC_%Y%m%d-%H%M.wav";
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_CHANNELS: u16 = 1;
pub const DEFAULT_SAMPLE_WIDTH: u16 = 2;
pub const DEFAULT_CONVERT_EXTENSION: &str = "mp3";
pub const DEFAULT_COPY_SUBDIR: &str = "STELC_pi";
pub const DEFAULT_COPY_ATTEMPTS: u32 = 3;
pub const DEFAULT_COPY_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_CALENDAR_FILE: &str = "calendar.toml";
pub const DEFAULT_LOOK_AHEAD_SECS: u64 = 86_400;
pub const DEFAULT_LEAD_SECS: u64 = 900;
pub const DEFAULT_DAILY_AT: &str = "03:30";
pub const DEFAULT_SAFETY_FACTOR: f64 = 2.5;

/// Root configuration structure. Deserialized from `<app dir>/config.toml`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub convert: ConvertConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub copy: CopyConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Tick cadence shared by the controller, the workers and the scheduler.
#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Recording length used when a manual record request gives none.
    #[serde(default = "default_record_secs")]
    pub default_record_secs: u64,
    /// How many worker ticks the controller waits for a stage to report running.
    #[serde(default = "default_start_confirm_ticks")]
    pub start_confirm_ticks: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            default_record_secs: DEFAULT_RECORD_SECS,
            start_confirm_ticks: DEFAULT_START_CONFIRM_TICKS,
        }
    }
}

impl ControllerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecordingConfig {
    /// Working directory for takes, converted files and stage logs.
    /// Relative paths resolve against the app data directory.
    #[serde(default = "default_recording_dir")]
    pub dir: PathBuf,
    /// chrono format string for timestamp-derived filenames.
    #[serde(default = "default_filename_format")]
    pub filename_format: String,
    /// Globs (relative to `dir`) selecting files the retention purge may remove.
    #[serde(default = "default_recording_patterns")]
    pub patterns: Vec<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Bytes per sample.
    #[serde(default = "default_sample_width")]
    pub sample_width: u16,
    /// Capture command. `{output}`, `{duration}`, `{rate}` and `{channels}` are substituted.
    #[serde(default = "default_capture_command")]
    pub capture_command: Vec<String>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            dir: default_recording_dir(),
            filename_format: default_filename_format(),
            patterns: default_recording_patterns(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            sample_width: DEFAULT_SAMPLE_WIDTH,
            capture_command: default_capture_command(),
        }
    }
}

impl RecordingConfig {
    /// Uncompressed size of a take of `secs` seconds.
    pub fn expected_bytes(&self, secs: u64) -> u64 {
        u64::from(self.sample_width) * u64::from(self.channels) * u64::from(self.sample_rate) * secs
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConvertConfig {
    /// `{input}` and `{output}` are substituted.
    #[serde(default = "default_convert_command")]
    pub command: Vec<String>,
    #[serde(default = "default_convert_extension")]
    pub extension: String,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            command: default_convert_command(),
            extension: DEFAULT_CONVERT_EXTENSION.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// `{input}` (absolute path) and `{name}` (file name) are substituted.
    #[serde(default = "default_upload_command")]
    pub command: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            command: default_upload_command(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CopyConfig {
    /// Sync program and its fixed flags; include filters, source and
    /// destination are appended.
    #[serde(default = "default_copy_command")]
    pub command: Vec<String>,
    /// Directory created on each removable volume to receive the files.
    #[serde(default = "default_copy_subdir")]
    pub dest_subdir: String,
    /// rsync include globs; everything else is excluded.
    #[serde(default = "default_copy_include")]
    pub include: Vec<String>,
    /// Attempts for each mount, unmount and discovery call.
    #[serde(default = "default_copy_attempts")]
    pub attempts: u32,
    #[serde(default = "default_copy_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            command: default_copy_command(),
            dest_subdir: DEFAULT_COPY_SUBDIR.to_string(),
            include: default_copy_include(),
            attempts: DEFAULT_COPY_ATTEMPTS,
            retry_delay_ms: DEFAULT_COPY_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    /// Calendar file; relative paths resolve against the app data directory.
    #[serde(default = "default_calendar_file")]
    pub calendar_file: PathBuf,
    /// How far ahead the next event is looked up.
    #[serde(default = "default_look_ahead_secs")]
    pub look_ahead_secs: u64,
    /// Pre-announcement window before a scheduled start.
    #[serde(default = "default_lead_secs")]
    pub lead_secs: u64,
    /// Local wall-clock time (`HH:MM`) of the daily maintenance run.
    #[serde(default = "default_daily_at")]
    pub daily_at: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            calendar_file: PathBuf::from(DEFAULT_CALENDAR_FILE),
            look_ahead_secs: DEFAULT_LOOK_AHEAD_SECS,
            lead_secs: DEFAULT_LEAD_SECS,
            daily_at: DEFAULT_DAILY_AT.to_string(),
        }
    }
}

impl ScheduleConfig {
    pub fn daily_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.daily_at, "%H:%M")
            .with_context(|| format!("Invalid schedule.daily_at '{}' (expected HH:MM)", self.daily_at))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    /// Multiplier applied to the expected size of the next take.
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            safety_factor: DEFAULT_SAFETY_FACTOR,
        }
    }
}

impl Config {
    /// Rejects settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.controller.tick_ms == 0 {
            bail!("controller.tick_ms must be greater than zero");
        }
        if self.controller.default_record_secs == 0 {
            bail!("controller.default_record_secs must be greater than zero");
        }
        for (name, command) in [
            ("recording.capture_command", &self.recording.capture_command),
            ("convert.command", &self.convert.command),
            ("upload.command", &self.upload.command),
            ("copy.command", &self.copy.command),
        ] {
            if command.is_empty() {
                bail!("{name} must name a program");
            }
        }
        if self.recording.patterns.is_empty() {
            bail!("recording.patterns must not be empty");
        }
        if self.copy.attempts == 0 {
            bail!("copy.attempts must be at least 1");
        }
        let factor = self.retention.safety_factor;
        if factor.is_nan() || factor < 1.0 {
            bail!(
                "retention.safety_factor must be at least 1.0 (got {})",
                self.retention.safety_factor
            );
        }
        self.schedule.daily_time()?;
        Ok(())
    }

    /// Resolves relative directories against `app_dir`.
    pub fn resolve_paths(&mut self, app_dir: &Path) {
        if self.recording.dir.is_relative() {
            self.recording.dir = app_dir.join(&self.recording.dir);
        }
        if self.schedule.calendar_file.is_relative() {
            self.schedule.calendar_file = app_dir.join(&self.schedule.calendar_file);
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

fn default_record_secs() -> u64 {
    DEFAULT_RECORD_SECS
}

fn default_start_confirm_ticks() -> u32 {
    DEFAULT_START_CONFIRM_TICKS
}

fn default_recording_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RECORDING_DIR)
}

fn default_filename_format() -> String {
    DEFAULT_FILENAME_FORMAT.to_string()
}

fn default_recording_patterns() -> Vec<String> {
    vec!["STELC_*.wav".to_string(), "STELC_*.mp3".to_string()]
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_channels() -> u16 {
    DEFAULT_CHANNELS
}

fn default_sample_width() -> u16 {
    DEFAULT_SAMPLE_WIDTH
}

fn default_capture_command() -> Vec<String> {
    [
        "sox", "-q", "-t", "alsa", "default", "-c", "{channels}", "-r", "{rate}", "-e",
        "signed", "-b", "16", "{output}", "trim", "0", "{duration}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_convert_command() -> Vec<String> {
    ["lame", "--preset", "standard", "{input}", "{output}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_convert_extension() -> String {
    DEFAULT_CONVERT_EXTENSION.to_string()
}

fn default_upload_command() -> Vec<String> {
    ["dropbox_uploader.sh", "-p", "upload", "{input}", "{name}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_copy_command() -> Vec<String> {
    ["rsync", "-Pt", "--modify-window=2"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_copy_subdir() -> String {
    DEFAULT_COPY_SUBDIR.to_string()
}

fn default_copy_include() -> Vec<String> {
    vec!["*.mp3".to_string(), "*.wav".to_string(), "*.log".to_string()]
}

fn default_copy_attempts() -> u32 {
    DEFAULT_COPY_ATTEMPTS
}

fn default_copy_retry_delay_ms() -> u64 {
    DEFAULT_COPY_RETRY_DELAY_MS
}

fn default_calendar_file() -> PathBuf {
    PathBuf::from(DEFAULT_CALENDAR_FILE)
}

fn default_look_ahead_secs() -> u64 {
    DEFAULT_LOOK_AHEAD_SECS
}

fn default_lead_secs() -> u64 {
    DEFAULT_LEAD_SECS
}

fn default_daily_at() -> String {
    DEFAULT_DAILY_AT.to_string()
}

fn default_safety_factor() -> f64 {
    DEFAULT_SAFETY_FACTOR
}
