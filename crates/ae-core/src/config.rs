use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{LoadSnapshot, Resource, ToolKind};

/// Top-level configuration loaded from `~/.auto-enhance/config.toml`.
///
/// Resolved once at startup; the engine treats every value as read-only.
/// Credentials for the front-end or the language model never live here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Global ceiling on tasks in `Running`.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            general: GeneralConfig::default(),
            scheduler: SchedulerConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            monitoring: MonitoringConfig::default(),
            notifications: NotificationConfig::default(),
            storage: StorageConfig::default(),
            tools: ToolsConfig::default(),
            features: FeaturesConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `~/.auto-enhance/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::Validation(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        self.rate_limiting.validate()?;
        self.monitoring.alerts.validate()?;
        if self.notifications.progress_update_interval == 0 {
            return Err(ConfigError::Validation(
                "notifications.progress_update_interval must be positive".into(),
            ));
        }
        if self.storage.max_history_size == 0 {
            return Err(ConfigError::Validation(
                "storage.max_history_size must be at least 1".into(),
            ));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "scheduler.tick_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".auto-enhance")
            .join("config.toml")
    }
}

fn default_max_concurrent_tasks() -> usize {
    3
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output.
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_stage_retries")]
    pub default_max_retries: u32,
    /// Base delay of the exponential retry backoff.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How long `cancel` waits for a running stage to stop.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// Delay between the polite termination request and a forced kill.
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            default_max_retries: default_stage_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            cancel_grace_secs: default_cancel_grace_secs(),
            terminate_grace_secs: default_terminate_grace_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_stage_retries() -> u32 {
    1
}
fn default_retry_backoff_ms() -> u64 {
    2000
}
fn default_cancel_grace_secs() -> u64 {
    10
}
fn default_terminate_grace_secs() -> u64 {
    5
}
fn default_shutdown_timeout_secs() -> u64 {
    30
}
fn default_stats_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default = "default_max_requests_per_hour")]
    pub max_requests_per_hour: u32,
    #[serde(default = "default_max_concurrent_per_user")]
    pub max_concurrent_per_user: u32,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,
    /// Consecutive denials that put a user into cooldown. `0` disables it.
    #[serde(default = "default_cooldown_after_denials")]
    pub cooldown_after_denials: u32,
    /// Length of the sliding request window.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_requests_per_hour: default_max_requests_per_hour(),
            max_concurrent_per_user: default_max_concurrent_per_user(),
            cooldown_minutes: default_cooldown_minutes(),
            cooldown_after_denials: default_cooldown_after_denials(),
            window_secs: default_window_secs(),
        }
    }
}

impl RateLimitingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests_per_hour == 0 {
            return Err(ConfigError::Validation(
                "rate_limiting.max_requests_per_hour must be at least 1".into(),
            ));
        }
        if self.max_concurrent_per_user == 0 {
            return Err(ConfigError::Validation(
                "rate_limiting.max_concurrent_per_user must be at least 1".into(),
            ));
        }
        if self.window_secs == 0 {
            return Err(ConfigError::Validation(
                "rate_limiting.window_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_requests_per_hour() -> u32 {
    20
}
fn default_max_concurrent_per_user() -> u32 {
    2
}
fn default_cooldown_minutes() -> u64 {
    5
}
fn default_cooldown_after_denials() -> u32 {
    3
}
fn default_window_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MonitoringConfig {
    /// Mount point whose usage is reported as `disk_pct`.
    #[serde(default)]
    pub disk_path: Option<String>,
    #[serde(default)]
    pub alerts: AlertThresholds,
}

/// Admission thresholds, in percent. Exceeding any one of them holds new
/// work back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_disk_threshold")]
    pub disk_threshold: f64,
    #[serde(default = "default_gpu_memory_threshold")]
    pub gpu_memory_threshold: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            disk_threshold: default_disk_threshold(),
            gpu_memory_threshold: default_gpu_memory_threshold(),
        }
    }
}

/// A single threshold exceeded by a load sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdBreach {
    pub resource: Resource,
    pub value: f64,
    pub threshold: f64,
}

impl AlertThresholds {
    pub fn threshold(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Cpu => self.cpu_threshold,
            Resource::Memory => self.memory_threshold,
            Resource::GpuMemory => self.gpu_memory_threshold,
            Resource::Disk => self.disk_threshold,
        }
    }

    /// Every threshold `snapshot` exceeds. Missing readings never breach.
    pub fn breaches(&self, snapshot: &LoadSnapshot) -> Vec<ThresholdBreach> {
        [Resource::Cpu, Resource::Memory, Resource::GpuMemory, Resource::Disk]
            .into_iter()
            .filter_map(|resource| {
                let value = snapshot.value(resource)?;
                let threshold = self.threshold(resource);
                (value > threshold).then_some(ThresholdBreach {
                    resource,
                    value,
                    threshold,
                })
            })
            .collect()
    }

    pub fn is_exceeded(&self, snapshot: &LoadSnapshot) -> bool {
        !self.breaches(snapshot).is_empty()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for resource in [Resource::Cpu, Resource::Memory, Resource::GpuMemory, Resource::Disk] {
            let value = self.threshold(resource);
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::Validation(format!(
                    "monitoring.alerts.{resource}_threshold must be in (0, 100], got {value}"
                )));
            }
        }
        Ok(())
    }
}

fn default_cpu_threshold() -> f64 {
    80.0
}
fn default_memory_threshold() -> f64 {
    85.0
}
fn default_disk_threshold() -> f64 {
    90.0
}
fn default_gpu_memory_threshold() -> f64 {
    85.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Minimum seconds between two progress events of one stage.
    #[serde(default = "default_progress_update_interval")]
    pub progress_update_interval: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            progress_update_interval: default_progress_update_interval(),
        }
    }
}

impl NotificationConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_update_interval)
    }
}

fn default_progress_update_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Where the front-end drops downloaded inputs.
    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: String,
    /// Scratch space for intermediate stage outputs.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    /// Where published results end up.
    #[serde(default = "default_media_dir")]
    pub media_dir: String,
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            inbox_dir: default_inbox_dir(),
            work_dir: default_work_dir(),
            media_dir: default_media_dir(),
            max_history_size: default_max_history_size(),
        }
    }
}

fn default_inbox_dir() -> String {
    "downloads".into()
}
fn default_work_dir() -> String {
    "temp".into()
}
fn default_media_dir() -> String {
    "media".into()
}
fn default_max_history_size() -> usize {
    1000
}

/// Per-tool settings. Unset fields fall back to the tool's own defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Device index handed to GPU tools. Unset lets the tool choose.
    #[serde(default)]
    pub gpu: Option<u32>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            timeout_secs: None,
            gpu: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    #[serde(default)]
    pub ffmpeg: ToolConfig,
    #[serde(default)]
    pub realesrgan: ToolConfig,
    #[serde(default)]
    pub video2x: ToolConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: default_ffprobe_path(),
            ffmpeg: ToolConfig::default(),
            realesrgan: ToolConfig::default(),
            video2x: ToolConfig::default(),
        }
    }
}

impl ToolsConfig {
    pub fn get(&self, kind: ToolKind) -> &ToolConfig {
        match kind {
            ToolKind::Ffmpeg => &self.ffmpeg,
            ToolKind::RealEsrgan => &self.realesrgan,
            ToolKind::Video2x => &self.video2x,
        }
    }

    pub fn binary(&self, kind: ToolKind) -> String {
        self.get(kind)
            .path
            .clone()
            .unwrap_or_else(|| kind.default_binary().to_string())
    }

    pub fn timeout(&self, kind: ToolKind) -> Duration {
        self.get(kind)
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| kind.default_timeout())
    }

    pub fn is_enabled(&self, kind: ToolKind) -> bool {
        self.get(kind).enabled
    }

    pub fn gpu(&self, kind: ToolKind) -> Option<u32> {
        self.get(kind).gpu
    }
}

fn default_ffprobe_path() -> String {
    "ffprobe".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeaturesConfig {
    /// Accepted for compatibility; batch fan-out is not implemented and the
    /// flag is always treated as off.
    #[serde(default)]
    pub batch_processing: bool,
}
