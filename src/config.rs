use anyhow::{anyhow, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{Activation, ClassLabel, DecoderConfig, NmsPolicy, TensorLayout};
use crate::ingest::{ChannelOrder, SamplingPolicy};

const DEFAULT_CAMERA_URL: &str = "stub://backyard";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_SAMPLE_INTERVAL_SECS: f64 = 1.0;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_NMS_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_MAX_DETECTIONS: usize = 100;
const DEFAULT_COOLDOWN_MINUTES: f64 = 10.0;
const DEFAULT_CHANNEL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_SECS: u64 = 2;
const DEFAULT_DB_PATH: &str = "data/detections.db";
const DEFAULT_IMAGES_PATH: &str = "data/images";
const DEFAULT_RETENTION_DAYS: u32 = 30;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 300;
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 3600;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
/// One day.
const MAX_SAMPLE_INTERVAL_SECS: f64 = 86_400.0;
/// One year.
const MAX_COOLDOWN_MINUTES: f64 = 525_600.0;

/// Channel names accepted in `alerts.enabled_channels`.
pub const KNOWN_CHANNELS: [&str; 4] = ["sms", "email", "push", "mqtt"];

// ----------------------------------------------------------------------------
// File representation: every field optional, defaults applied in `from_file`.
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SentryConfigFile {
    camera: Option<CameraConfigFile>,
    video: Option<VideoConfigFile>,
    detection: Option<DetectionConfigFile>,
    alerts: Option<AlertsConfigFile>,
    notifications: Option<NotificationsConfig>,
    storage: Option<StorageConfigFile>,
    system: Option<SystemConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    source: Option<SourceKind>,
    url: Option<String>,
    path: Option<PathBuf>,
    poll_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    sample_interval_secs: Option<f64>,
    frame_skip: Option<u64>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    channel_order: Option<ChannelOrder>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<BackendKind>,
    model_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    nms_iou_threshold: Option<f32>,
    classes: Option<Vec<ClassLabel>>,
    class_thresholds: Option<HashMap<ClassLabel, f32>>,
    activation: Option<Activation>,
    layout: Option<TensorLayout>,
    nms_policy: Option<NmsPolicy>,
    max_detections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    cooldown_minutes: Option<f64>,
    enabled_channels: Option<Vec<String>>,
    channel_timeout_secs: Option<u64>,
    max_delivery_attempts: Option<u32>,
    retry_backoff_secs: Option<u64>,
    restore_cooldown: Option<bool>,
    drain_on_shutdown: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    database_path: Option<PathBuf>,
    images_path: Option<PathBuf>,
    retention_days: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SystemConfigFile {
    health_check_interval_secs: Option<u64>,
    maintenance_interval_secs: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    startup_delay_secs: Option<u64>,
}

// ----------------------------------------------------------------------------
// Resolved configuration
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Rtsp,
    File,
    Directory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Scripted outputs from a JSON file (or none at all); no ONNX runtime.
    Replay,
    /// ONNX model via tract (feature `backend-tract`).
    Tract,
}

#[derive(Debug, Clone)]
pub struct SentryConfig {
    pub camera: CameraConfig,
    pub video: VideoConfig,
    pub detection: DetectionConfig,
    pub alerts: AlertsConfig,
    pub notifications: NotificationsConfig,
    pub storage: StorageConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub source: SourceKind,
    pub url: String,
    pub path: Option<PathBuf>,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub sample_interval_secs: f64,
    pub frame_skip: Option<u64>,
    pub input_width: u32,
    pub input_height: u32,
    pub channel_order: ChannelOrder,
}

impl VideoConfig {
    /// `frame_skip` wins over the wall-clock interval when both are set.
    pub fn sampling_policy(&self) -> SamplingPolicy {
        match self.frame_skip {
            Some(n) if n > 1 => SamplingPolicy::EveryNth(n),
            Some(_) => SamplingPolicy::All,
            None if self.sample_interval_secs <= 0.0 => SamplingPolicy::All,
            None => SamplingPolicy::Interval(Duration::from_secs_f64(self.sample_interval_secs)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub backend: BackendKind,
    pub model_path: Option<PathBuf>,
    pub confidence_threshold: f32,
    pub nms_iou_threshold: f32,
    pub classes: Vec<ClassLabel>,
    pub class_thresholds: HashMap<ClassLabel, f32>,
    pub activation: Activation,
    pub layout: TensorLayout,
    pub nms_policy: NmsPolicy,
    pub max_detections: usize,
}

impl DetectionConfig {
    pub fn decoder_config(&self, video: &VideoConfig) -> DecoderConfig {
        DecoderConfig {
            input_width: video.input_width,
            input_height: video.input_height,
            confidence_threshold: self.confidence_threshold,
            class_thresholds: self.class_thresholds.clone(),
            iou_threshold: self.nms_iou_threshold,
            activation: self.activation,
            layout: self.layout,
            nms_policy: self.nms_policy,
            classes: self.classes.clone(),
            max_detections: self.max_detections,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertsConfig {
    pub cooldown_minutes: f64,
    pub enabled_channels: Vec<String>,
    pub channel_timeout: Duration,
    pub max_delivery_attempts: u32,
    pub retry_backoff: Duration,
    pub restore_cooldown: bool,
    pub drain_on_shutdown: bool,
}

impl AlertsConfig {
    pub fn cooldown_window(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_minutes * 60.0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationsConfig {
    pub sms: Option<SmsConfig>,
    pub email: Option<EmailConfig>,
    pub push: Option<PushConfig>,
    pub mqtt: Option<MqttConfig>,
}

/// Twilio-compatible SMS settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SmsConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub to_numbers: Vec<String>,
    #[serde(default = "default_sms_api_base")]
    pub api_base: String,
}

/// EmailJS REST settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub service_id: String,
    pub template_id: String,
    pub public_key: String,
    #[serde(default)]
    pub private_key: Option<String>,
    pub to_emails: Vec<String>,
    #[serde(default = "default_email_api_url")]
    pub api_url: String,
}

/// Pushover settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    pub api_token: String,
    pub user_key: String,
    #[serde(default = "default_push_priority")]
    pub priority: i8,
    #[serde(default = "default_push_api_url")]
    pub api_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub broker_url: String,
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
}

fn default_sms_api_base() -> String {
    "https://api.twilio.com".to_string()
}

fn default_email_api_url() -> String {
    "https://api.emailjs.com/api/v1.0/email/send".to_string()
}

fn default_push_priority() -> i8 {
    1
}

fn default_push_api_url() -> String {
    "https://api.pushover.net/1/messages.json".to_string()
}

fn default_mqtt_topic() -> String {
    "rodent-sentry/alerts".to_string()
}

fn default_mqtt_client_id() -> String {
    "rodent-sentry".to_string()
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub images_path: PathBuf,
    pub retention_days: u32,
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub health_check_interval: Duration,
    pub maintenance_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub startup_delay: Duration,
}

impl Default for SentryConfig {
    fn default() -> Self {
        Self::from_file(SentryConfigFile::default())
    }
}

impl SentryConfig {
    /// Load from the file named by `RODENT_CONFIG` (defaults when unset),
    /// then apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RODENT_CONFIG").ok();
        Self::load_with(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit path, then apply environment overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::load_with(Some(path))
    }

    fn load_with(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SentryConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentryConfigFile) -> Self {
        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraConfig {
            source: camera_file.source.unwrap_or(SourceKind::Rtsp),
            url: camera_file
                .url
                .unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
            path: camera_file.path,
            poll_interval_secs: camera_file
                .poll_interval_secs
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        };

        let video_file = file.video.unwrap_or_default();
        let video = VideoConfig {
            sample_interval_secs: video_file
                .sample_interval_secs
                .unwrap_or(DEFAULT_SAMPLE_INTERVAL_SECS),
            frame_skip: video_file.frame_skip,
            input_width: video_file.input_width.unwrap_or(DEFAULT_INPUT_SIZE),
            input_height: video_file.input_height.unwrap_or(DEFAULT_INPUT_SIZE),
            channel_order: video_file.channel_order.unwrap_or_default(),
        };

        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionConfig {
            backend: detection_file.backend.unwrap_or(BackendKind::Replay),
            model_path: detection_file.model_path,
            confidence_threshold: detection_file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            nms_iou_threshold: detection_file
                .nms_iou_threshold
                .unwrap_or(DEFAULT_NMS_IOU_THRESHOLD),
            classes: detection_file
                .classes
                .unwrap_or_else(|| vec![ClassLabel::NorwayRat, ClassLabel::RoofRat]),
            class_thresholds: detection_file.class_thresholds.unwrap_or_default(),
            activation: detection_file.activation.unwrap_or_default(),
            layout: detection_file.layout.unwrap_or_default(),
            nms_policy: detection_file.nms_policy.unwrap_or_default(),
            max_detections: detection_file
                .max_detections
                .unwrap_or(DEFAULT_MAX_DETECTIONS),
        };

        let alerts_file = file.alerts.unwrap_or_default();
        let alerts = AlertsConfig {
            cooldown_minutes: alerts_file
                .cooldown_minutes
                .unwrap_or(DEFAULT_COOLDOWN_MINUTES),
            enabled_channels: alerts_file
                .enabled_channels
                .unwrap_or_else(|| vec!["sms".to_string()]),
            channel_timeout: Duration::from_secs(
                alerts_file
                    .channel_timeout_secs
                    .unwrap_or(DEFAULT_CHANNEL_TIMEOUT_SECS),
            ),
            max_delivery_attempts: alerts_file
                .max_delivery_attempts
                .unwrap_or(DEFAULT_MAX_DELIVERY_ATTEMPTS),
            retry_backoff: Duration::from_secs(
                alerts_file
                    .retry_backoff_secs
                    .unwrap_or(DEFAULT_RETRY_BACKOFF_SECS),
            ),
            restore_cooldown: alerts_file.restore_cooldown.unwrap_or(true),
            drain_on_shutdown: alerts_file.drain_on_shutdown.unwrap_or(true),
        };

        let storage_file = file.storage.unwrap_or_default();
        let storage = StorageConfig {
            database_path: storage_file
                .database_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            images_path: storage_file
                .images_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGES_PATH)),
            retention_days: storage_file
                .retention_days
                .unwrap_or(DEFAULT_RETENTION_DAYS),
        };

        let system_file = file.system.unwrap_or_default();
        let system = SystemConfig {
            health_check_interval: Duration::from_secs(
                system_file
                    .health_check_interval_secs
                    .unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
            ),
            maintenance_interval: Duration::from_secs(
                system_file
                    .maintenance_interval_secs
                    .unwrap_or(DEFAULT_MAINTENANCE_INTERVAL_SECS),
            ),
            reconnect_initial: Duration::from_millis(
                system_file
                    .reconnect_initial_ms
                    .unwrap_or(DEFAULT_RECONNECT_INITIAL_MS),
            ),
            reconnect_max: Duration::from_millis(
                system_file
                    .reconnect_max_ms
                    .unwrap_or(DEFAULT_RECONNECT_MAX_MS),
            ),
            startup_delay: Duration::from_secs(system_file.startup_delay_secs.unwrap_or(0)),
        };

        Self {
            camera,
            video,
            detection,
            alerts,
            notifications: file.notifications.unwrap_or_default(),
            storage,
            system,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("RODENT_RTSP_URL") {
            if !url.trim().is_empty() {
                self.camera.url = url;
                self.camera.source = SourceKind::Rtsp;
            }
        }
        if let Ok(path) = std::env::var("RODENT_DB_PATH") {
            if !path.trim().is_empty() {
                self.storage.database_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("RODENT_IMAGES_PATH") {
            if !path.trim().is_empty() {
                self.storage.images_path = PathBuf::from(path);
            }
        }
        if let Ok(minutes) = std::env::var("RODENT_COOLDOWN_MINUTES") {
            self.alerts.cooldown_minutes = minutes
                .trim()
                .parse()
                .map_err(|_| anyhow!("RODENT_COOLDOWN_MINUTES must be a number of minutes"))?;
        }
        if let Ok(days) = std::env::var("RODENT_RETENTION_DAYS") {
            self.storage.retention_days = days
                .trim()
                .parse()
                .map_err(|_| anyhow!("RODENT_RETENTION_DAYS must be an integer number of days"))?;
        }
        if let Ok(threshold) = std::env::var("RODENT_CONFIDENCE_THRESHOLD") {
            self.detection.confidence_threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("RODENT_CONFIDENCE_THRESHOLD must be a number"))?;
        }
        if let Ok(channels) = std::env::var("RODENT_CHANNELS") {
            self.alerts.enabled_channels = split_csv(&channels);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let det = &self.detection;
        check_unit_interval("detection.confidence_threshold", det.confidence_threshold)?;
        check_unit_interval("detection.nms_iou_threshold", det.nms_iou_threshold)?;
        for (label, threshold) in &det.class_thresholds {
            check_unit_interval(&format!("detection.class_thresholds.{}", label), *threshold)?;
        }
        if det.classes.is_empty() {
            return Err(anyhow!("detection.classes must not be empty"));
        }
        if det.max_detections == 0 {
            return Err(anyhow!("detection.max_detections must be greater than zero"));
        }
        if self.video.input_width == 0 || self.video.input_height == 0 {
            return Err(anyhow!("video input size must be non-zero"));
        }
        let interval = self.video.sample_interval_secs;
        if !(0.0..=MAX_SAMPLE_INTERVAL_SECS).contains(&interval) {
            return Err(anyhow!(
                "video.sample_interval_secs must be between 0 and {}, got {}",
                MAX_SAMPLE_INTERVAL_SECS,
                interval
            ));
        }

        let cooldown = self.alerts.cooldown_minutes;
        if !(0.0..=MAX_COOLDOWN_MINUTES).contains(&cooldown) {
            return Err(anyhow!(
                "alerts.cooldown_minutes must be between 0 and {}, got {}",
                MAX_COOLDOWN_MINUTES,
                cooldown
            ));
        }
        let mut channels: Vec<String> = Vec::new();
        for name in &self.alerts.enabled_channels {
            let name = name.trim().to_lowercase();
            if !KNOWN_CHANNELS.contains(&name.as_str()) {
                return Err(anyhow!(
                    "unknown notification channel '{}' (expected one of {})",
                    name,
                    KNOWN_CHANNELS.join(", ")
                ));
            }
            if !channels.contains(&name) {
                channels.push(name);
            }
        }
        self.alerts.enabled_channels = channels;
        if self.alerts.max_delivery_attempts == 0 {
            return Err(anyhow!("alerts.max_delivery_attempts must be at least 1"));
        }
        if self.alerts.channel_timeout.is_zero() {
            return Err(anyhow!("alerts.channel_timeout_secs must be greater than zero"));
        }

        if self.storage.retention_days == 0 {
            return Err(anyhow!("storage.retention_days must be greater than zero"));
        }
        if matches!(self.camera.source, SourceKind::File | SourceKind::Directory)
            && self.camera.path.is_none()
        {
            return Err(anyhow!("camera.path is required for file and directory sources"));
        }
        if self.detection.backend == BackendKind::Tract && self.detection.model_path.is_none() {
            return Err(anyhow!("detection.model_path is required for the tract backend"));
        }
        if self.system.reconnect_max < self.system.reconnect_initial {
            self.system.reconnect_max = self.system.reconnect_initial;
        }
        Ok(())
    }
}

fn check_unit_interval(name: &str, value: f32) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(anyhow!("{} must be in (0, 1], got {}", name, value))
    }
}

fn read_config_file(path: &Path) -> Result<SentryConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let mut value: serde_json::Value = if is_toml {
        let parsed: toml::Value = toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
        serde_json::to_value(parsed)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    substitute_env(&mut value)?;
    let cfg = serde_json::from_value(value)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

/// Replace string values of the exact form `${NAME}` with `$NAME` from the
/// environment. Unset variables are left as-is.
fn substitute_env(value: &mut serde_json::Value) -> Result<()> {
    let pattern = Regex::new(r"^\$\{([A-Za-z_][A-Za-z0-9_]*)\}$")?;
    substitute_with(value, &pattern);
    Ok(())
}

fn substitute_with(value: &mut serde_json::Value, pattern: &Regex) {
    match value {
        serde_json::Value::String(s) => {
            let replacement = pattern
                .captures(s)
                .and_then(|caps| caps.get(1))
                .and_then(|name| std::env::var(name.as_str()).ok());
            if let Some(replacement) = replacement {
                *s = replacement;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_with(item, pattern);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                substitute_with(item, pattern);
            }
        }
        _ => {}
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
