use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adjust::Adjustments;
use crate::catalog::EquipmentCatalog;
use crate::ingest::{CaptureOptions, SourceDescriptor};
use crate::store::SettingsRow;

const DEFAULT_MODEL_PATH: &str = "models/ppe.onnx";
const DEFAULT_DB_PATH: &str = "ppe_detections.db";
const DEFAULT_CAMERA_ID: u32 = 0;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
const DEFAULT_ALERT_FREQUENCY: u32 = 2500;
const DEFAULT_ALERT_DURATION_MS: u64 = 1000;
const DEFAULT_DELAY_TIME_S: f64 = 5.0;
const DEFAULT_DISPLAY_MS: u64 = 2000;
const DEFAULT_API_ADDR: &str = "127.0.0.1:8797";

/// Audible cue range accepted by common tone generators.
pub const ALERT_FREQUENCY_MIN: u32 = 37;
pub const ALERT_FREQUENCY_MAX: u32 = 32767;

// ----------------------------------------------------------------------------
// On-disk document
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct PpeConfigFile {
    paths: Option<PathsFile>,
    camera: Option<CameraFile>,
    detection: Option<DetectionFile>,
    alerts: Option<AlertsFile>,
    api: Option<ApiFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PathsFile {
    model: Option<String>,
    database: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraFile {
    id: Option<u32>,
    url: Option<String>,
    resolution: Option<ResolutionFile>,
    default_settings: Option<DefaultSettingsFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ResolutionFile {
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DefaultSettingsFile {
    brightness: Option<u16>,
    contrast: Option<u16>,
    sharpness: Option<u8>,
    grayscale: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionFile {
    min_confidence: Option<f32>,
    label_font: Option<PathBuf>,
    classes: Option<ClassesFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassesFile {
    absent: Option<Vec<String>>,
    present: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsFile {
    frequency: Option<u32>,
    duration: Option<u64>,
    delay_time: Option<f64>,
    display_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiFile {
    addr: Option<String>,
}

// ----------------------------------------------------------------------------
// Resolved configuration
// ----------------------------------------------------------------------------

/// Fully resolved configuration. Serializes back to the document layout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PpeConfig {
    pub paths: PathSettings,
    pub camera: CameraSettings,
    pub detection: DetectionSettings,
    pub alerts: AlertSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathSettings {
    pub model: String,
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraSettings {
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub resolution: Resolution,
    pub default_settings: Adjustments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionSettings {
    pub min_confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_font: Option<PathBuf>,
    pub classes: ClassNames,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassNames {
    pub absent: Vec<String>,
    pub present: Vec<String>,
}

/// `duration` and `display_ms` are milliseconds, `delay_time` is seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertSettings {
    pub frequency: u32,
    pub duration: u64,
    pub delay_time: f64,
    pub display_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiSettings {
    pub addr: String,
}

impl PpeConfig {
    /// Load from `PPE_CONFIG` (if set), then apply env overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PPE_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit file, then apply env overrides and validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) if path.exists() => Some(read_config_file(path)?),
            Some(path) => {
                log::warn!(
                    "config file {} not found, using defaults",
                    path.display()
                );
                None
            }
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PpeConfigFile) -> Self {
        let defaults_catalog = EquipmentCatalog::default();
        let default_names = |absent: bool| -> Vec<String> {
            defaults_catalog
                .entries()
                .filter(|(id, _)| crate::catalog::is_absent_class(*id) == absent)
                .map(|(_, name)| name.to_string())
                .collect()
        };

        let paths = file.paths.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let resolution = camera.resolution.unwrap_or_default();
        let adjust = camera.default_settings.unwrap_or_default();
        let neutral = Adjustments::default();
        let detection = file.detection.unwrap_or_default();
        let classes = detection.classes.unwrap_or_default();
        let alerts = file.alerts.unwrap_or_default();

        Self {
            paths: PathSettings {
                model: paths
                    .model
                    .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()),
                database: paths
                    .database
                    .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            },
            camera: CameraSettings {
                id: camera.id.unwrap_or(DEFAULT_CAMERA_ID),
                url: camera.url.filter(|url| !url.trim().is_empty()),
                resolution: Resolution {
                    width: resolution.width.unwrap_or(DEFAULT_WIDTH),
                    height: resolution.height.unwrap_or(DEFAULT_HEIGHT),
                },
                default_settings: Adjustments {
                    brightness: adjust.brightness.unwrap_or(neutral.brightness),
                    contrast: adjust.contrast.unwrap_or(neutral.contrast),
                    sharpness: adjust.sharpness.unwrap_or(neutral.sharpness),
                    grayscale: adjust.grayscale.unwrap_or(neutral.grayscale),
                },
            },
            detection: DetectionSettings {
                min_confidence: detection.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
                label_font: detection.label_font,
                classes: ClassNames {
                    absent: classes.absent.unwrap_or_else(|| default_names(true)),
                    present: classes.present.unwrap_or_else(|| default_names(false)),
                },
            },
            alerts: AlertSettings {
                frequency: alerts.frequency.unwrap_or(DEFAULT_ALERT_FREQUENCY),
                duration: alerts.duration.unwrap_or(DEFAULT_ALERT_DURATION_MS),
                delay_time: alerts.delay_time.unwrap_or(DEFAULT_DELAY_TIME_S),
                display_ms: alerts.display_ms.unwrap_or(DEFAULT_DISPLAY_MS),
            },
            api: ApiSettings {
                addr: file
                    .api
                    .and_then(|api| api.addr)
                    .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("PPE_CAMERA_URL") {
            if !url.trim().is_empty() {
                self.camera.url = Some(url);
            }
        }
        if let Ok(id) = std::env::var("PPE_CAMERA_ID") {
            if !id.trim().is_empty() {
                self.camera.id = id
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("PPE_CAMERA_ID must be a device index"))?;
            }
        }
        if let Ok(model) = std::env::var("PPE_MODEL_PATH") {
            if !model.trim().is_empty() {
                self.paths.model = model;
            }
        }
        if let Ok(db) = std::env::var("PPE_DB_PATH") {
            if !db.trim().is_empty() {
                self.paths.database = db;
            }
        }
        if let Ok(conf) = std::env::var("PPE_MIN_CONFIDENCE") {
            if !conf.trim().is_empty() {
                self.detection.min_confidence = conf
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("PPE_MIN_CONFIDENCE must be a number in 0..=1"))?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.paths.model.trim().is_empty() {
            return Err(anyhow!("paths.model must not be empty"));
        }
        if self.paths.database.trim().is_empty() {
            return Err(anyhow!("paths.database must not be empty"));
        }
        if self.camera.resolution.width == 0 || self.camera.resolution.height == 0 {
            return Err(anyhow!("camera resolution must be non-zero"));
        }
        self.camera.default_settings.validate()?;
        validate_confidence(self.detection.min_confidence)?;
        self.catalog()?;
        if !(ALERT_FREQUENCY_MIN..=ALERT_FREQUENCY_MAX).contains(&self.alerts.frequency) {
            return Err(anyhow!(
                "alerts.frequency must be within {}..={} Hz, got {}",
                ALERT_FREQUENCY_MIN,
                ALERT_FREQUENCY_MAX,
                self.alerts.frequency
            ));
        }
        if self.alerts.duration == 0 {
            return Err(anyhow!("alerts.duration must be greater than zero"));
        }
        if !self.alerts.delay_time.is_finite() || self.alerts.delay_time < 0.0 {
            return Err(anyhow!(
                "alerts.delay_time must be a non-negative number of seconds"
            ));
        }
        Ok(())
    }

    /// Stream URL when one is configured, else the device index.
    pub fn camera_source(&self) -> SourceDescriptor {
        match &self.camera.url {
            Some(url) if !url.trim().is_empty() => SourceDescriptor::Stream(url.trim().to_string()),
            _ => SourceDescriptor::Device(self.camera.id),
        }
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            width: self.camera.resolution.width,
            height: self.camera.resolution.height,
        }
    }

    pub fn catalog(&self) -> Result<EquipmentCatalog> {
        EquipmentCatalog::new(&self.detection.classes.present, &self.detection.classes.absent)
            .context("detection.classes")
    }

    pub fn alert_delay(&self) -> Duration {
        Duration::from_secs_f64(self.alerts.delay_time.max(0.0))
    }

    pub fn settings_row(&self) -> SettingsRow {
        let adjust = &self.camera.default_settings;
        SettingsRow {
            width: self.camera.resolution.width,
            height: self.camera.resolution.height,
            brightness: adjust.brightness,
            contrast: adjust.contrast,
            sharpness: adjust.sharpness,
            grayscale: adjust.grayscale,
            min_confidence: self.detection.min_confidence,
            alert_frequency: self.alerts.frequency,
            alert_duration_ms: self.alerts.duration,
            delay_time_s: self.alerts.delay_time,
            absent_classes: self.detection.classes.absent.clone(),
            present_classes: self.detection.classes.present.clone(),
        }
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, format!("{raw}\n"))
            .map_err(|e| anyhow!("failed to write config file {}: {}", path.display(), e))
    }
}

impl Default for PpeConfig {
    fn default() -> Self {
        Self::from_file(PpeConfigFile::default())
    }
}

fn validate_confidence(value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!(
            "detection.min_confidence must be within 0..=1, got {}",
            value
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<PpeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

// ----------------------------------------------------------------------------
// Live settings updates
// ----------------------------------------------------------------------------

/// One recognised live setting.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingUpdate {
    Brightness(u16),
    Contrast(u16),
    Sharpness(u8),
    Grayscale(bool),
    MinConfidence(f32),
    AlertFrequency(u32),
    /// Milliseconds.
    AlertDuration(u64),
    /// Seconds.
    DelayTime(f64),
    CameraUrl(Option<String>),
    CameraId(u32),
}

impl SettingUpdate {
    /// Map a textual `key value` pair onto a setting.
    ///
    /// Integer settings accept fractional text and truncate it, as slider
    /// positions do. Unknown keys are rejected.
    pub fn parse(key: &str, value: &str) -> Result<Self> {
        let value = value.trim();
        let update = match key.trim() {
            "brightness" => Self::Brightness(parse_integer(key, value)?),
            "contrast" => Self::Contrast(parse_integer(key, value)?),
            "sharpness" => Self::Sharpness(parse_integer(key, value)?),
            "grayscale" => Self::Grayscale(parse_flag(key, value)?),
            "min_confidence" => Self::MinConfidence(
                value
                    .parse()
                    .map_err(|_| anyhow!("{} expects a number, got '{}'", key, value))?,
            ),
            "alert_frequency" => Self::AlertFrequency(parse_integer(key, value)?),
            "alert_duration" => Self::AlertDuration(parse_integer(key, value)?),
            "delay_time" => Self::DelayTime(
                value
                    .parse()
                    .map_err(|_| anyhow!("{} expects seconds, got '{}'", key, value))?,
            ),
            "url" | "camera_url" => {
                Self::CameraUrl(Some(value.to_string()).filter(|url| !url.is_empty()))
            }
            "id" | "camera_id" => Self::CameraId(parse_integer(key, value)?),
            other => return Err(anyhow!("unknown setting '{}'", other)),
        };
        Ok(update)
    }

    /// Parse a `key value` control line. Blank lines and `#` comments yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (key, value) = line
            .split_once(char::is_whitespace)
            .unwrap_or((line, ""));
        Self::parse(key, value).map(Some)
    }

    pub fn key(&self) -> &'static str {
        match self {
            Self::Brightness(_) => "brightness",
            Self::Contrast(_) => "contrast",
            Self::Sharpness(_) => "sharpness",
            Self::Grayscale(_) => "grayscale",
            Self::MinConfidence(_) => "min_confidence",
            Self::AlertFrequency(_) => "alert_frequency",
            Self::AlertDuration(_) => "alert_duration",
            Self::DelayTime(_) => "delay_time",
            Self::CameraUrl(_) => "url",
            Self::CameraId(_) => "id",
        }
    }

    /// Whether the capture source must be reopened after this update.
    pub fn changes_source(&self) -> bool {
        matches!(self, Self::CameraUrl(_) | Self::CameraId(_))
    }

    fn apply_to(&self, cfg: &mut PpeConfig) {
        let adjust = &mut cfg.camera.default_settings;
        match self {
            Self::Brightness(v) => adjust.brightness = *v,
            Self::Contrast(v) => adjust.contrast = *v,
            Self::Sharpness(v) => adjust.sharpness = *v,
            Self::Grayscale(v) => adjust.grayscale = *v,
            Self::MinConfidence(v) => cfg.detection.min_confidence = *v,
            Self::AlertFrequency(v) => cfg.alerts.frequency = *v,
            Self::AlertDuration(v) => cfg.alerts.duration = *v,
            Self::DelayTime(v) => cfg.alerts.delay_time = *v,
            Self::CameraUrl(v) => cfg.camera.url = v.clone(),
            Self::CameraId(v) => cfg.camera.id = *v,
        }
    }
}

fn parse_integer<T: TryFrom<u64>>(key: &str, value: &str) -> Result<T> {
    let number: f64 = value
        .parse()
        .map_err(|_| anyhow!("{} expects a number, got '{}'", key, value))?;
    if !number.is_finite() || number < 0.0 {
        return Err(anyhow!("{} must be a non-negative number, got '{}'", key, value));
    }
    T::try_from(number.trunc() as u64).map_err(|_| anyhow!("{} value {} is out of range", key, value))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(anyhow!("{} expects true or false, got '{}'", key, value)),
    }
}

// ----------------------------------------------------------------------------
// ConfigStore
// ----------------------------------------------------------------------------

/// Current configuration snapshot plus its backing file.
///
/// Readers take `snapshot()` and never observe a half-applied update; writers
/// are serialized and persist the document before the new snapshot is published.
pub struct ConfigStore {
    current: ArcSwap<PpeConfig>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(cfg: PpeConfig, path: Option<PathBuf>) -> Self {
        Self {
            current: ArcSwap::from_pointee(cfg),
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<PpeConfig> {
        self.current.load_full()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Value at a dotted path such as `camera.resolution.width`.
    pub fn get(&self, dotted: &str) -> Result<Value> {
        let doc = serde_json::to_value(&*self.snapshot())?;
        let mut node = &doc;
        for segment in dotted.split('.').filter(|s| !s.is_empty()) {
            node = node
                .get(segment)
                .ok_or_else(|| anyhow!("unknown config key '{}'", dotted))?;
        }
        Ok(node.clone())
    }

    /// Validate, persist and publish `update`. On error the previous snapshot
    /// stays current.
    pub fn apply(&self, update: &SettingUpdate) -> Result<Arc<PpeConfig>> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("config write lock poisoned"))?;
        let mut next = (*self.current.load_full()).clone();
        update.apply_to(&mut next);
        let outcome = next.validate().and_then(|()| match &self.path {
            Some(path) => next.write_to(path),
            None => Ok(()),
        });
        if let Err(err) = outcome {
            log::warn!("config: rejected {} update: {:#}", update.key(), err);
            return Err(err);
        }
        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        log::info!("config: applied {:?}", update);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_use_the_device_index() -> Result<()> {
        let cfg = PpeConfig::default();
        cfg.validate()?;
        assert_eq!(cfg.camera_source(), SourceDescriptor::Device(0));
        assert_eq!(cfg.catalog()?, EquipmentCatalog::default());
        assert_eq!(cfg.alert_delay(), Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn non_empty_url_wins_over_id() {
        let mut cfg = PpeConfig::default();
        cfg.camera.id = 2;
        cfg.camera.url = Some("rtsp://cam/1".to_string());
        assert_eq!(
            cfg.camera_source(),
            SourceDescriptor::Stream("rtsp://cam/1".to_string())
        );
        cfg.camera.url = Some("  ".to_string());
        assert_eq!(cfg.camera_source(), SourceDescriptor::Device(2));
    }

    #[test]
    fn partial_documents_fill_from_defaults() -> Result<()> {
        let file: PpeConfigFile = serde_json::from_str(
            r#"{"camera": {"default_settings": {"contrast": 150}}, "alerts": {"delay_time": 2.5}}"#,
        )?;
        let cfg = PpeConfig::from_file(file);
        assert_eq!(cfg.camera.default_settings.contrast, 150);
        assert_eq!(cfg.camera.default_settings.brightness, 100);
        assert_eq!(cfg.alerts.delay_time, 2.5);
        assert_eq!(cfg.alerts.frequency, DEFAULT_ALERT_FREQUENCY);
        Ok(())
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let mut cfg = PpeConfig::default();
        cfg.camera.default_settings.sharpness = 11;
        assert!(cfg.validate().is_err());

        let mut cfg = PpeConfig::default();
        cfg.alerts.frequency = 20;
        assert!(cfg.validate().is_err());

        let mut cfg = PpeConfig::default();
        cfg.detection.classes.absent.pop();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn setting_parse_truncates_and_rejects_unknown_keys() -> Result<()> {
        assert_eq!(
            SettingUpdate::parse("brightness", "150.7")?,
            SettingUpdate::Brightness(150)
        );
        assert_eq!(
            SettingUpdate::parse("grayscale", "on")?,
            SettingUpdate::Grayscale(true)
        );
        assert_eq!(
            SettingUpdate::parse("url", "")?,
            SettingUpdate::CameraUrl(None)
        );
        assert!(SettingUpdate::parse("sharpness", "300").is_err());
        assert!(SettingUpdate::parse("brightness", "-1").is_err());
        assert!(SettingUpdate::parse("exposure", "10").is_err());

        assert_eq!(
            SettingUpdate::parse_line("  delay_time 2.5 ")?,
            Some(SettingUpdate::DelayTime(2.5))
        );
        assert_eq!(
            SettingUpdate::parse_line("url rtsp://cam/stream")?,
            Some(SettingUpdate::CameraUrl(Some("rtsp://cam/stream".to_string())))
        );
        assert_eq!(SettingUpdate::parse_line("# comment")?, None);
        assert!(SettingUpdate::parse_line("contrast").is_err());
        Ok(())
    }

    #[test]
    fn rejected_update_keeps_previous_snapshot() -> Result<()> {
        let store = ConfigStore::new(PpeConfig::default(), None);
        let before = store.snapshot();
        assert!(store.apply(&SettingUpdate::Brightness(250)).is_err());
        assert_eq!(*store.snapshot(), *before);

        store.apply(&SettingUpdate::Brightness(180))?;
        assert_eq!(store.get("camera.default_settings.brightness")?, 180);
        assert_eq!(before.camera.default_settings.brightness, 100);
        assert!(store.get("camera.nope").is_err());
        Ok(())
    }
}
