use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_true")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_true(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_network".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Timing and retry parameters of the network engine.
///
/// Handed to `BleNetwork::new` once; workers never see a later change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Floor for the sweep interval; tighter requirements are clamped with a warning.
    #[serde(default = "default_lowest_valid_polling_time_ms")]
    pub lowest_valid_polling_time_ms: u64,
    /// Attempts made when resolving a device or service.
    #[serde(default = "default_device_get_trials")]
    pub device_get_trials: u32,
    /// Per-attempt timeout when resolving a device or service.
    #[serde(default = "default_device_get_timeout_ms")]
    pub device_get_timeout_ms: u64,
    /// Discovery attempts per discovery cycle.
    #[serde(default = "default_discovery_trials")]
    pub discovery_trials: u32,
    /// Pause between discovery cycles.
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
    /// Pause between attempts inside one cycle.
    #[serde(default = "default_discovery_cycling_time_ms")]
    pub discovery_cycling_time_ms: u64,
    /// Share of the tightest interval slept between sweeps, 1..=100.
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: u8,
    /// Bound of the ordered value queue.
    #[serde(default = "default_value_queue_capacity")]
    pub value_queue_capacity: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            lowest_valid_polling_time_ms: default_lowest_valid_polling_time_ms(),
            device_get_trials: default_device_get_trials(),
            device_get_timeout_ms: default_device_get_timeout_ms(),
            discovery_trials: default_discovery_trials(),
            discovery_interval_ms: default_discovery_interval_ms(),
            discovery_cycling_time_ms: default_discovery_cycling_time_ms(),
            jitter_percent: default_jitter_percent(),
            value_queue_capacity: default_value_queue_capacity(),
        }
    }
}

impl NetworkSettings {
    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=100).contains(&self.jitter_percent) {
            return Err(Error::Config(format!(
                "jitter_percent must be within 1..=100, got {}",
                self.jitter_percent
            )));
        }
        if self.lowest_valid_polling_time_ms == 0 {
            return Err(Error::Config(
                "lowest_valid_polling_time_ms must be positive".to_string(),
            ));
        }
        if self.discovery_trials == 0 {
            return Err(Error::Config("discovery_trials must be positive".to_string()));
        }
        if self.value_queue_capacity == 0 {
            return Err(Error::Config(
                "value_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lowest_valid_polling_time(&self) -> Duration {
        Duration::from_millis(self.lowest_valid_polling_time_ms)
    }

    pub fn device_get_timeout(&self) -> Duration {
        Duration::from_millis(self.device_get_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn discovery_cycling_time(&self) -> Duration {
        Duration::from_millis(self.discovery_cycling_time_ms)
    }
}

fn default_lowest_valid_polling_time_ms() -> u64 {
    1000
}
fn default_device_get_trials() -> u32 {
    1
}
fn default_device_get_timeout_ms() -> u64 {
    0
}
fn default_discovery_trials() -> u32 {
    5
}
fn default_discovery_interval_ms() -> u64 {
    30_000
}
fn default_discovery_cycling_time_ms() -> u64 {
    4000
}
fn default_jitter_percent() -> u8 {
    50
}
fn default_value_queue_capacity() -> usize {
    256
}

/// One monitored characteristic in a device description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicConfig {
    pub service_uuid: String,
    pub characteristic_uuid: String,
    /// Overrides the device-wide polling time for this characteristic.
    #[serde(default)]
    pub polling_time_ms: Option<u64>,
    /// Name of the payload decoder used by the host binary ("raw", "utf8", "u8", "i16le", ...).
    #[serde(default)]
    pub decoder: Option<String>,
}

/// Declarative description of a device a driver wants monitored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub mac: String,
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default = "default_device_polling_time_ms")]
    pub polling_time_ms: u64,
    #[serde(default)]
    pub characteristics: Vec<CharacteristicConfig>,
}

fn default_device_polling_time_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Engine Settings
    #[serde(default)]
    pub network: NetworkSettings,

    // Monitored devices
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from the platform config directory.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::open(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults.
    pub fn open(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                if settings_path.exists() {
                    warn!(
                        "Could not read settings from {}: {}. Using defaults.",
                        settings_path.display(),
                        e
                    );
                }
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleNetwork");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&contents)?;
        settings.network.validate()?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}
