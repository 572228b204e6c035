use crate::domain::models::DeviceSelector;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
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
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
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
    "heart_rate_ble".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    /// Preferred device name for `connect`. Empty means "first compatible".
    #[serde(default)]
    pub device_name: String,

    /// Case-insensitive name substrings the watcher additionally filters on.
    /// An empty list disables name filtering.
    #[serde(default)]
    pub device_name_filters: Vec<String>,

    /// Whether the watcher enumerates paired or unpaired peripherals.
    #[serde(default = "default_false")]
    pub watch_paired_devices: bool,

    #[serde(default)]
    pub known_device_names: Vec<String>,
    #[serde(default)]
    pub last_connected_name: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            device_name: String::new(),
            device_name_filters: Vec::new(),
            watch_paired_devices: false,
            known_device_names: Vec::new(),
            last_connected_name: None,
        }
    }
}

impl Settings {
    pub fn watcher_selector(&self) -> DeviceSelector {
        if self.watch_paired_devices {
            DeviceSelector::BluetoothLePairedOnly
        } else {
            DeviceSelector::BluetoothLeUnpairedOnly
        }
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("HeartRateMonitor");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
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

    /// Records a successful connection so the next session can prefer the
    /// same peripheral.
    pub fn remember_device(&mut self, name: &str) -> anyhow::Result<()> {
        if !self
            .settings
            .known_device_names
            .iter()
            .any(|known| known.eq_ignore_ascii_case(name))
        {
            self.settings.known_device_names.push(name.to_string());
        }
        self.settings.last_connected_name = Some(name.to_string());
        self.save()
    }
}
