use crate::domain::models::BleDevice;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

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
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
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
    "lockmate".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_rx_uuid")]
    pub ble_rx_char_uuid: String,
    #[serde(default = "default_tx_uuid")]
    pub ble_tx_char_uuid: String,
    #[serde(default = "default_name_marker")]
    pub device_name_marker: String,

    // Request Settings
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_notification_grace_ms")]
    pub notification_grace_ms: u64,

    // Provisioning Settings
    #[serde(default = "default_network_poll_interval_ms")]
    pub network_poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub join_max_attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub auth_max_attempts: u32,

    // Remembered locks
    #[serde(default)]
    pub known_devices: Vec<BleDevice>,
    #[serde(default)]
    pub last_connected_device: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),

            ble_service_uuid: default_service_uuid(),
            ble_rx_char_uuid: default_rx_uuid(),
            ble_tx_char_uuid: default_tx_uuid(),
            device_name_marker: default_name_marker(),

            request_timeout_ms: default_request_timeout_ms(),
            notification_grace_ms: default_notification_grace_ms(),

            network_poll_interval_ms: default_network_poll_interval_ms(),
            join_max_attempts: default_max_attempts(),
            auth_max_attempts: default_max_attempts(),

            known_devices: Vec::new(),
            last_connected_device: None,
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_rx_uuid() -> String {
    protocol::RX_CHAR_UUID.to_string()
}
fn default_tx_uuid() -> String {
    protocol::TX_CHAR_UUID.to_string()
}
fn default_name_marker() -> String {
    "lockmate".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_notification_grace_ms() -> u64 {
    100
}
fn default_network_poll_interval_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    5
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Settings backed by an explicit file; missing or unreadable files yield defaults
    pub fn with_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("Lockmate");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
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

    /// Remember a lock and mark it as the last one used
    pub fn add_known_device(&mut self, device: &BleDevice) -> anyhow::Result<()> {
        let known = &mut self.settings.known_devices;
        match known.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => *existing = device.clone(),
            None => known.push(device.clone()),
        }
        self.settings.last_connected_device = Some(device.id.clone());
        self.save()
    }

    pub fn last_connected_device(&self) -> Option<&BleDevice> {
        let id = self.settings.last_connected_device.as_ref()?;
        self.settings.known_devices.iter().find(|d| &d.id == id)
    }
}
