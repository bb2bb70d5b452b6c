use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

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
    "recorder_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// GATT layout of the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub notify_char_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub write_char_uuid: String,
    /// Empty string accepts every advertised name
    #[serde(default)]
    pub device_name_prefix: String,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            notify_char_uuid: default_notify_uuid(),
            write_char_uuid: default_write_uuid(),
            device_name_prefix: String::new(),
        }
    }
}

fn default_service_uuid() -> String {
    "00001910-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_notify_uuid() -> String {
    "00002bb0-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_write_uuid() -> String {
    "00002bb1-0000-1000-8000-00805f9b34fb".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// Devices not seen for this long are evicted
    #[serde(default = "default_device_timeout_secs")]
    pub device_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    #[serde(default = "default_nearest_update_interval_ms")]
    pub nearest_update_interval_ms: u64,
    #[serde(default = "default_min_rssi")]
    pub min_rssi: i16,
    #[serde(default = "default_nearest_rssi_threshold")]
    pub nearest_rssi_threshold: i16,
    /// Used when the picker does not report a signal strength
    #[serde(default = "default_assumed_rssi")]
    pub assumed_rssi: i16,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            scan_timeout_ms: default_scan_timeout_ms(),
            device_timeout_secs: default_device_timeout_secs(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            nearest_update_interval_ms: default_nearest_update_interval_ms(),
            min_rssi: default_min_rssi(),
            nearest_rssi_threshold: default_nearest_rssi_threshold(),
            assumed_rssi: default_assumed_rssi(),
        }
    }
}

impl ScannerSettings {
    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn nearest_update_interval(&self) -> Duration {
        Duration::from_millis(self.nearest_update_interval_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

fn default_scan_timeout_ms() -> u64 {
    30_000
}
fn default_device_timeout_secs() -> u64 {
    10
}
fn default_cleanup_interval_ms() -> u64 {
    3_000
}
fn default_nearest_update_interval_ms() -> u64 {
    5_000
}
fn default_min_rssi() -> i16 {
    -100
}
fn default_nearest_rssi_threshold() -> i16 {
    -80
}
fn default_assumed_rssi() -> i16 {
    -60
}

/// Identity presented to the recorder during the two-phase handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeSettings {
    #[serde(default = "default_platform_type")]
    pub platform_type: u8,
    #[serde(default = "default_ble_version")]
    pub ble_version: u8,
    /// Sent as 16 raw bytes, zero padded
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_false")]
    pub long_audio: bool,
    /// 8 bytes as hex; all zeros unless bound by QR code
    #[serde(default = "default_device_token")]
    pub device_token_hex: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Fixed wait between the two phases; the device never acknowledges phase one
    #[serde(default = "default_phase_delay_ms")]
    pub phase_delay_ms: u64,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            platform_type: default_platform_type(),
            ble_version: default_ble_version(),
            token: String::new(),
            long_audio: false,
            device_token_hex: default_device_token(),
            client_name: default_client_name(),
            phase_delay_ms: default_phase_delay_ms(),
        }
    }
}

impl HandshakeSettings {
    pub fn phase_delay(&self) -> Duration {
        Duration::from_millis(self.phase_delay_ms)
    }

    /// Decodes `device_token_hex`; malformed input yields the all-zero token.
    pub fn device_token(&self) -> [u8; 8] {
        let mut token = [0u8; 8];
        let hex = self.device_token_hex.trim();
        if hex.len() != 16 || !hex.is_ascii() {
            return token;
        }
        for (i, byte) in token.iter_mut().enumerate() {
            match u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16) {
                Ok(b) => *byte = b,
                Err(_) => return [0u8; 8],
            }
        }
        token
    }
}

fn default_platform_type() -> u8 {
    3
}
fn default_ble_version() -> u8 {
    1
}
fn default_device_token() -> String {
    "0000000000000000".to_string()
}
fn default_client_name() -> String {
    "recorder-link".to_string()
}
fn default_phase_delay_ms() -> u64 {
    1_000
}

/// Parameters of the post-connect initialization sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_lookback_days")]
    pub file_list_lookback_days: u32,
    #[serde(default)]
    pub usb_mode: u8,
    #[serde(default = "default_general_setting_param")]
    pub general_setting_param: u8,
    /// Type byte sent with record start
    #[serde(default = "default_record_type")]
    pub record_type: u8,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            file_list_lookback_days: default_lookback_days(),
            usb_mode: 0,
            general_setting_param: default_general_setting_param(),
            record_type: default_record_type(),
        }
    }
}

fn default_lookback_days() -> u32 {
    180
}
fn default_general_setting_param() -> u8 {
    1
}
fn default_record_type() -> u8 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub known_device_ids: Vec<String>,
    #[serde(default)]
    pub last_connected_device: Option<String>,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub scanner: ScannerSettings,
    #[serde(default)]
    pub handshake: HandshakeSettings,
    #[serde(default)]
    pub sync: SyncSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Loads settings from `path`, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let settings_path = path.into();
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("RecorderLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
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

    pub fn remember_device(&mut self, id: &str) -> anyhow::Result<()> {
        if !self.settings.known_device_ids.iter().any(|known| known == id) {
            self.settings.known_device_ids.push(id.to_string());
        }
        self.settings.last_connected_device = Some(id.to_string());
        self.save()
    }
}
