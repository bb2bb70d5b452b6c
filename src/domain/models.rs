use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::infrastructure::bluetooth::responses::GeneralSettings;

/// Opaque reference to a platform device, produced by the picker and
/// consumed by the link backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub id: String,
    /// Bluetooth address where the platform exposes one (WinRT does).
    pub address: Option<u64>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: None,
        }
    }

    pub fn with_address(address: u64) -> Self {
        Self {
            id: format!("{:012X}", address),
            address: Some(address),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: String,
    /// Signal strength in dBm
    pub rssi: i16,
    pub last_seen: Instant,
    pub is_nearest: bool,
    pub handle: DeviceHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Recording activity as last reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AudioActivity {
    #[default]
    Idle,
    Ready,
    Recording,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatteryState {
    pub level: u8,
    pub charging: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageState {
    pub total_bytes: u32,
    pub free_bytes: u32,
    pub used_bytes: u32,
    /// 0-100
    pub usage_percent: u8,
    pub is_full: bool,
}

/// Strings read from the Device Information service. Fields the device does
/// not expose stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_revision: Option<String>,
}

/// Everything the engine knows about the connected recorder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatusSnapshot {
    pub is_recording: bool,
    pub is_charging: bool,
    pub is_ota: bool,
    pub battery: Option<BatteryState>,
    pub storage: Option<StorageState>,
    pub general_settings: Option<GeneralSettings>,
    pub led_enabled: Option<bool>,
    pub system_version: Option<String>,
    pub device_info: DeviceInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub session_id: u32,
    pub file_size: u32,
    pub attr: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

/// Events published by the engine to whoever renders its state.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ConnectionStatus(ConnectionStatus),
    DevicesChanged(Vec<DiscoveredDevice>),
    StatusUpdated(DeviceStatusSnapshot),
    AudioActivity(AudioActivity),
    FilesUpdated(Vec<FileDescriptor>),
    TransferStarted { session_id: u32, expected_size: u32 },
    TransferProgress { session_id: u32, progress: u8 },
    TransferCompleted { session_id: u32, size: u32, crc: u16 },
    TransferFailed { session_id: u32, reason: String },
    TransferCancelled { session_id: u32 },
    LogMessage(StatusMessage),
}
