//! Recorder Protocol
//!
//! Outbound command encoding for the recorder's private frame format.
//!
//! # Frame Structure
//!
//! ```text
//! [0]     : Frame type (1 = control command, 2 = file stream)
//! [1-2]   : Command id (u16 little-endian)
//! [3..]   : Fixed-width payload, all integers little-endian
//! ```
//!
//! Outbound and inbound command ids are separate namespaces: the device
//! answers "stop sync" (29) with 30 and "delete" (30) with 31. Inbound
//! decoding lives in [`super::responses`].

use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Leading byte of every control frame.
pub const FRAME_TYPE_COMMAND: u8 = 1;

/// Leading byte of file-stream frames multiplexed on the notify characteristic.
pub const FRAME_TYPE_FILE_STREAM: u8 = 2;

/// Size of `[frame type, id lo, id hi]`.
pub const HEADER_LEN: usize = 3;

pub const TOKEN_LEN: usize = 16;
pub const DEVICE_TOKEN_LEN: usize = 8;
pub const WIFI_FIELD_LEN: usize = 33;

/// Command ids written by the client.
pub mod command_id {
    pub const HANDSHAKE: u16 = 1;
    pub const DEVICE_STATUS: u16 = 3;
    pub const TIME_SYNC: u16 = 4;
    pub const UNBIND: u16 = 5;
    pub const STORAGE_VOLUME: u16 = 6;
    pub const RESET_PASSWORD: u16 = 7;
    pub const GENERAL_SETTING: u16 = 8;
    pub const BATTERY: u16 = 9;
    pub const OPEN_WIFI: u16 = 10;
    pub const USB_MODE: u16 = 12;
    pub const SYSTEM_VERSION: u16 = 13;
    /// Bare for "close", with ssid/password payload for "configure"
    pub const CLOSE_WIFI: u16 = 14;
    pub const SEARCH_WIFI: u16 = 15;
    pub const RECORD_START: u16 = 20;
    pub const RECORD_PAUSE: u16 = 21;
    pub const RECORD_RESUME: u16 = 22;
    pub const RECORD_STOP: u16 = 23;
    pub const FILE_LIST: u16 = 26;
    pub const SYNC_FILE: u16 = 28;
    pub const SYNC_FILE_STOP: u16 = 29;
    pub const DELETE_RECORD: u16 = 30;
    pub const GET_RECORD_LED: u16 = 33;
    pub const SET_RECORD_LED: u16 = 34;
    pub const CLEAR_DATA: u16 = 104;
    pub const HEARTBEAT: u16 = 110;
}

/// Command ids of frames sent by the device.
pub mod response_id {
    pub const DEVICE_STATUS: u16 = 3;
    pub const TIME_SYNC: u16 = 4;
    pub const STORAGE_VOLUME: u16 = 6;
    pub const GENERAL_SETTING: u16 = 8;
    pub const BATTERY: u16 = 9;
    pub const WIFI_OPENED: u16 = 10;
    pub const USB_MODE: u16 = 12;
    pub const SYSTEM_VERSION: u16 = 13;
    pub const WIFI_CLOSED: u16 = 14;
    pub const RECORD_STARTED: u16 = 20;
    pub const RECORD_PAUSED: u16 = 21;
    pub const RECORD_RESUMED: u16 = 22;
    pub const RECORD_STOPPED: u16 = 23;
    pub const FILE_LIST: u16 = 26;
    pub const SYNC_FILE: u16 = 28;
    pub const SYNC_FILE_END: u16 = 29;
    pub const STOP_SYNC: u16 = 30;
    pub const DELETE_CONFIRM: u16 = 31;
    pub const GET_RECORD_LED: u16 = 33;
    pub const SET_RECORD_LED: u16 = 34;
    pub const HEARTBEAT: u16 = 110;
}

/// Device status codes carried in the 4-byte state field.
pub mod status_code {
    pub const RECORDING: u32 = 0x1003;
    pub const CHARGING: u32 = 0x2001;
    pub const OTA: u32 = 0x2003;
}

/// Standard Device Information service (0x180A).
pub mod device_info {
    pub const SERVICE: &str = "0000180a-0000-1000-8000-00805f9b34fb";
    pub const MANUFACTURER_NAME: &str = "00002a29-0000-1000-8000-00805f9b34fb";
    pub const MODEL_NUMBER: &str = "00002a24-0000-1000-8000-00805f9b34fb";
    pub const SERIAL_NUMBER: &str = "00002a25-0000-1000-8000-00805f9b34fb";
    pub const FIRMWARE_REVISION: &str = "00002a26-0000-1000-8000-00805f9b34fb";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingScene {
    Recording,
    Conference,
    Other(u8),
}

impl From<u8> for RecordingScene {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Recording,
            2 => Self::Conference,
            other => Self::Other(other),
        }
    }
}

impl From<RecordingScene> for u8 {
    fn from(scene: RecordingScene) -> Self {
        match scene {
            RecordingScene::Recording => 1,
            RecordingScene::Conference => 2,
            RecordingScene::Other(value) => value,
        }
    }
}

/// Commands understood by the recorder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Handshake phase one
    HandshakeHello { platform_type: u8, ble_version: u8 },
    /// Handshake phase two, binding this client to the device
    HandshakeBind {
        platform_type: u8,
        ble_version: u8,
        token: [u8; TOKEN_LEN],
        long_audio: bool,
        device_token: [u8; DEVICE_TOKEN_LEN],
        /// At most 255 bytes are sent
        client_name: String,
    },
    DeviceStatus,
    TimeSync { epoch_seconds: u32, timezone_hours: i8 },
    Unbind { clean_type: u8 },
    StorageVolume,
    ResetPassword,
    GeneralSetting { param: u8 },
    Battery,
    OpenWifi,
    SetUsbMode { mode: u8 },
    SystemVersion,
    CloseWifi,
    /// SSID and password are truncated or zero padded to 33 bytes each
    ConfigureWifi {
        ssid: String,
        password: String,
        test_server: u8,
    },
    SearchWifi,
    /// `session_id` of zero asks the device to allocate one
    StartRecord {
        record_type: u8,
        scene: RecordingScene,
        session_id: u32,
    },
    PauseRecord { session_id: u32 },
    ResumeRecord { session_id: u32, scene: RecordingScene },
    StopRecord,
    ListFiles {
        uid: u32,
        session_id: u32,
        only_one: bool,
    },
    /// File list query used at startup: recordings newer than `since` (epoch seconds)
    LoadRecordings { since: u32 },
    SyncFile {
        session_id: u32,
        start: u32,
        end: u32,
        no_header: bool,
    },
    StopSync,
    DeleteRecord { session_id: u32 },
    GetRecordLed,
    SetRecordLed { enabled: bool },
    ClearData,
    Heartbeat,
}

impl Command {
    /// Wire id of this command
    pub fn id(&self) -> u16 {
        use command_id::*;
        match self {
            Self::HandshakeHello { .. } | Self::HandshakeBind { .. } => HANDSHAKE,
            Self::DeviceStatus => DEVICE_STATUS,
            Self::TimeSync { .. } => TIME_SYNC,
            Self::Unbind { .. } => UNBIND,
            Self::StorageVolume => STORAGE_VOLUME,
            Self::ResetPassword => RESET_PASSWORD,
            Self::GeneralSetting { .. } => GENERAL_SETTING,
            Self::Battery => BATTERY,
            Self::OpenWifi => OPEN_WIFI,
            Self::SetUsbMode { .. } => USB_MODE,
            Self::SystemVersion => SYSTEM_VERSION,
            Self::CloseWifi | Self::ConfigureWifi { .. } => CLOSE_WIFI,
            Self::SearchWifi => SEARCH_WIFI,
            Self::StartRecord { .. } => RECORD_START,
            Self::PauseRecord { .. } => RECORD_PAUSE,
            Self::ResumeRecord { .. } => RECORD_RESUME,
            Self::StopRecord => RECORD_STOP,
            Self::ListFiles { .. } | Self::LoadRecordings { .. } => FILE_LIST,
            Self::SyncFile { .. } => SYNC_FILE,
            Self::StopSync => SYNC_FILE_STOP,
            Self::DeleteRecord { .. } => DELETE_RECORD,
            Self::GetRecordLed => GET_RECORD_LED,
            Self::SetRecordLed { .. } => SET_RECORD_LED,
            Self::ClearData => CLEAR_DATA,
            Self::Heartbeat => HEARTBEAT,
        }
    }

    /// Encode into a complete frame ready for the write characteristic.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 16);
        buf.put_u8(FRAME_TYPE_COMMAND);
        buf.put_u16_le(self.id());

        match self {
            Self::HandshakeHello {
                platform_type,
                ble_version,
            } => {
                buf.put_u8(*platform_type);
                buf.put_u8(*ble_version);
                buf.put_u8(0);
            }
            Self::HandshakeBind {
                platform_type,
                ble_version,
                token,
                long_audio,
                device_token,
                client_name,
            } => {
                let name = client_name.as_bytes();
                let name = &name[..name.len().min(u8::MAX as usize)];
                buf.put_u8(*platform_type);
                buf.put_u8(*ble_version);
                buf.put_u8(1);
                buf.put_slice(token);
                buf.put_u8(u8::from(*long_audio));
                buf.put_slice(device_token);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name);
            }
            Self::TimeSync {
                epoch_seconds,
                timezone_hours,
            } => {
                buf.put_u32_le(*epoch_seconds);
                buf.put_i8(*timezone_hours);
            }
            Self::Unbind { clean_type } => buf.put_u8(*clean_type),
            Self::GeneralSetting { param } => buf.put_u8(*param),
            Self::SetUsbMode { mode } => buf.put_u8(*mode),
            Self::ConfigureWifi {
                ssid,
                password,
                test_server,
            } => {
                put_fixed_str(&mut buf, ssid, WIFI_FIELD_LEN);
                put_fixed_str(&mut buf, password, WIFI_FIELD_LEN);
                buf.put_u8(*test_server);
            }
            Self::StartRecord {
                record_type,
                scene,
                session_id,
            } => {
                buf.put_u8(*record_type);
                buf.put_u8((*scene).into());
                buf.put_u32_le(*session_id);
            }
            Self::PauseRecord { session_id } => buf.put_u32_le(*session_id),
            Self::ResumeRecord { session_id, scene } => {
                buf.put_u32_le(*session_id);
                buf.put_u8((*scene).into());
            }
            Self::ListFiles {
                uid,
                session_id,
                only_one,
            } => {
                buf.put_u32_le(*uid);
                buf.put_u32_le(*session_id);
                buf.put_u8(u8::from(*only_one));
            }
            Self::LoadRecordings { since } => buf.put_u32_le(*since),
            Self::SyncFile {
                session_id,
                start,
                end,
                no_header,
            } => {
                buf.put_u32_le(*session_id);
                buf.put_u32_le(*start);
                buf.put_u32_le(*end);
                buf.put_u8(u8::from(*no_header));
            }
            Self::DeleteRecord { session_id } => buf.put_u32_le(*session_id),
            Self::SetRecordLed { enabled } => buf.put_u8(u8::from(*enabled)),
            Self::DeviceStatus
            | Self::StorageVolume
            | Self::ResetPassword
            | Self::Battery
            | Self::OpenWifi
            | Self::SystemVersion
            | Self::CloseWifi
            | Self::SearchWifi
            | Self::StopRecord
            | Self::StopSync
            | Self::GetRecordLed
            | Self::ClearData
            | Self::Heartbeat => {}
        }

        buf
    }
}

/// Copy `value` into exactly `width` bytes, truncating or zero padding.
fn put_fixed_str(buf: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(width);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, width - n);
}

/// Pack an ASCII token into its fixed 16-byte slot.
pub fn token_bytes(token: &str) -> [u8; TOKEN_LEN] {
    let mut out = [0u8; TOKEN_LEN];
    let bytes = token.as_bytes();
    let n = bytes.len().min(TOKEN_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Parse a dashed UUID string into its 128-bit value
pub fn parse_uuid(uuid_str: &str) -> anyhow::Result<u128> {
    let uuid_str = uuid_str.replace('-', "");

    if uuid_str.len() != 32 {
        return Err(anyhow::anyhow!("Invalid UUID format"));
    }

    Ok(u128::from_str_radix(&uuid_str, 16)?)
}

/// Render a frame as space separated hex for logs.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
