//! Responses from the recorder.
//!
//! [`Response::decode`] never fails: undersized frames and unknown ids come
//! back as [`Response::Unknown`] carrying the raw bytes.

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::protocol::{
    hex, response_id, status_code, RecordingScene, FRAME_TYPE_COMMAND, FRAME_TYPE_FILE_STREAM,
    HEADER_LEN,
};
use crate::domain::models::FileDescriptor;

/// Maximum entries in one file-list page.
pub const FILE_LIST_PAGE_SIZE: usize = 7;

const FILE_ENTRY_LEN: usize = 10;

/// `[2, sessionId(4), offset(4), size(2)]`
pub const FILE_STREAM_HEADER_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatusReport {
    pub state: u32,
    pub udisk: u8,
    pub privacy: u8,
    pub privacy2: u8,
    pub key_state: u8,
}

impl DeviceStatusReport {
    pub fn is_recording(&self) -> bool {
        self.state == status_code::RECORDING
    }

    pub fn is_charging(&self) -> bool {
        self.state == status_code::CHARGING
    }

    pub fn is_ota(&self) -> bool {
        self.state == status_code::OTA
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub led_status: u8,
    pub scene: RecordingScene,
    pub mode: u8,
    pub raw_data: u8,
    pub mic_gain: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageReport {
    pub total: u32,
    pub free: u32,
    /// Device-reported usage; unreliable, kept only for re-encoding
    pub reserved: u32,
    pub full: bool,
}

impl StorageReport {
    pub fn used(&self) -> u32 {
        self.total.saturating_sub(self.free)
    }

    /// Computed locally from total and free.
    pub fn usage_percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.used() as f64 / self.total as f64) * 100.0).round() as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl std::fmt::Display for SystemVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingEvent {
    Started {
        session_id: u32,
        scene: RecordingScene,
        start_time: u32,
        status: u8,
    },
    Paused {
        session_id: u32,
        status: u8,
        size: Option<u32>,
    },
    Resumed {
        session_id: u32,
        status: u8,
        size: Option<u32>,
    },
    Stopped {
        session_id: u32,
        status: u8,
        saved: bool,
        file_size: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListPage {
    pub uid: u32,
    pub total: u16,
    pub start: u16,
    pub items: Vec<FileDescriptor>,
}

/// One slice of a file pushed on the file-stream channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub session_id: u32,
    pub offset: u32,
    /// Size field from the header; `data` may be shorter if the frame was cut
    pub declared_size: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedAction {
    Get,
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiAction {
    Opened,
    Closed,
}

/// Frames received from the recorder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    DeviceStatus(DeviceStatusReport),
    Battery { charging: bool, level: u8 },
    GeneralSetting(GeneralSettings),
    Storage(StorageReport),
    Recording(RecordingEvent),
    FileList(FileListPage),
    /// Acknowledgment of a sync-file request
    SyncFile { session_id: u32, status: u8 },
    FileData(FileChunk),
    SyncFileEnd { session_id: u32, crc: u16 },
    StopSync,
    DeleteConfirm { session_id: u32 },
    Version(SystemVersion),
    Led { action: LedAction, enabled: bool },
    Wifi { action: WifiAction, status: u8 },
    Heartbeat,
    TimeSync { timestamp: u32, has_stat: u8 },
    UsbMode,
    /// Undersized, unrecognized, or otherwise undecodable frame
    Unknown(Vec<u8>),
}

fn put_header(buf: &mut Vec<u8>, id: u16) {
    buf.put_u8(FRAME_TYPE_COMMAND);
    buf.put_u16_le(id);
}

fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl Response {
    /// Decode one notification payload.
    pub fn decode(bytes: &[u8]) -> Response {
        if bytes.len() < HEADER_LEN {
            debug!("Frame too short ({} bytes): {}", bytes.len(), hex(bytes));
            return Response::Unknown(bytes.to_vec());
        }

        if bytes[0] == FRAME_TYPE_FILE_STREAM {
            return Self::decode_file_stream(bytes);
        }

        let command = u16_at(bytes, 1);
        trace!(
            "Decoding frame type={} command={} len={}: {}",
            bytes[0],
            command,
            bytes.len(),
            hex(bytes)
        );

        match Self::decode_command(command, bytes) {
            Some(response) => response,
            None => {
                debug!(
                    "Unrecognized or undersized response (command {}, {} bytes)",
                    command,
                    bytes.len()
                );
                Response::Unknown(bytes.to_vec())
            }
        }
    }

    fn decode_file_stream(bytes: &[u8]) -> Response {
        if bytes.len() < FILE_STREAM_HEADER_LEN {
            debug!("File stream frame too short: {} bytes", bytes.len());
            return Response::Unknown(bytes.to_vec());
        }
        let declared_size = u16_at(bytes, 9);
        let end = (FILE_STREAM_HEADER_LEN + declared_size as usize).min(bytes.len());
        Response::FileData(FileChunk {
            session_id: u32_at(bytes, 1),
            offset: u32_at(bytes, 5),
            declared_size,
            data: bytes[FILE_STREAM_HEADER_LEN..end].to_vec(),
        })
    }

    fn decode_command(command: u16, b: &[u8]) -> Option<Response> {
        use response_id::*;

        let len = b.len();
        let response = match command {
            DEVICE_STATUS if len >= 11 => Response::DeviceStatus(DeviceStatusReport {
                state: u32_at(b, 3),
                udisk: b[7],
                privacy: b[8],
                privacy2: b[9],
                key_state: b[10],
            }),
            TIME_SYNC if len >= 8 => Response::TimeSync {
                timestamp: u32_at(b, 3),
                has_stat: b[7],
            },
            STORAGE_VOLUME if len >= 16 => Response::Storage(StorageReport {
                total: u32_at(b, 3),
                free: u32_at(b, 7),
                reserved: u32_at(b, 11),
                full: b[15] != 0,
            }),
            GENERAL_SETTING if len >= 8 => Response::GeneralSetting(GeneralSettings {
                led_status: b[3],
                scene: RecordingScene::from(b[4]),
                mode: b[5],
                raw_data: b[6],
                mic_gain: b[7],
            }),
            BATTERY if len >= 5 => Response::Battery {
                charging: b[3] == 1,
                level: b[4],
            },
            WIFI_OPENED if len >= 4 => Response::Wifi {
                action: WifiAction::Opened,
                status: b[3],
            },
            WIFI_CLOSED if len >= 4 => Response::Wifi {
                action: WifiAction::Closed,
                status: b[3],
            },
            USB_MODE => Response::UsbMode,
            SYSTEM_VERSION if len >= 6 => Response::Version(SystemVersion {
                major: b[3],
                minor: b[4],
                patch: b[5],
            }),
            RECORD_STARTED if len >= 12 => Response::Recording(RecordingEvent::Started {
                session_id: u32_at(b, 3),
                scene: RecordingScene::from(b[7]),
                start_time: u32_at(b, 8),
                status: b.get(12).copied().unwrap_or(0),
            }),
            RECORD_PAUSED if len >= 8 => Response::Recording(RecordingEvent::Paused {
                session_id: u32_at(b, 3),
                status: b[7],
                size: (len >= 12).then(|| u32_at(b, 8)),
            }),
            RECORD_RESUMED if len >= 8 => Response::Recording(RecordingEvent::Resumed {
                session_id: u32_at(b, 3),
                status: b[7],
                size: (len >= 12).then(|| u32_at(b, 8)),
            }),
            RECORD_STOPPED if len >= 13 => Response::Recording(RecordingEvent::Stopped {
                session_id: u32_at(b, 3),
                status: b[7],
                saved: b[8] != 0,
                file_size: u32_at(b, 9),
            }),
            FILE_LIST if len >= 11 => Response::FileList(Self::decode_file_list(b)),
            SYNC_FILE if len >= 8 => Response::SyncFile {
                session_id: u32_at(b, 3),
                status: b[7],
            },
            SYNC_FILE_END if len >= 9 => Response::SyncFileEnd {
                session_id: u32_at(b, 3),
                crc: u16_at(b, 7),
            },
            STOP_SYNC => Response::StopSync,
            DELETE_CONFIRM if len >= 7 => Response::DeleteConfirm {
                session_id: u32_at(b, 3),
            },
            GET_RECORD_LED if len >= 4 => Response::Led {
                action: LedAction::Get,
                enabled: b[3] == 1,
            },
            SET_RECORD_LED if len >= 4 => Response::Led {
                action: LedAction::Set,
                enabled: b[3] == 1,
            },
            HEARTBEAT => Response::Heartbeat,
            _ => return None,
        };
        Some(response)
    }

    fn decode_file_list(b: &[u8]) -> FileListPage {
        let total = u16_at(b, 7);
        let start = u16_at(b, 9);
        let count = (total.saturating_sub(start) as usize).min(FILE_LIST_PAGE_SIZE);

        let items = b[11..]
            .chunks_exact(FILE_ENTRY_LEN)
            .take(count)
            .map(|entry| FileDescriptor {
                session_id: u32_at(entry, 0),
                file_size: u32_at(entry, 4),
                attr: u16_at(entry, 8),
            })
            .collect();

        FileListPage {
            uid: u32_at(b, 3),
            total,
            start,
            items,
        }
    }

    /// Encode as the device would send it. Used by the scripted recorder in
    /// [`super::mock`].
    pub fn encode(&self) -> Vec<u8> {
        use response_id::*;

        let mut buf = Vec::with_capacity(16);

        match self {
            Response::DeviceStatus(s) => {
                put_header(&mut buf, DEVICE_STATUS);
                buf.put_u32_le(s.state);
                buf.put_slice(&[s.udisk, s.privacy, s.privacy2, s.key_state]);
            }
            Response::Battery { charging, level } => {
                put_header(&mut buf, BATTERY);
                buf.put_u8(u8::from(*charging));
                buf.put_u8(*level);
            }
            Response::GeneralSetting(g) => {
                put_header(&mut buf, GENERAL_SETTING);
                buf.put_slice(&[g.led_status, g.scene.into(), g.mode, g.raw_data, g.mic_gain]);
            }
            Response::Storage(s) => {
                put_header(&mut buf, STORAGE_VOLUME);
                buf.put_u32_le(s.total);
                buf.put_u32_le(s.free);
                buf.put_u32_le(s.reserved);
                buf.put_u8(u8::from(s.full));
            }
            Response::Recording(event) => match event {
                RecordingEvent::Started {
                    session_id,
                    scene,
                    start_time,
                    status,
                } => {
                    put_header(&mut buf, RECORD_STARTED);
                    buf.put_u32_le(*session_id);
                    buf.put_u8((*scene).into());
                    buf.put_u32_le(*start_time);
                    buf.put_u8(*status);
                }
                RecordingEvent::Paused {
                    session_id,
                    status,
                    size,
                }
                | RecordingEvent::Resumed {
                    session_id,
                    status,
                    size,
                } => {
                    let id = if matches!(event, RecordingEvent::Paused { .. }) {
                        RECORD_PAUSED
                    } else {
                        RECORD_RESUMED
                    };
                    put_header(&mut buf, id);
                    buf.put_u32_le(*session_id);
                    buf.put_u8(*status);
                    if let Some(size) = size {
                        buf.put_u32_le(*size);
                    }
                }
                RecordingEvent::Stopped {
                    session_id,
                    status,
                    saved,
                    file_size,
                } => {
                    put_header(&mut buf, RECORD_STOPPED);
                    buf.put_u32_le(*session_id);
                    buf.put_u8(*status);
                    buf.put_u8(u8::from(*saved));
                    buf.put_u32_le(*file_size);
                }
            },
            Response::FileList(page) => {
                put_header(&mut buf, FILE_LIST);
                buf.put_u32_le(page.uid);
                buf.put_u16_le(page.total);
                buf.put_u16_le(page.start);
                for item in page.items.iter().take(FILE_LIST_PAGE_SIZE) {
                    buf.put_u32_le(item.session_id);
                    buf.put_u32_le(item.file_size);
                    buf.put_u16_le(item.attr);
                }
            }
            Response::SyncFile { session_id, status } => {
                put_header(&mut buf, SYNC_FILE);
                buf.put_u32_le(*session_id);
                buf.put_u8(*status);
            }
            Response::FileData(chunk) => {
                buf.put_u8(FRAME_TYPE_FILE_STREAM);
                buf.put_u32_le(chunk.session_id);
                buf.put_u32_le(chunk.offset);
                buf.put_u16_le(chunk.declared_size);
                buf.put_slice(&chunk.data);
            }
            Response::SyncFileEnd { session_id, crc } => {
                put_header(&mut buf, SYNC_FILE_END);
                buf.put_u32_le(*session_id);
                buf.put_u16_le(*crc);
            }
            Response::StopSync => put_header(&mut buf, STOP_SYNC),
            Response::DeleteConfirm { session_id } => {
                put_header(&mut buf, DELETE_CONFIRM);
                buf.put_u32_le(*session_id);
            }
            Response::Version(v) => {
                put_header(&mut buf, SYSTEM_VERSION);
                buf.put_slice(&[v.major, v.minor, v.patch]);
            }
            Response::Led { action, enabled } => {
                let id = match action {
                    LedAction::Get => GET_RECORD_LED,
                    LedAction::Set => SET_RECORD_LED,
                };
                put_header(&mut buf, id);
                buf.put_u8(u8::from(*enabled));
            }
            Response::Wifi { action, status } => {
                let id = match action {
                    WifiAction::Opened => WIFI_OPENED,
                    WifiAction::Closed => WIFI_CLOSED,
                };
                put_header(&mut buf, id);
                buf.put_u8(*status);
            }
            Response::Heartbeat => put_header(&mut buf, HEARTBEAT),
            Response::TimeSync {
                timestamp,
                has_stat,
            } => {
                put_header(&mut buf, TIME_SYNC);
                buf.put_u32_le(*timestamp);
                buf.put_u8(*has_stat);
            }
            Response::UsbMode => put_header(&mut buf, USB_MODE),
            Response::Unknown(raw) => buf.put_slice(raw),
        }

        buf
    }

    /// Short variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Response::DeviceStatus(_) => "deviceStatus",
            Response::Battery { .. } => "battery",
            Response::GeneralSetting(_) => "generalSetting",
            Response::Storage(_) => "storage",
            Response::Recording(_) => "recording",
            Response::FileList(_) => "fileList",
            Response::SyncFile { .. } => "syncFile",
            Response::FileData(_) => "fileData",
            Response::SyncFileEnd { .. } => "syncFileEnd",
            Response::StopSync => "stopSync",
            Response::DeleteConfirm { .. } => "deleteConfirm",
            Response::Version(_) => "version",
            Response::Led { .. } => "led",
            Response::Wifi { .. } => "wifi",
            Response::Heartbeat => "heartbeat",
            Response::TimeSync { .. } => "timeSync",
            Response::UsbMode => "usbMode",
            Response::Unknown(_) => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_status_code() {
        let frame = [1, 3, 0, 0x03, 0x10, 0x00, 0x00, 0, 0, 0, 0];
        match Response::decode(&frame) {
            Response::DeviceStatus(status) => {
                assert_eq!(status.state, 0x1003);
                assert!(status.is_recording());
                assert!(!status.is_charging());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_short_frames_are_unknown() {
        assert_eq!(Response::decode(&[1, 3]), Response::Unknown(vec![1, 3]));
        // Status needs 11 bytes
        assert!(matches!(
            Response::decode(&[1, 3, 0, 1, 2, 3]),
            Response::Unknown(_)
        ));
        // File stream header needs 11 bytes
        assert!(matches!(
            Response::decode(&[2, 1, 0, 0, 0, 0]),
            Response::Unknown(_)
        ));
        assert!(matches!(
            Response::decode(&[1, 0xFF, 0x00, 1]),
            Response::Unknown(_)
        ));
    }

    #[test]
    fn test_file_stream_ignores_command_field() {
        // Bytes 1-2 would read as command 3 but the stream marker wins
        let mut frame = vec![2, 3, 0, 0, 0, 0x10, 0, 0, 0, 3, 0];
        frame.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        match Response::decode(&frame) {
            Response::FileData(chunk) => {
                assert_eq!(chunk.session_id, 3);
                assert_eq!(chunk.offset, 0x10);
                assert_eq!(chunk.data, vec![0xAA, 0xBB, 0xCC]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_chunk_keeps_available_bytes() {
        let frame = [2, 7, 0, 0, 0, 0, 0, 0, 0, 10, 0, 1, 2];
        match Response::decode(&frame) {
            Response::FileData(chunk) => {
                assert_eq!(chunk.declared_size, 10);
                assert_eq!(chunk.data, vec![1, 2]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_file_list_caps_page_and_skips_partial_entries() {
        let page = FileListPage {
            uid: 9,
            total: 12,
            start: 0,
            items: (1..=7)
                .map(|i| FileDescriptor {
                    session_id: i,
                    file_size: i * 100,
                    attr: 0,
                })
                .collect(),
        };
        let mut frame = Response::FileList(page.clone()).encode();
        // An eighth entry is never read
        frame.extend_from_slice(&[0xEE; 10]);
        assert_eq!(Response::decode(&frame), Response::FileList(page));

        // Declared two entries, only one complete
        let mut short = vec![1, 26, 0, 0, 0, 0, 0, 2, 0, 0, 0];
        short.extend_from_slice(&[5, 0, 0, 0, 0xE8, 0x03, 0, 0, 1, 0]);
        short.extend_from_slice(&[6, 0, 0]);
        match Response::decode(&short) {
            Response::FileList(page) => {
                assert_eq!(page.items.len(), 1);
                assert_eq!(page.items[0].file_size, 1000);
                assert_eq!(page.items[0].attr, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_storage_usage_is_computed_locally() {
        let frame = Response::Storage(StorageReport {
            total: 1000,
            free: 250,
            reserved: 99,
            full: false,
        })
        .encode();
        match Response::decode(&frame) {
            Response::Storage(report) => {
                assert_eq!(report.used(), 750);
                assert_eq!(report.usage_percent(), 75);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_device_encoding_round_trips() {
        let samples = vec![
            Response::Battery {
                charging: true,
                level: 87,
            },
            Response::GeneralSetting(GeneralSettings {
                led_status: 1,
                scene: RecordingScene::Conference,
                mode: 2,
                raw_data: 0,
                mic_gain: 6,
            }),
            Response::Recording(RecordingEvent::Started {
                session_id: 77,
                scene: RecordingScene::Recording,
                start_time: 1_700_000_000,
                status: 0,
            }),
            Response::Recording(RecordingEvent::Paused {
                session_id: 77,
                status: 0,
                size: Some(4096),
            }),
            Response::Recording(RecordingEvent::Stopped {
                session_id: 77,
                status: 0,
                saved: true,
                file_size: 8192,
            }),
            Response::SyncFile {
                session_id: 42,
                status: 0,
            },
            Response::SyncFileEnd {
                session_id: 42,
                crc: 0xBEEF,
            },
            Response::DeleteConfirm { session_id: 42 },
            Response::Version(SystemVersion {
                major: 2,
                minor: 1,
                patch: 9,
            }),
            Response::Led {
                action: LedAction::Set,
                enabled: true,
            },
            Response::Wifi {
                action: WifiAction::Closed,
                status: 1,
            },
            Response::TimeSync {
                timestamp: 1_700_000_000,
                has_stat: 1,
            },
            Response::StopSync,
            Response::UsbMode,
            Response::Heartbeat,
        ];
        for response in samples {
            assert_eq!(Response::decode(&response.encode()), response);
        }
    }

    #[test]
    fn test_version_display() {
        let v = SystemVersion {
            major: 1,
            minor: 4,
            patch: 12,
        };
        assert_eq!(v.to_string(), "1.4.12");
    }
}
