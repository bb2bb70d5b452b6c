//! In-process link and picker backends.
//!
//! [`MockLink`] records every write and answers through a responder closure;
//! [`ScriptedRecorder`] is a responder that behaves like a small recorder
//! with a few files on it. The demo binary uses these on hosts without a
//! native backend.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::link::{
    DeviceFilter, DevicePicker, Link, LinkConnection, LinkEvent, LinkSession, PickedDevice,
    PickerError, TransportError,
};
use super::protocol::{command_id, hex, RecordingScene, FRAME_TYPE_COMMAND, HEADER_LEN};
use super::responses::{
    DeviceStatusReport, FileChunk, FileListPage, GeneralSettings, LedAction, RecordingEvent,
    Response, StorageReport, SystemVersion, WifiAction, FILE_LIST_PAGE_SIZE,
};
use crate::domain::models::{DeviceHandle, FileDescriptor};

pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct MockState {
    writes: Mutex<Vec<Vec<u8>>>,
    responder: Mutex<Option<Responder>>,
    fail_connect: Mutex<Option<TransportError>>,
    fail_writes: AtomicBool,
    characteristics: Mutex<HashMap<(String, String), Vec<u8>>>,
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MockState {
    fn sender(&self) -> Option<mpsc::UnboundedSender<LinkEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_sender(&self) -> Option<mpsc::UnboundedSender<LinkEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Scriptable [`Link`]. Clones share state, so a test can keep one and hand
/// the other to the engine.
#[derive(Clone, Default)]
pub struct MockLink {
    state: Arc<MockState>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        let link = Self::new();
        link.set_responder(responder);
        link
    }

    pub fn with_recorder(recorder: ScriptedRecorder) -> Self {
        Self::with_responder(move |frame| recorder.respond(frame))
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        *self
            .state
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(responder));
    }

    pub fn fail_next_connect(&self, error: TransportError) {
        *self
            .state
            .fail_connect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every frame written so far, oldest first.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Command ids of the control frames written so far.
    pub fn written_commands(&self) -> Vec<u16> {
        self.writes()
            .iter()
            .filter(|w| w.len() >= HEADER_LEN && w[0] == FRAME_TYPE_COMMAND)
            .map(|w| u16::from_le_bytes([w[1], w[2]]))
            .collect()
    }

    /// Serve `value` for reads of `characteristic` on `service`.
    pub fn set_characteristic(&self, service: &str, characteristic: &str, value: &[u8]) {
        self.state
            .characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (service.to_lowercase(), characteristic.to_lowercase()),
                value.to_vec(),
            );
    }

    pub fn clear_writes(&self) {
        self.state
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Push a notification as if the device sent it. Returns false when no
    /// link is open.
    pub fn notify(&self, bytes: Vec<u8>) -> bool {
        match self.state.sender() {
            Some(tx) => tx.send(LinkEvent::Notification(bytes)).is_ok(),
            None => false,
        }
    }

    /// Simulate the radio link going away.
    pub fn drop_link(&self) {
        if let Some(tx) = self.state.take_sender() {
            let _ = tx.send(LinkEvent::Lost);
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.sender().is_some()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for MockLink {
    async fn connect(&self, device: &DeviceHandle) -> Result<LinkConnection, TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let failure = self
            .state
            .fail_connect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(error) = failure {
            debug!("Mock connect to {} failing: {}", device.id, error);
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .state
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);

        debug!("Mock link open to {}", device.id);
        Ok(LinkConnection {
            session: Arc::new(MockSession {
                state: self.state.clone(),
            }),
            events: rx,
        })
    }
}

struct MockSession {
    state: Arc<MockState>,
}

#[async_trait]
impl LinkSession for MockSession {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let Some(tx) = self.state.sender() else {
            return Err(TransportError::Closed);
        };
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Write("mock write failure".to_string()));
        }

        self.state
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes.to_vec());

        let responder = self
            .state
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(responder) = responder {
            for reply in responder(bytes) {
                let _ = tx.send(LinkEvent::Notification(reply));
            }
        }
        Ok(())
    }

    async fn read(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<Vec<u8>, TransportError> {
        if self.state.sender().is_none() {
            return Err(TransportError::Closed);
        }
        self.state
            .characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(service.to_lowercase(), characteristic.to_lowercase()))
            .cloned()
            .ok_or_else(|| TransportError::Discovery(format!("{}/{}", service, characteristic)))
    }

    async fn disconnect(&self) {
        if self.state.take_sender().is_some() {
            self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }
}

enum PickerOutcome {
    Device(PickedDevice),
    Error(PickerError),
    Pending,
}

/// [`DevicePicker`] returning queued outcomes, then repeating the last one.
pub struct MockPicker {
    outcomes: Mutex<VecDeque<PickerOutcome>>,
    calls: AtomicUsize,
}

impl MockPicker {
    fn with(outcome: PickerOutcome) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::from([outcome])),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn returning(device: PickedDevice) -> Self {
        Self::with(PickerOutcome::Device(device))
    }

    pub fn failing(error: PickerError) -> Self {
        Self::with(PickerOutcome::Error(error))
    }

    /// Never resolves, like a picker the user leaves open.
    pub fn pending() -> Self {
        Self::with(PickerOutcome::Pending)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DevicePicker for MockPicker {
    async fn request_device(&self, _filter: &DeviceFilter) -> Result<PickedDevice, PickerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let next = {
            let mut outcomes = self
                .outcomes
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if outcomes.len() > 1 {
                outcomes.pop_front()
            } else {
                outcomes.front().map(|o| match o {
                    PickerOutcome::Device(d) => PickerOutcome::Device(d.clone()),
                    PickerOutcome::Error(e) => PickerOutcome::Error(e.clone()),
                    PickerOutcome::Pending => PickerOutcome::Pending,
                })
            }
        };

        match next {
            Some(PickerOutcome::Device(device)) => Ok(device),
            Some(PickerOutcome::Error(error)) => Err(error),
            Some(PickerOutcome::Pending) => std::future::pending::<Result<PickedDevice, PickerError>>().await,
            None => Err(PickerError::NotFound),
        }
    }
}

/// Payload bytes per file-stream frame sent by [`ScriptedRecorder`].
pub const SCRIPTED_CHUNK_LEN: usize = 180;

/// Deterministic content of a scripted recording.
pub fn scripted_file_contents(session_id: u32, size: u32) -> Vec<u8> {
    (0..size as usize)
        .map(|i| (session_id as usize).wrapping_add(i.wrapping_mul(31)) as u8)
        .collect()
}

struct RecorderState {
    files: Vec<FileDescriptor>,
    recording: Option<u32>,
    paused: bool,
    next_session_id: u32,
    led_enabled: bool,
    battery_level: u8,
}

/// A responder imitating a recorder: reports status, records, lists and
/// streams files.
pub struct ScriptedRecorder {
    state: Mutex<RecorderState>,
}

impl Default for ScriptedRecorder {
    fn default() -> Self {
        Self::with_files(vec![
            FileDescriptor {
                session_id: 1_700_000_001,
                file_size: 2_048,
                attr: 0,
            },
            FileDescriptor {
                session_id: 1_700_000_002,
                file_size: 700,
                attr: 1,
            },
        ])
    }
}

impl ScriptedRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files(files: Vec<FileDescriptor>) -> Self {
        Self {
            state: Mutex::new(RecorderState {
                files,
                recording: None,
                paused: false,
                next_session_id: 1_700_000_100,
                led_enabled: true,
                battery_level: 87,
            }),
        }
    }

    /// Replies to one frame written by the client.
    pub fn respond(&self, frame: &[u8]) -> Vec<Vec<u8>> {
        if frame.len() < HEADER_LEN || frame[0] != FRAME_TYPE_COMMAND {
            return Vec::new();
        }
        let id = u16::from_le_bytes([frame[1], frame[2]]);
        let payload = &frame[HEADER_LEN..];
        let u32_at = |at: usize| -> u32 {
            payload
                .get(at..at + 4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0)
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let replies: Vec<Response> = match id {
            command_id::DEVICE_STATUS => {
                let code = match (state.recording, state.paused) {
                    (Some(_), false) => super::protocol::status_code::RECORDING,
                    _ => 0,
                };
                vec![Response::DeviceStatus(DeviceStatusReport {
                    state: code,
                    udisk: 0,
                    privacy: 0,
                    privacy2: 0,
                    key_state: 0,
                })]
            }
            command_id::TIME_SYNC => vec![Response::TimeSync {
                timestamp: u32_at(0),
                has_stat: 1,
            }],
            command_id::STORAGE_VOLUME => {
                let used: u32 = state.files.iter().map(|f| f.file_size).sum();
                let total = 1_000_000_000u32;
                vec![Response::Storage(StorageReport {
                    total,
                    free: total.saturating_sub(used),
                    reserved: 0,
                    full: false,
                })]
            }
            command_id::GENERAL_SETTING => vec![Response::GeneralSetting(GeneralSettings {
                led_status: u8::from(state.led_enabled),
                scene: RecordingScene::Recording,
                mode: 0,
                raw_data: 0,
                mic_gain: 4,
            })],
            command_id::BATTERY => vec![Response::Battery {
                charging: false,
                level: state.battery_level,
            }],
            command_id::USB_MODE => vec![Response::UsbMode],
            command_id::SYSTEM_VERSION => vec![Response::Version(SystemVersion {
                major: 1,
                minor: 4,
                patch: 2,
            })],
            command_id::OPEN_WIFI => vec![Response::Wifi {
                action: WifiAction::Opened,
                status: 0,
            }],
            command_id::CLOSE_WIFI => vec![Response::Wifi {
                action: WifiAction::Closed,
                status: 0,
            }],
            command_id::RECORD_START => {
                let session_id = match u32_at(2) {
                    0 => {
                        state.next_session_id += 1;
                        state.next_session_id - 1
                    }
                    requested => requested,
                };
                state.recording = Some(session_id);
                state.paused = false;
                vec![Response::Recording(RecordingEvent::Started {
                    session_id,
                    scene: RecordingScene::from(payload.get(1).copied().unwrap_or(1)),
                    start_time: session_id,
                    status: 0,
                })]
            }
            command_id::RECORD_PAUSE => {
                state.paused = true;
                vec![Response::Recording(RecordingEvent::Paused {
                    session_id: u32_at(0),
                    status: 0,
                    size: None,
                })]
            }
            command_id::RECORD_RESUME => {
                state.paused = false;
                vec![Response::Recording(RecordingEvent::Resumed {
                    session_id: u32_at(0),
                    status: 0,
                    size: None,
                })]
            }
            command_id::RECORD_STOP => match state.recording.take() {
                Some(session_id) => {
                    state.paused = false;
                    let file_size = 4_096;
                    state.files.push(FileDescriptor {
                        session_id,
                        file_size,
                        attr: 0,
                    });
                    vec![Response::Recording(RecordingEvent::Stopped {
                        session_id,
                        status: 0,
                        saved: true,
                        file_size,
                    })]
                }
                None => Vec::new(),
            },
            command_id::FILE_LIST => {
                let total = state.files.len() as u16;
                let pages: Vec<Response> = state
                    .files
                    .chunks(FILE_LIST_PAGE_SIZE)
                    .enumerate()
                    .map(|(i, items)| {
                        Response::FileList(FileListPage {
                            uid: u32_at(0),
                            total,
                            start: (i * FILE_LIST_PAGE_SIZE) as u16,
                            items: items.to_vec(),
                        })
                    })
                    .collect();
                if pages.is_empty() {
                    vec![Response::FileList(FileListPage {
                        uid: u32_at(0),
                        total: 0,
                        start: 0,
                        items: Vec::new(),
                    })]
                } else {
                    pages
                }
            }
            command_id::SYNC_FILE => {
                let session_id = u32_at(0);
                match state.files.iter().find(|f| f.session_id == session_id) {
                    Some(file) => {
                        let start = u32_at(4).min(file.file_size);
                        let end = match u32_at(8) {
                            0 => file.file_size,
                            end => end.min(file.file_size),
                        };
                        let contents = scripted_file_contents(session_id, file.file_size);
                        let mut replies = vec![Response::SyncFile {
                            session_id,
                            status: 0,
                        }];
                        let range = &contents[start as usize..end.max(start) as usize];
                        for (i, chunk) in range.chunks(SCRIPTED_CHUNK_LEN).enumerate() {
                            replies.push(Response::FileData(FileChunk {
                                session_id,
                                offset: start + (i * SCRIPTED_CHUNK_LEN) as u32,
                                declared_size: chunk.len() as u16,
                                data: chunk.to_vec(),
                            }));
                        }
                        replies.push(Response::SyncFileEnd { session_id, crc: 0 });
                        replies
                    }
                    None => vec![Response::SyncFile {
                        session_id,
                        status: 1,
                    }],
                }
            }
            command_id::SYNC_FILE_STOP => vec![Response::StopSync],
            command_id::DELETE_RECORD => {
                let session_id = u32_at(0);
                state.files.retain(|f| f.session_id != session_id);
                vec![Response::DeleteConfirm { session_id }]
            }
            command_id::GET_RECORD_LED => vec![Response::Led {
                action: LedAction::Get,
                enabled: state.led_enabled,
            }],
            command_id::SET_RECORD_LED => {
                state.led_enabled = payload.first().copied().unwrap_or(0) == 1;
                vec![Response::Led {
                    action: LedAction::Set,
                    enabled: state.led_enabled,
                }]
            }
            command_id::HEARTBEAT => vec![Response::Heartbeat],
            _ => {
                debug!("Scripted recorder ignoring frame {}", hex(frame));
                Vec::new()
            }
        };

        replies.iter().map(Response::encode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::Command;

    fn decode_all(frames: Vec<Vec<u8>>) -> Vec<Response> {
        frames.iter().map(|f| Response::decode(f)).collect()
    }

    #[tokio::test]
    async fn writes_are_recorded_and_answered() {
        let link = MockLink::with_responder(|frame| vec![frame.to_vec()]);
        let mut conn = link.connect(&DeviceHandle::new("dev")).await.unwrap();

        conn.session.write(&[1, 3, 0]).await.unwrap();
        assert_eq!(link.writes(), vec![vec![1, 3, 0]]);
        assert_eq!(link.written_commands(), vec![3]);
        assert_eq!(
            conn.events.recv().await,
            Some(LinkEvent::Notification(vec![1, 3, 0]))
        );
    }

    #[tokio::test]
    async fn write_after_disconnect_is_refused() {
        let link = MockLink::new();
        let conn = link.connect(&DeviceHandle::new("dev")).await.unwrap();
        conn.session.disconnect().await;
        conn.session.disconnect().await;

        assert_eq!(link.disconnect_count(), 1);
        assert_eq!(conn.session.write(&[1]).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn reads_serve_configured_values() {
        let link = MockLink::new();
        link.set_characteristic("0000180A-0000-1000-8000-00805F9B34FB", "2a25", b"SN-1");
        let conn = link.connect(&DeviceHandle::new("dev")).await.unwrap();

        assert_eq!(
            conn.session
                .read("0000180a-0000-1000-8000-00805f9b34fb", "2A25")
                .await,
            Ok(b"SN-1".to_vec())
        );
        assert!(matches!(
            conn.session.read("180a", "2a26").await,
            Err(TransportError::Discovery(_))
        ));

        conn.session.disconnect().await;
        assert_eq!(
            conn.session.read("180a", "2a25").await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn dropped_link_reports_lost_then_closes() {
        let link = MockLink::new();
        let mut conn = link.connect(&DeviceHandle::new("dev")).await.unwrap();
        link.drop_link();

        assert_eq!(conn.events.recv().await, Some(LinkEvent::Lost));
        assert_eq!(conn.events.recv().await, None);
        assert!(!link.is_open());
    }

    #[tokio::test]
    async fn pending_picker_never_resolves() {
        let picker = MockPicker::pending();
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            picker.request_device(&DeviceFilter::default()),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(picker.call_count(), 1);
    }

    #[test]
    fn recorder_streams_requested_range() {
        let recorder = ScriptedRecorder::with_files(vec![FileDescriptor {
            session_id: 9,
            file_size: 400,
            attr: 0,
        }]);
        let frames = recorder.respond(
            &Command::SyncFile {
                session_id: 9,
                start: 0,
                end: 400,
                no_header: false,
            }
            .encode(),
        );
        let responses = decode_all(frames);

        assert_eq!(
            responses.first(),
            Some(&Response::SyncFile {
                session_id: 9,
                status: 0
            })
        );
        assert_eq!(
            responses.last(),
            Some(&Response::SyncFileEnd {
                session_id: 9,
                crc: 0
            })
        );

        let mut rebuilt = Vec::new();
        for response in &responses {
            if let Response::FileData(chunk) = response {
                assert_eq!(chunk.offset as usize, rebuilt.len());
                rebuilt.extend_from_slice(&chunk.data);
            }
        }
        assert_eq!(rebuilt, scripted_file_contents(9, 400));
    }

    #[test]
    fn recorder_tracks_recording_lifecycle() {
        let recorder = ScriptedRecorder::with_files(Vec::new());
        let started = decode_all(recorder.respond(
            &Command::StartRecord {
                record_type: 1,
                scene: RecordingScene::Conference,
                session_id: 1_700_000_500,
            }
            .encode(),
        ));
        let Some(Response::Recording(RecordingEvent::Started { session_id, scene, .. })) =
            started.first().cloned()
        else {
            panic!("expected record started, got {:?}", started);
        };
        assert_eq!(session_id, 1_700_000_500);
        assert_eq!(scene, RecordingScene::Conference);

        let status = decode_all(recorder.respond(&Command::DeviceStatus.encode()));
        assert!(matches!(
            status.first(),
            Some(Response::DeviceStatus(s)) if s.is_recording()
        ));

        let stopped = decode_all(recorder.respond(&Command::StopRecord.encode()));
        assert!(matches!(
            stopped.first(),
            Some(Response::Recording(RecordingEvent::Stopped { session_id: id, saved: true, .. })) if *id == session_id
        ));

        let listed = decode_all(recorder.respond(
            &Command::ListFiles {
                uid: 0,
                session_id: 0,
                only_one: false,
            }
            .encode(),
        ));
        assert!(matches!(
            listed.first(),
            Some(Response::FileList(page)) if page.items.len() == 1 && page.items[0].session_id == session_id
        ));
    }
}
