//! Device Session Module
//!
//! Post-connect initialization, ad-hoc device commands and routing of
//! decoded responses into the status snapshot, the audio activity state and
//! the transfer engine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local, Offset, TimeZone};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::domain::models::{
    AudioActivity, BatteryState, DeviceInfo, DeviceStatusSnapshot, EngineEvent, MessageSeverity,
    StatusMessage, StorageState,
};
use crate::domain::settings::{HandshakeSettings, SyncSettings};
use crate::infrastructure::bluetooth::connection::ConnectionManager;
use crate::infrastructure::bluetooth::link::TransportError;
use crate::infrastructure::bluetooth::protocol::{
    device_info, hex, token_bytes, Command, RecordingScene,
};
use crate::infrastructure::bluetooth::responses::{RecordingEvent, Response, WifiAction};
use crate::infrastructure::bluetooth::transfer::FileTransferEngine;

const SECONDS_PER_DAY: i64 = 86_400;

/// Steps of the post-connect sequence that could not be sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub failed: Vec<&'static str>,
}

impl InitReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Default)]
struct SessionState {
    snapshot: DeviceStatusSnapshot,
    activity: AudioActivity,
    /// Id from the last record-started response
    recording_session: Option<u32>,
    scene: Option<RecordingScene>,
}

/// Time sync command for `now`: UTC epoch seconds and the whole-hour
/// offset of `now`'s zone, truncated toward zero.
pub fn time_sync_command<Tz: TimeZone>(now: &DateTime<Tz>) -> Command {
    let offset_secs = now.offset().fix().local_minus_utc();
    Command::TimeSync {
        epoch_seconds: now.timestamp().clamp(0, u32::MAX as i64) as u32,
        timezone_hours: (offset_secs / 3600) as i8,
    }
}

/// Text value of a Device Information characteristic, without padding.
fn device_string(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    (!text.is_empty()).then(|| text.to_string())
}

/// Epoch seconds `days` before `now_epoch`, floored at zero.
pub fn lookback_since(now_epoch: i64, days: u32) -> u32 {
    (now_epoch - days as i64 * SECONDS_PER_DAY).clamp(0, u32::MAX as i64) as u32
}

pub struct DeviceSession {
    connection: Arc<ConnectionManager>,
    handshake: HandshakeSettings,
    sync: SyncSettings,
    state: Mutex<SessionState>,
    event_sender: mpsc::UnboundedSender<EngineEvent>,
}

impl DeviceSession {
    pub fn new(
        connection: Arc<ConnectionManager>,
        handshake: HandshakeSettings,
        sync: SyncSettings,
        event_sender: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            connection,
            handshake,
            sync,
            state: Mutex::new(SessionState::default()),
            event_sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn send(&self, command: Command) -> Result<(), TransportError> {
        debug!("Sending {:?}", command);
        self.connection.write_bytes(&command.encode()).await
    }

    /// Two-phase bind. The device never acknowledges phase one, so phase two
    /// follows after a fixed delay. Failures are logged and swallowed.
    pub async fn handshake(&self) {
        let hs = &self.handshake;
        info!("Starting handshake");

        let hello = Command::HandshakeHello {
            platform_type: hs.platform_type,
            ble_version: hs.ble_version,
        };
        if let Err(e) = self.send(hello).await {
            warn!("Handshake phase one failed: {}", e);
        }

        tokio::time::sleep(hs.phase_delay()).await;

        let bind = Command::HandshakeBind {
            platform_type: hs.platform_type,
            ble_version: hs.ble_version,
            token: token_bytes(&hs.token),
            long_audio: hs.long_audio,
            device_token: hs.device_token(),
            client_name: hs.client_name.clone(),
        };
        match self.send(bind).await {
            Ok(()) => info!("Handshake sent"),
            Err(e) => warn!("Handshake phase two failed: {}", e),
        }
    }

    /// Runs the post-connect sequence strictly in order. No step aborts the
    /// sequence; failures are collected in the report.
    pub async fn initialize(&self) -> InitReport {
        self.handshake().await;

        let now = Local::now();
        let since = lookback_since(now.timestamp(), self.sync.file_list_lookback_days);
        let steps: [(&'static str, Command); 6] = [
            ("time sync", time_sync_command(&now)),
            ("device status", Command::DeviceStatus),
            (
                "general settings",
                Command::GeneralSetting {
                    param: self.sync.general_setting_param,
                },
            ),
            ("battery", Command::Battery),
            (
                "usb mode",
                Command::SetUsbMode {
                    mode: self.sync.usb_mode,
                },
            ),
            ("file list", Command::LoadRecordings { since }),
        ];

        let mut report = InitReport::default();
        for (name, command) in steps {
            if let Err(e) = self.send(command).await {
                warn!("Initialization step '{}' failed: {}", name, e);
                report.failed.push(name);
            }
        }

        if report.is_complete() {
            info!("Device initialized");
            self.send_log("Device initialized", MessageSeverity::Success);
        } else {
            self.send_log(
                &format!("Device partially initialized ({} steps failed)", report.failed.len()),
                MessageSeverity::Warning,
            );
        }
        report
    }

    /// Reads the Device Information service into the snapshot. Recorders
    /// without the service simply leave the fields empty.
    pub async fn read_device_info(&self) -> DeviceInfo {
        let mut info = DeviceInfo::default();
        let fields: [(&str, &mut Option<String>); 4] = [
            (device_info::MANUFACTURER_NAME, &mut info.manufacturer),
            (device_info::MODEL_NUMBER, &mut info.model),
            (device_info::SERIAL_NUMBER, &mut info.serial_number),
            (device_info::FIRMWARE_REVISION, &mut info.firmware_revision),
        ];
        for (characteristic, field) in fields {
            match self
                .connection
                .read_characteristic(device_info::SERVICE, characteristic)
                .await
            {
                Ok(bytes) => *field = device_string(&bytes),
                Err(TransportError::Discovery(_)) => {
                    debug!("Device information {} not exposed", characteristic)
                }
                Err(e) => warn!("Failed to read device information {}: {}", characteristic, e),
            }
        }

        if let Some(serial) = &info.serial_number {
            info!(
                "Recorder serial {} firmware {}",
                serial,
                info.firmware_revision.as_deref().unwrap_or("unknown")
            );
        }
        let mut state = self.lock();
        state.snapshot.device_info = info.clone();
        self.emit(EngineEvent::StatusUpdated(state.snapshot.clone()));
        info
    }

    pub async fn sync_time(&self) -> Result<(), TransportError> {
        self.send(time_sync_command(&Local::now())).await
    }

    /// The new recording is named by the current epoch second.
    pub async fn start_record(&self, scene: RecordingScene) -> Result<(), TransportError> {
        self.lock().scene = Some(scene);
        let session_id = Local::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        self.send(Command::StartRecord {
            record_type: self.sync.record_type,
            scene,
            session_id,
        })
        .await
    }

    pub async fn pause_record(&self) -> Result<(), TransportError> {
        let session_id = self.current_recording("pause");
        self.send(Command::PauseRecord { session_id }).await
    }

    pub async fn resume_record(&self) -> Result<(), TransportError> {
        let session_id = self.current_recording("resume");
        let scene = self.lock().scene.unwrap_or(RecordingScene::Recording);
        self.send(Command::ResumeRecord { session_id, scene }).await
    }

    pub async fn stop_record(&self) -> Result<(), TransportError> {
        self.send(Command::StopRecord).await
    }

    fn current_recording(&self, action: &str) -> u32 {
        match self.lock().recording_session {
            Some(id) => id,
            None => {
                warn!("No recording session known, sending {} for session 0", action);
                0
            }
        }
    }

    pub async fn get_device_status(&self) -> Result<(), TransportError> {
        self.send(Command::DeviceStatus).await
    }

    pub async fn get_battery_level(&self) -> Result<(), TransportError> {
        self.send(Command::Battery).await
    }

    pub async fn get_general_setting(&self) -> Result<(), TransportError> {
        self.send(Command::GeneralSetting {
            param: self.sync.general_setting_param,
        })
        .await
    }

    pub async fn get_storage_volume(&self) -> Result<(), TransportError> {
        self.send(Command::StorageVolume).await
    }

    pub async fn get_system_version(&self) -> Result<(), TransportError> {
        self.send(Command::SystemVersion).await
    }

    pub async fn set_usb_mode(&self, mode: u8) -> Result<(), TransportError> {
        self.send(Command::SetUsbMode { mode }).await
    }

    pub async fn open_wifi(&self) -> Result<(), TransportError> {
        self.send(Command::OpenWifi).await
    }

    pub async fn close_wifi(&self) -> Result<(), TransportError> {
        self.send(Command::CloseWifi).await
    }

    pub async fn configure_wifi(&self, ssid: &str, password: &str) -> Result<(), TransportError> {
        self.send(Command::ConfigureWifi {
            ssid: ssid.to_string(),
            password: password.to_string(),
            test_server: 0,
        })
        .await
    }

    pub async fn search_wifi(&self) -> Result<(), TransportError> {
        self.send(Command::SearchWifi).await
    }

    pub async fn get_record_led(&self) -> Result<(), TransportError> {
        self.send(Command::GetRecordLed).await
    }

    pub async fn set_record_led(&self, enabled: bool) -> Result<(), TransportError> {
        self.send(Command::SetRecordLed { enabled }).await
    }

    pub async fn list_files(
        &self,
        uid: u32,
        session_id: u32,
        only_one: bool,
    ) -> Result<(), TransportError> {
        self.send(Command::ListFiles {
            uid,
            session_id,
            only_one,
        })
        .await
    }

    pub async fn delete_recording(&self, session_id: u32) -> Result<(), TransportError> {
        self.send(Command::DeleteRecord { session_id }).await
    }

    pub async fn heartbeat(&self) -> Result<(), TransportError> {
        self.send(Command::Heartbeat).await
    }

    pub async fn unbind(&self, clean_type: u8) -> Result<(), TransportError> {
        self.send(Command::Unbind { clean_type }).await
    }

    pub async fn reset_password(&self) -> Result<(), TransportError> {
        self.send(Command::ResetPassword).await
    }

    pub async fn clear_data(&self) -> Result<(), TransportError> {
        self.send(Command::ClearData).await
    }

    pub fn snapshot(&self) -> DeviceStatusSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn audio_activity(&self) -> AudioActivity {
        self.lock().activity
    }

    pub fn recording_session(&self) -> Option<u32> {
        self.lock().recording_session
    }

    /// Route one decoded response.
    pub fn dispatch(&self, response: Response, transfer: &FileTransferEngine) {
        match response {
            Response::DeviceStatus(report) => {
                let mut state = self.lock();
                state.snapshot.is_recording = report.is_recording();
                state.snapshot.is_charging = report.is_charging();
                state.snapshot.is_ota = report.is_ota();
                let activity = if report.is_recording() {
                    AudioActivity::Recording
                } else {
                    AudioActivity::Ready
                };
                debug!("Device status {:#06x}", report.state);
                self.emit(EngineEvent::StatusUpdated(state.snapshot.clone()));
                self.set_activity(&mut state, activity);
            }
            Response::Battery { charging, level } => {
                let mut state = self.lock();
                state.snapshot.battery = Some(BatteryState { level, charging });
                debug!("Battery {}% (charging: {})", level, charging);
                self.emit(EngineEvent::StatusUpdated(state.snapshot.clone()));
            }
            Response::GeneralSetting(settings) => {
                let mut state = self.lock();
                state.snapshot.general_settings = Some(settings);
                state.scene = Some(settings.scene);
                self.emit(EngineEvent::StatusUpdated(state.snapshot.clone()));
            }
            Response::Storage(report) => {
                let storage = StorageState {
                    total_bytes: report.total,
                    free_bytes: report.free,
                    used_bytes: report.used(),
                    usage_percent: report.usage_percent(),
                    is_full: report.full,
                };
                let mut state = self.lock();
                state.snapshot.storage = Some(storage);
                self.emit(EngineEvent::StatusUpdated(state.snapshot.clone()));
                drop(state);
                if storage.is_full {
                    self.send_log("Recorder storage is full", MessageSeverity::Warning);
                }
            }
            Response::Version(version) => {
                let mut state = self.lock();
                info!("Recorder firmware {}", version);
                state.snapshot.system_version = Some(version.to_string());
                self.emit(EngineEvent::StatusUpdated(state.snapshot.clone()));
            }
            Response::Led { enabled, .. } => {
                let mut state = self.lock();
                state.snapshot.led_enabled = Some(enabled);
                self.emit(EngineEvent::StatusUpdated(state.snapshot.clone()));
            }
            Response::Recording(event) => self.handle_recording(event),
            Response::FileList(page) => transfer.handle_file_list(page),
            Response::SyncFile { session_id, status } => {
                transfer.handle_sync_ack(session_id, status)
            }
            Response::FileData(chunk) => transfer.handle_chunk(chunk),
            Response::SyncFileEnd { session_id, crc } => transfer.handle_sync_end(session_id, crc),
            Response::StopSync => transfer.handle_stop_sync(),
            Response::DeleteConfirm { session_id } => transfer.handle_delete_confirm(session_id),
            Response::Wifi { action, status } => {
                let what = match action {
                    WifiAction::Opened => "opened",
                    WifiAction::Closed => "closed",
                };
                info!("Wifi {} (status {})", what, status);
                let severity = if status == 0 {
                    MessageSeverity::Info
                } else {
                    MessageSeverity::Warning
                };
                self.send_log(&format!("Wifi {} (status {})", what, status), severity);
            }
            Response::TimeSync {
                timestamp,
                has_stat,
            } => debug!("Time sync acknowledged: {} (stat {})", timestamp, has_stat),
            Response::UsbMode => debug!("USB mode acknowledged"),
            Response::Heartbeat => trace!("Heartbeat"),
            Response::Unknown(bytes) => debug!("Ignoring unknown frame {}", hex(&bytes)),
        }
    }

    fn handle_recording(&self, event: RecordingEvent) {
        let mut state = self.lock();
        match event {
            RecordingEvent::Started {
                session_id,
                scene,
                status,
                ..
            } => {
                info!("Recording {} started", session_id);
                if status != 0 {
                    warn!("Record start reported status {}", status);
                }
                state.recording_session = Some(session_id);
                state.scene = Some(scene);
                state.snapshot.is_recording = true;
                self.set_activity(&mut state, AudioActivity::Recording);
            }
            RecordingEvent::Paused { session_id, .. } => {
                info!("Recording {} paused", session_id);
                self.set_activity(&mut state, AudioActivity::Paused);
            }
            RecordingEvent::Resumed { session_id, .. } => {
                info!("Recording {} resumed", session_id);
                self.set_activity(&mut state, AudioActivity::Recording);
            }
            RecordingEvent::Stopped {
                session_id,
                saved,
                file_size,
                ..
            } => {
                info!(
                    "Recording {} stopped (saved: {}, {} bytes)",
                    session_id, saved, file_size
                );
                state.recording_session = None;
                state.snapshot.is_recording = false;
                self.set_activity(&mut state, AudioActivity::Ready);
                drop(state);
                let (message, severity) = if saved {
                    ("Recording saved", MessageSeverity::Success)
                } else {
                    ("Recording stopped without saving", MessageSeverity::Warning)
                };
                self.send_log(message, severity);
            }
        }
    }

    fn set_activity(&self, state: &mut SessionState, activity: AudioActivity) {
        if state.activity != activity {
            debug!("Audio activity {:?} -> {:?}", state.activity, activity);
            state.activity = activity;
            self.emit(EngineEvent::AudioActivity(activity));
        }
    }

    /// Forget everything learned from the device.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.snapshot = DeviceStatusSnapshot::default();
        state.recording_session = None;
        state.scene = None;
        self.set_activity(&mut state, AudioActivity::Idle);
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_sender.send(event);
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.emit(EngineEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
