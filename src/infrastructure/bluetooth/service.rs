//! Recorder Service Module
//!
//! Main service that coordinates scanning, connection, the device session
//! and file transfers. Every command resolves once it is written; what the
//! device answers arrives as [`EngineEvent`]s.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::models::{
    AudioActivity, ConnectionStatus, DeviceHandle, DeviceStatusSnapshot, DiscoveredDevice,
    EngineEvent, FileDescriptor, MessageSeverity, StatusMessage,
};
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::{
    connection::{ConnectionEvent, ConnectionManager, DisconnectReason},
    link::{DeviceFilter, DevicePicker, Link, PickerError, TransportError},
    protocol::{Command, RecordingScene},
    responses::Response,
    scanner::Scanner,
    session::{DeviceSession, InitReport},
    transfer::FileTransferEngine,
};

pub struct RecorderService {
    connection: Arc<ConnectionManager>,
    session: Arc<DeviceSession>,
    transfer: Arc<FileTransferEngine>,
    scanner: Scanner,
    settings: Arc<Mutex<SettingsService>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    event_sender: mpsc::UnboundedSender<EngineEvent>,
}

impl RecorderService {
    pub fn new(
        link: Arc<dyn Link>,
        picker: Arc<dyn DevicePicker>,
        settings: Arc<Mutex<SettingsService>>,
        event_sender: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let (ble, scanner_settings, handshake, sync) = {
            let settings = settings.lock().unwrap_or_else(PoisonError::into_inner);
            let s = settings.get();
            (
                s.ble.clone(),
                s.scanner.clone(),
                s.handshake.clone(),
                s.sync.clone(),
            )
        };

        let filter = DeviceFilter {
            name_prefix: Some(ble.device_name_prefix).filter(|p| !p.is_empty()),
            services: vec![ble.service_uuid],
        };

        let connection = Arc::new(ConnectionManager::new(link));
        Self {
            session: Arc::new(DeviceSession::new(
                connection.clone(),
                handshake,
                sync,
                event_sender.clone(),
            )),
            transfer: Arc::new(FileTransferEngine::new(event_sender.clone())),
            scanner: Scanner::new(picker, scanner_settings, filter, event_sender.clone()),
            connection,
            settings,
            dispatcher: Mutex::new(None),
            event_sender,
        }
    }

    /// Ask the picker for a recorder. `Ok(None)` when nothing was picked.
    pub async fn start_scan(&self) -> Result<Option<DiscoveredDevice>, PickerError> {
        self.scanner.start_scan().await
    }

    pub fn stop_scan(&self) -> bool {
        self.scanner.stop_scan()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.scanner.devices()
    }

    pub fn clear_devices(&self) {
        self.scanner.clear()
    }

    /// Connect, run the post-connect sequence and read the Device
    /// Information service. Only the link itself can fail this;
    /// initialization problems are reported, not propagated.
    pub async fn connect(&self, device: &DeviceHandle) -> Result<InitReport, TransportError> {
        self.scanner.stop_scan();

        let events = self.connection.subscribe();
        let dispatcher = tokio::spawn(Self::dispatch_events(
            events,
            self.session.clone(),
            self.transfer.clone(),
            EventSink(self.event_sender.clone()),
        ));
        // A previous dispatcher ends on its own once its subscription is replaced
        *self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);

        self.connection.connect(device).await?;

        if let Err(e) = self
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remember_device(&device.id)
        {
            warn!("Failed to save device {}: {}", device.id, e);
        }

        let report = self.session.initialize().await;
        if !report.is_complete() {
            warn!("Initialization incomplete: {:?}", report.failed);
        }
        self.session.read_device_info().await;
        Ok(report)
    }

    /// Consume connection events until the manager drops the subscription.
    async fn dispatch_events(
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        session: Arc<DeviceSession>,
        transfer: Arc<FileTransferEngine>,
        sink: EventSink,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::StatusChanged(status) => {
                    sink.emit(EngineEvent::ConnectionStatus(status));
                }
                ConnectionEvent::Notification(bytes) => {
                    session.dispatch(Response::decode(&bytes), &transfer);
                }
                ConnectionEvent::Disconnected { reason } => {
                    transfer.reset();
                    session.reset();
                    sink.emit(EngineEvent::ConnectionStatus(ConnectionStatus::Disconnected));
                    match reason {
                        DisconnectReason::Requested => {
                            sink.log("Disconnected from device", MessageSeverity::Info)
                        }
                        DisconnectReason::LinkLost => {
                            sink.log("Connection lost", MessageSeverity::Warning)
                        }
                    }
                }
            }
        }
        debug!("Connection event dispatcher finished");
    }

    /// Disconnect and wait until the resulting events have been handled.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        self.connection.unsubscribe();

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                warn!("Event dispatcher ended abnormally: {}", e);
            }
        }
        info!("Recorder service disconnected");
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn write_raw(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.connection.write_bytes(bytes).await
    }

    /// Starts recording in the scene last reported by the device.
    pub async fn start_record(&self) -> Result<(), TransportError> {
        let scene = self
            .session
            .snapshot()
            .general_settings
            .map(|g| g.scene)
            .unwrap_or(RecordingScene::Recording);
        self.session.start_record(scene).await
    }

    pub async fn start_record_in(&self, scene: RecordingScene) -> Result<(), TransportError> {
        self.session.start_record(scene).await
    }

    pub async fn pause_record(&self) -> Result<(), TransportError> {
        self.session.pause_record().await
    }

    pub async fn resume_record(&self) -> Result<(), TransportError> {
        self.session.resume_record().await
    }

    pub async fn stop_record(&self) -> Result<(), TransportError> {
        self.session.stop_record().await
    }

    pub async fn get_device_status(&self) -> Result<(), TransportError> {
        self.session.get_device_status().await
    }

    pub async fn get_battery_level(&self) -> Result<(), TransportError> {
        self.session.get_battery_level().await
    }

    pub async fn get_general_setting(&self) -> Result<(), TransportError> {
        self.session.get_general_setting().await
    }

    pub async fn get_storage_volume(&self) -> Result<(), TransportError> {
        self.session.get_storage_volume().await
    }

    pub async fn get_system_version(&self) -> Result<(), TransportError> {
        self.session.get_system_version().await
    }

    pub async fn set_usb_mode(&self, mode: u8) -> Result<(), TransportError> {
        self.session.set_usb_mode(mode).await
    }

    pub async fn sync_time(&self) -> Result<(), TransportError> {
        self.session.sync_time().await
    }

    pub async fn open_wifi(&self) -> Result<(), TransportError> {
        self.session.open_wifi().await
    }

    pub async fn close_wifi(&self) -> Result<(), TransportError> {
        self.session.close_wifi().await
    }

    pub async fn configure_wifi(&self, ssid: &str, password: &str) -> Result<(), TransportError> {
        self.session.configure_wifi(ssid, password).await
    }

    pub async fn search_wifi(&self) -> Result<(), TransportError> {
        self.session.search_wifi().await
    }

    pub async fn get_record_led(&self) -> Result<(), TransportError> {
        self.session.get_record_led().await
    }

    pub async fn set_record_led(&self, enabled: bool) -> Result<(), TransportError> {
        self.session.set_record_led(enabled).await
    }

    pub async fn heartbeat(&self) -> Result<(), TransportError> {
        self.session.heartbeat().await
    }

    pub async fn unbind(&self, clean_type: u8) -> Result<(), TransportError> {
        self.session.unbind(clean_type).await
    }

    pub async fn reset_password(&self) -> Result<(), TransportError> {
        self.session.reset_password().await
    }

    pub async fn clear_data(&self) -> Result<(), TransportError> {
        self.session.clear_data().await
    }

    pub async fn list_files(
        &self,
        uid: u32,
        session_id: u32,
        only_one: bool,
    ) -> Result<(), TransportError> {
        self.session.list_files(uid, session_id, only_one).await
    }

    /// Request bytes `[start, end)` of a recording.
    pub async fn sync_file(&self, session_id: u32, start: u32, end: u32) -> Result<(), TransportError> {
        let command = self.transfer.request_file(session_id, start, end);
        self.session.send(command).await
    }

    /// Cancel the download in flight. Chunks still arriving for it are
    /// dropped until the device acknowledges.
    pub async fn stop_sync_file(&self) -> Result<(), TransportError> {
        self.transfer.cancel();
        self.session.send(Command::StopSync).await
    }

    pub async fn delete_recording(&self, session_id: u32) -> Result<(), TransportError> {
        self.session.delete_recording(session_id).await
    }

    pub fn snapshot(&self) -> DeviceStatusSnapshot {
        self.session.snapshot()
    }

    pub fn audio_activity(&self) -> AudioActivity {
        self.session.audio_activity()
    }

    pub fn files(&self) -> Vec<FileDescriptor> {
        self.transfer.files()
    }

    pub fn active_transfer(&self) -> Option<(u32, u8)> {
        self.transfer.active_progress()
    }

    pub fn completed_file(&self, session_id: u32) -> Option<Vec<u8>> {
        self.transfer.completed_file(session_id)
    }

    pub fn take_completed(&self) -> Option<(u32, Vec<u8>)> {
        self.transfer.take_completed()
    }
}

struct EventSink(mpsc::UnboundedSender<EngineEvent>);

impl EventSink {
    fn emit(&self, event: EngineEvent) {
        let _ = self.0.send(event);
    }

    fn log(&self, message: &str, severity: MessageSeverity) {
        self.emit(EngineEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
