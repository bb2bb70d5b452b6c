//! BLE Scanner Module
//!
//! A scan is one picker request. Picked devices land in a
//! [`DeviceRegistry`] that a background task prunes on a fixed interval.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::devices::{DeviceRegistry, RegistryConfig};
use crate::domain::models::{DiscoveredDevice, EngineEvent, MessageSeverity, StatusMessage};
use crate::domain::settings::ScannerSettings;
use crate::infrastructure::bluetooth::link::{DeviceFilter, DevicePicker, PickerError};

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

fn lock_registry(registry: &Mutex<DeviceRegistry>) -> MutexGuard<'_, DeviceRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Scanner {
    picker: Arc<dyn DevicePicker>,
    registry: Arc<Mutex<DeviceRegistry>>,
    settings: ScannerSettings,
    filter: DeviceFilter,
    abort: Mutex<Option<oneshot::Sender<()>>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    event_sender: mpsc::UnboundedSender<EngineEvent>,
}

impl Scanner {
    pub fn new(
        picker: Arc<dyn DevicePicker>,
        settings: ScannerSettings,
        filter: DeviceFilter,
        event_sender: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            picker,
            registry: Arc::new(Mutex::new(DeviceRegistry::new(RegistryConfig::from(
                &settings,
            )))),
            settings,
            filter,
            abort: Mutex::new(None),
            cleanup: Mutex::new(None),
            event_sender,
        }
    }

    /// Ask the picker for a device.
    ///
    /// Returns `Ok(None)` when the user cancels, the scan is stopped, the
    /// scan times out, or the device is too weak to admit.
    pub async fn start_scan(&self) -> Result<Option<DiscoveredDevice>, PickerError> {
        self.stop_scan();
        self.ensure_cleanup_task();

        let (abort_tx, abort_rx) = oneshot::channel();
        *self.abort.lock().unwrap_or_else(PoisonError::into_inner) = Some(abort_tx);

        info!("Starting scan");
        self.send_log("Scanning for recorders...", MessageSeverity::Info);

        let outcome = tokio::select! {
            picked = self.picker.request_device(&self.filter) => Some(picked),
            _ = abort_rx => None,
            _ = tokio::time::sleep(self.settings.scan_timeout()) => {
                warn!("Scan timed out after {:?}", self.settings.scan_timeout());
                self.send_log("No recorder found", MessageSeverity::Warning);
                self.abort.lock().unwrap_or_else(PoisonError::into_inner).take();
                return Ok(None);
            }
        };

        let Some(picked) = outcome else {
            info!("Scan stopped");
            return Ok(None);
        };
        self.abort.lock().unwrap_or_else(PoisonError::into_inner).take();

        let picked = match picked {
            Ok(picked) => picked,
            Err(PickerError::Cancelled) => {
                info!("Device selection cancelled");
                return Ok(None);
            }
            Err(e) => {
                warn!("Scan failed: {}", e);
                self.send_log(&format!("Scan failed: {}", e), MessageSeverity::Error);
                return Err(e);
            }
        };

        let id = picked.handle.id.clone();
        let name = picked.name.unwrap_or_else(|| "Unknown".to_string());
        let rssi = picked.rssi.unwrap_or(self.settings.assumed_rssi);

        let mut registry = lock_registry(&self.registry);
        if !registry.upsert(picked.handle, &name, rssi, now()) {
            warn!("{} too weak to admit ({} dBm)", name, rssi);
            return Ok(None);
        }
        let device = registry.device(&id).cloned();
        self.emit(EngineEvent::DevicesChanged(registry.list()));
        drop(registry);

        self.send_log(&format!("Found {}", name), MessageSeverity::Success);
        Ok(device)
    }

    /// Abort a scan in progress. Returns whether one was running.
    pub fn stop_scan(&self) -> bool {
        let abort = self.abort.lock().unwrap_or_else(PoisonError::into_inner).take();
        match abort {
            Some(tx) => {
                info!("Stopping scan...");
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn ensure_cleanup_task(&self) {
        let mut cleanup = self.cleanup.lock().unwrap_or_else(PoisonError::into_inner);
        if cleanup.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let registry = self.registry.clone();
        let sender = self.event_sender.clone();
        let period = self.settings.cleanup_interval();
        *cleanup = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let changed = {
                    let mut devices = lock_registry(&registry);
                    let removed = devices.evict_expired(now());
                    (!removed.is_empty()).then(|| devices.list())
                };
                if let Some(list) = changed {
                    if sender.send(EngineEvent::DevicesChanged(list)).is_err() {
                        break;
                    }
                }
            }
        }));
    }

    /// Nearest first, then strongest.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        lock_registry(&self.registry).list()
    }

    pub fn device(&self, id: &str) -> Option<DiscoveredDevice> {
        lock_registry(&self.registry).device(id).cloned()
    }

    pub fn nearest(&self) -> Option<DiscoveredDevice> {
        lock_registry(&self.registry).nearest().cloned()
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut registry = lock_registry(&self.registry);
        let removed = registry.remove(id);
        if removed {
            self.emit(EngineEvent::DevicesChanged(registry.list()));
        }
        removed
    }

    pub fn clear(&self) {
        lock_registry(&self.registry).clear();
        self.emit(EngineEvent::DevicesChanged(Vec::new()));
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

impl Drop for Scanner {
    fn drop(&mut self) {
        self.stop_scan();
        if let Some(task) = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceHandle;
    use crate::infrastructure::bluetooth::link::PickedDevice;
    use crate::infrastructure::bluetooth::mock::MockPicker;
    use std::time::Duration;

    fn scanner(picker: MockPicker) -> (Arc<Scanner>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scanner = Scanner::new(
            Arc::new(picker),
            ScannerSettings::default(),
            DeviceFilter::default(),
            tx,
        );
        (Arc::new(scanner), rx)
    }

    fn picked(id: &str, rssi: Option<i16>) -> PickedDevice {
        PickedDevice {
            handle: DeviceHandle::new(id),
            name: Some(format!("REC-{}", id)),
            rssi,
        }
    }

    #[tokio::test]
    async fn picked_device_is_listed() {
        let (scanner, mut rx) = scanner(MockPicker::returning(picked("a1", Some(-55))));

        let device = scanner.start_scan().await.unwrap().unwrap();
        assert_eq!(device.id, "a1");
        assert_eq!(device.name, "REC-a1");
        assert!(device.is_nearest);
        assert!(!scanner.is_scanning());

        let mut saw_list = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::DevicesChanged(list) = event {
                saw_list = list.len() == 1;
            }
        }
        assert!(saw_list);
    }

    #[tokio::test]
    async fn missing_rssi_uses_assumed_value() {
        let (scanner, _rx) = scanner(MockPicker::returning(picked("a1", None)));
        let device = scanner.start_scan().await.unwrap().unwrap();
        assert_eq!(device.rssi, -60);
    }

    #[tokio::test]
    async fn cancellation_is_not_an_error() {
        let (scanner, _rx) = scanner(MockPicker::failing(PickerError::Cancelled));
        assert_eq!(scanner.start_scan().await.map(|d| d.is_none()), Ok(true));
        assert!(scanner.devices().is_empty());
    }

    #[tokio::test]
    async fn picker_failure_is_reported() {
        let (scanner, _rx) = scanner(MockPicker::failing(PickerError::Unavailable(
            "adapter off".to_string(),
        )));
        assert!(matches!(
            scanner.start_scan().await,
            Err(PickerError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn stop_scan_aborts_pending_picker() {
        let (scanner, _rx) = scanner(MockPicker::pending());
        let task = {
            let scanner = scanner.clone();
            tokio::spawn(async move { scanner.start_scan().await })
        };

        tokio::task::yield_now().await;
        assert!(scanner.is_scanning());
        assert!(scanner.stop_scan());

        assert!(matches!(task.await.unwrap(), Ok(None)));
        assert!(!scanner.stop_scan());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_times_out() {
        let (scanner, _rx) = scanner(MockPicker::pending());
        assert!(matches!(scanner.start_scan().await, Ok(None)));
        assert!(!scanner.is_scanning());
    }

    #[tokio::test]
    async fn weak_device_is_not_admitted() {
        let (scanner, _rx) = scanner(MockPicker::returning(picked("far", Some(-110))));
        assert!(matches!(scanner.start_scan().await, Ok(None)));
        assert!(scanner.device("far").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_devices_are_pruned_in_background() {
        let (scanner, mut rx) = scanner(MockPicker::returning(picked("a1", Some(-55))));
        scanner.start_scan().await.unwrap();
        while rx.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_secs(13)).await;

        assert!(scanner.devices().is_empty());
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::DevicesChanged(list)) if list.is_empty()
        ));
    }

    #[tokio::test]
    async fn clear_and_remove() {
        let (scanner, _rx) = scanner(MockPicker::returning(picked("a1", Some(-55))));
        scanner.start_scan().await.unwrap();
        assert!(scanner.nearest().is_some());

        assert!(scanner.remove("a1"));
        assert!(!scanner.remove("a1"));

        scanner.start_scan().await.unwrap();
        scanner.clear();
        assert!(scanner.devices().is_empty());
    }
}
