use std::sync::{Arc, Mutex};

use recorder_link::domain::models::{EngineEvent, MessageSeverity};
use recorder_link::domain::settings::SettingsService;
use recorder_link::infrastructure::bluetooth::link::{DevicePicker, Link};
use recorder_link::infrastructure::bluetooth::RecorderService;
use recorder_link::infrastructure::logging;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[cfg(windows)]
fn backend(settings: &SettingsService) -> (Arc<dyn Link>, Arc<dyn DevicePicker>) {
    use recorder_link::infrastructure::bluetooth::winrt::{WinRtLink, WinRtPicker};
    (
        Arc::new(WinRtLink::new(&settings.get().ble)),
        Arc::new(WinRtPicker),
    )
}

#[cfg(not(windows))]
fn backend(_settings: &SettingsService) -> (Arc<dyn Link>, Arc<dyn DevicePicker>) {
    use recorder_link::domain::models::DeviceHandle;
    use recorder_link::infrastructure::bluetooth::link::PickedDevice;
    use recorder_link::infrastructure::bluetooth::mock::{MockLink, MockPicker, ScriptedRecorder};
    use recorder_link::infrastructure::bluetooth::protocol::device_info;

    warn!("No BLE backend on this platform, using the simulated recorder");
    let link = MockLink::with_recorder(ScriptedRecorder::new());
    link.set_characteristic(device_info::SERVICE, device_info::MODEL_NUMBER, b"Simulated Recorder");
    link.set_characteristic(device_info::SERVICE, device_info::SERIAL_NUMBER, b"SIM-0001");
    link.set_characteristic(device_info::SERVICE, device_info::FIRMWARE_REVISION, b"0.0.0");
    (
        Arc::new(link),
        Arc::new(MockPicker::returning(PickedDevice {
            handle: DeviceHandle::new("SIM-0001"),
            name: Some("Simulated Recorder".to_string()),
            rssi: Some(-50),
        })),
    )
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::LogMessage(msg) => match msg.severity {
            MessageSeverity::Error => error!("{}", msg.message),
            MessageSeverity::Warning => warn!("{}", msg.message),
            MessageSeverity::Info | MessageSeverity::Success => info!("{}", msg.message),
        },
        EngineEvent::ConnectionStatus(status) => info!("Connection: {:?}", status),
        EngineEvent::AudioActivity(activity) => info!("Recorder is {:?}", activity),
        EngineEvent::FilesUpdated(files) => info!("{} recordings on device", files.len()),
        EngineEvent::TransferProgress {
            session_id,
            progress,
        } => debug!("Recording {}: {}%", session_id, progress),
        other => debug!("{:?}", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new().unwrap_or_else(|e| {
        eprintln!("Using local settings file: {}", e);
        SettingsService::from_path("settings.json")
    });
    let _guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting Recorder Link");

    let (link, picker) = backend(&settings);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let service = RecorderService::new(link, picker, Arc::new(Mutex::new(settings)), tx);

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            log_event(&event);
        }
    });

    let Some(device) = service.start_scan().await? else {
        warn!("No recorder selected");
        return Ok(());
    };
    info!("Connecting to {} ({} dBm)", device.name, device.rssi);
    service.connect(&device.handle).await?;

    service.get_storage_volume().await?;
    service.get_system_version().await?;

    info!("Press Ctrl+C to disconnect");
    tokio::signal::ctrl_c().await?;

    service.disconnect().await;
    info!("Recorder Link stopped");
    Ok(())
}
