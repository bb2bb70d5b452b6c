//! WinRT Backend Module
//!
//! [`Link`] and [`DevicePicker`] on top of `Windows.Devices.Bluetooth`.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

use crate::domain::models::DeviceHandle;
use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::link::{
    DeviceFilter, DevicePicker, Link, LinkConnection, LinkEvent, LinkSession, PickedDevice,
    PickerError, TransportError,
};
use crate::infrastructure::bluetooth::protocol::parse_uuid;

fn guid(uuid: &str) -> anyhow::Result<GUID> {
    Ok(GUID::from_u128(parse_uuid(uuid)?))
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

pub struct WinRtLink {
    service_uuid: String,
    notify_uuid: String,
    write_uuid: String,
}

impl WinRtLink {
    pub fn new(ble: &BleSettings) -> Self {
        Self {
            service_uuid: ble.service_uuid.clone(),
            notify_uuid: ble.notify_char_uuid.clone(),
            write_uuid: ble.write_char_uuid.clone(),
        }
    }

    async fn open_device(address: u64) -> Result<BluetoothLEDevice, TransportError> {
        let connect = |e: windows::core::Error| TransportError::Connect(e.to_string());
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)
            .map_err(connect)?
            .await
            .map_err(connect)?;

        // Keeps the link up between writes
        match GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId().map_err(connect)?) {
            Ok(op) => match op.await {
                Ok(session) => {
                    if let Err(e) = session.SetMaintainConnection(true) {
                        warn!("Failed to maintain GATT session: {}", e);
                    }
                }
                Err(e) => warn!("Failed to create GATT session: {}", e),
            },
            Err(e) => warn!("Failed to create GATT session: {}", e),
        }
        Ok(device)
    }

    async fn characteristics(
        &self,
        device: &BluetoothLEDevice,
    ) -> Result<(GattCharacteristic, GattCharacteristic), TransportError> {
        let discovery = |e: windows::core::Error| TransportError::Discovery(e.to_string());
        let uuid = |s: &str| guid(s).map_err(|e| TransportError::Discovery(e.to_string()));
        let service_uuid = uuid(&self.service_uuid)?;
        let notify_uuid = uuid(&self.notify_uuid)?;
        let write_uuid = uuid(&self.write_uuid)?;

        let services = device
            .GetGattServicesForUuidAsync(service_uuid)
            .map_err(discovery)?
            .await
            .map_err(discovery)?;
        if services.Status().map_err(discovery)? != GattCommunicationStatus::Success {
            return Err(TransportError::Discovery(
                "failed to get GATT services".to_string(),
            ));
        }
        let services = services.Services().map_err(discovery)?;
        if services.Size().map_err(discovery)? == 0 {
            return Err(TransportError::Discovery(self.service_uuid.clone()));
        }
        let service = services.GetAt(0).map_err(discovery)?;

        let access = service
            .RequestAccessAsync()
            .map_err(discovery)?
            .await
            .map_err(discovery)?;
        debug!("Service access status: {:?}", access);

        let chars = service
            .GetCharacteristicsAsync()
            .map_err(discovery)?
            .await
            .map_err(discovery)?;
        if chars.Status().map_err(discovery)? != GattCommunicationStatus::Success {
            return Err(TransportError::Discovery(
                "failed to get characteristics".to_string(),
            ));
        }
        let chars = chars.Characteristics().map_err(discovery)?;

        let mut notify = None;
        let mut write = None;
        for i in 0..chars.Size().map_err(discovery)? {
            let c = chars.GetAt(i).map_err(discovery)?;
            let id = c.Uuid().map_err(discovery)?;
            if id == notify_uuid {
                notify = Some(c);
            } else if id == write_uuid {
                write = Some(c);
            }
        }

        let notify = notify.ok_or_else(|| TransportError::Discovery(self.notify_uuid.clone()))?;
        let write = write.ok_or_else(|| TransportError::Discovery(self.write_uuid.clone()))?;
        Ok((notify, write))
    }
}

/// Detaches the event handlers and closes the device.
fn release(
    device: &BluetoothLEDevice,
    notify: &GattCharacteristic,
    value_token: i64,
    status_token: Option<i64>,
) {
    if let Err(e) = notify.RemoveValueChanged(value_token) {
        warn!("Failed to remove notification handler: {}", e);
    }
    if let Some(token) = status_token {
        if let Err(e) = device.RemoveConnectionStatusChanged(token) {
            warn!("Failed to remove connection status handler: {}", e);
        }
    }
    if let Err(e) = device.Close() {
        warn!("Failed to close device: {}", e);
    }
}

async fn enable_notifications(notify: &GattCharacteristic) -> Result<(), TransportError> {
    let subscribe = |e: windows::core::Error| TransportError::Subscribe(e.to_string());
    let status = notify
        .WriteClientCharacteristicConfigurationDescriptorAsync(
            GattClientCharacteristicConfigurationDescriptorValue::Notify,
        )
        .map_err(subscribe)?
        .await
        .map_err(subscribe)?;
    match status {
        GattCommunicationStatus::Success => Ok(()),
        other => Err(TransportError::Subscribe(format!("{:?}", other))),
    }
}

#[async_trait]
impl Link for WinRtLink {
    async fn connect(&self, device: &DeviceHandle) -> Result<LinkConnection, TransportError> {
        let address = device
            .address
            .ok_or_else(|| TransportError::Connect(format!("{} has no address", device.id)))?;
        info!("Connecting to {:#X}", address);

        let ble = Self::open_device(address).await?;
        let (notify, write) = match self.characteristics(&ble).await {
            Ok(chars) => chars,
            Err(e) => {
                if let Err(close) = ble.Close() {
                    warn!("Failed to close device: {}", close);
                }
                return Err(e);
            }
        };
        let (tx, events) = mpsc::unbounded_channel();

        let sender = tx.clone();
        let value_handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let bytes = read_buffer(&args.CharacteristicValue()?)?;
                    let _ = sender.send(LinkEvent::Notification(bytes));
                }
                Ok(())
            },
        );
        let value_token = match notify.ValueChanged(&value_handler) {
            Ok(token) => token,
            Err(e) => {
                if let Err(close) = ble.Close() {
                    warn!("Failed to close device: {}", close);
                }
                return Err(TransportError::Subscribe(e.to_string()));
            }
        };

        if let Err(e) = enable_notifications(&notify).await {
            release(&ble, &notify, value_token, None);
            return Err(e);
        }

        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let _ = tx.send(LinkEvent::Lost);
                    }
                }
                Ok(())
            });
        let status_token = match ble.ConnectionStatusChanged(&status_handler) {
            Ok(token) => token,
            Err(e) => {
                release(&ble, &notify, value_token, None);
                return Err(TransportError::Connect(e.to_string()));
            }
        };

        info!("Notifications enabled on {:#X}", address);
        Ok(LinkConnection {
            session: Arc::new(WinRtSession {
                device: Mutex::new(Some(ble)),
                notify,
                write,
                value_token,
                status_token,
            }),
            events,
        })
    }
}

struct WinRtSession {
    device: Mutex<Option<BluetoothLEDevice>>,
    notify: GattCharacteristic,
    write: GattCharacteristic,
    value_token: i64,
    status_token: i64,
}

impl WinRtSession {
    fn device(&self) -> Option<BluetoothLEDevice> {
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LinkSession for WinRtSession {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let failed = |e: windows::core::Error| TransportError::Write(e.to_string());
        let writer = DataWriter::new().map_err(failed)?;
        writer.WriteBytes(bytes).map_err(failed)?;
        let buffer = writer.DetachBuffer().map_err(failed)?;

        let status = self
            .write
            .WriteValueAsync(&buffer)
            .map_err(failed)?
            .await
            .map_err(failed)?;
        match status {
            GattCommunicationStatus::Success => Ok(()),
            other => Err(TransportError::Write(format!("{:?}", other))),
        }
    }

    async fn read(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let device = self.device().ok_or(TransportError::Closed)?;
        let discovery = |e: windows::core::Error| TransportError::Discovery(e.to_string());
        let failed = |e: windows::core::Error| TransportError::Read(e.to_string());
        let uuid = |s: &str| guid(s).map_err(|e| TransportError::Discovery(e.to_string()));
        let missing = || TransportError::Discovery(format!("{}/{}", service, characteristic));

        let services = device
            .GetGattServicesForUuidAsync(uuid(service)?)
            .map_err(discovery)?
            .await
            .map_err(discovery)?;
        if services.Status().map_err(discovery)? != GattCommunicationStatus::Success {
            return Err(missing());
        }
        let services = services.Services().map_err(discovery)?;
        if services.Size().map_err(discovery)? == 0 {
            return Err(missing());
        }
        let gatt_service = services.GetAt(0).map_err(discovery)?;

        let chars = gatt_service
            .GetCharacteristicsForUuidAsync(uuid(characteristic)?)
            .map_err(discovery)?
            .await
            .map_err(discovery)?;
        if chars.Status().map_err(discovery)? != GattCommunicationStatus::Success {
            return Err(missing());
        }
        let chars = chars.Characteristics().map_err(discovery)?;
        if chars.Size().map_err(discovery)? == 0 {
            return Err(missing());
        }

        let result = chars
            .GetAt(0)
            .map_err(discovery)?
            .ReadValueAsync()
            .map_err(failed)?
            .await
            .map_err(failed)?;
        match result.Status().map_err(failed)? {
            GattCommunicationStatus::Success => {
                read_buffer(&result.Value().map_err(failed)?).map_err(failed)
            }
            other => Err(TransportError::Read(format!("{:?}", other))),
        }
    }

    async fn disconnect(&self) {
        let device = self
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(device) = device {
            release(
                &device,
                &self.notify,
                self.value_token,
                Some(self.status_token),
            );
        }
    }
}

/// Picks the first advertisement matching the filter.
pub struct WinRtPicker;

/// Stops the watcher when the pick finishes or is abandoned.
struct WatcherGuard(BluetoothLEAdvertisementWatcher);

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.Stop() {
            warn!("Failed to stop advertisement watcher: {}", e);
        }
    }
}

#[async_trait]
impl DevicePicker for WinRtPicker {
    async fn request_device(&self, filter: &DeviceFilter) -> Result<PickedDevice, PickerError> {
        let unavailable = |e: windows::core::Error| PickerError::Unavailable(e.to_string());
        let services = filter
            .services
            .iter()
            .map(|s| guid(s))
            .collect::<anyhow::Result<Vec<GUID>>>()
            .map_err(|e| PickerError::Unavailable(e.to_string()))?;

        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(unavailable)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(unavailable)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let filter = filter.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let uuids = adv.ServiceUuids()?;
                    let mut found = services.is_empty();
                    for i in 0..uuids.Size()? {
                        if services.contains(&uuids.GetAt(i)?) {
                            found = true;
                            break;
                        }
                    }

                    let name = adv.LocalName()?.to_string();
                    if found && filter.matches_name(&name) {
                        let _ = tx.send(PickedDevice {
                            handle: DeviceHandle::with_address(args.BluetoothAddress()?),
                            name: (!name.is_empty()).then_some(name),
                            rssi: Some(args.RawSignalStrengthInDBm()?),
                        });
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(unavailable)?;
        watcher.Start().map_err(unavailable)?;
        let _guard = WatcherGuard(watcher);

        rx.recv().await.ok_or(PickerError::NotFound)
    }
}
