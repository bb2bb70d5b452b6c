//! Transport seams.
//!
//! The engine never talks to a GATT stack directly. A [`Link`] opens a
//! session to a device and hands back the write half plus a channel of
//! [`LinkEvent`]s; a [`DevicePicker`] yields one user-selected device.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::models::DeviceHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("already connected or connecting")]
    Busy,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("service or characteristic not found: {0}")]
    Discovery(String),
    #[error("notification subscription failed: {0}")]
    Subscribe(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("link closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PickerError {
    /// The user dismissed the picker; not a failure.
    #[error("device selection cancelled")]
    Cancelled,
    #[error("no matching device found")]
    NotFound,
    #[error("picker unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Raw value pushed on the notify characteristic
    Notification(Vec<u8>),
    /// The platform reported the link gone
    Lost,
}

/// The write half of an open link.
#[async_trait]
pub trait LinkSession: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Reads one characteristic of any service on the device. A missing
    /// service or characteristic is [`TransportError::Discovery`].
    async fn read(&self, service: &str, characteristic: &str)
        -> Result<Vec<u8>, TransportError>;

    /// Tears down the platform session. Must be safe to call twice.
    async fn disconnect(&self);
}

pub struct LinkConnection {
    pub session: Arc<dyn LinkSession>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait Link: Send + Sync {
    /// Connects, resolves the notify/write characteristics and subscribes.
    async fn connect(&self, device: &DeviceHandle) -> Result<LinkConnection, TransportError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub name_prefix: Option<String>,
    pub services: Vec<String>,
}

impl DeviceFilter {
    pub fn matches_name(&self, name: &str) -> bool {
        match &self.name_prefix {
            Some(prefix) if !prefix.is_empty() => name.starts_with(prefix.as_str()),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickedDevice {
    pub handle: DeviceHandle,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

#[async_trait]
pub trait DevicePicker: Send + Sync {
    async fn request_device(&self, filter: &DeviceFilter) -> Result<PickedDevice, PickerError>;
}
