//! BLE Connection Module
//!
//! Owns the link session and the connection state machine
//! `Disconnected -> Connecting -> Connected -> Disconnected`. Inbound
//! notifications are forwarded untouched to a single subscriber.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::domain::models::{ConnectionStatus, DeviceHandle};
use crate::infrastructure::bluetooth::link::{
    Link, LinkConnection, LinkEvent, LinkSession, TransportError,
};
use crate::infrastructure::bluetooth::protocol::hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    LinkLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StatusChanged(ConnectionStatus),
    Notification(Vec<u8>),
    /// Emitted once per established or attempted connection
    Disconnected { reason: DisconnectReason },
}

struct Inner {
    status: ConnectionStatus,
    session: Option<Arc<dyn LinkSession>>,
    device: Option<DeviceHandle>,
    /// Bumped on every connect and teardown; stale pumps compare against it
    generation: u64,
    subscriber: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    pump: Option<JoinHandle<()>>,
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        if let Some(tx) = &self.subscriber {
            let _ = tx.send(event);
        }
    }
}

type Teardown = (Arc<dyn LinkSession>, Option<JoinHandle<()>>);

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ConnectionManager {
    link: Arc<dyn Link>,
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionManager {
    pub fn new(link: Arc<dyn Link>) -> Self {
        Self {
            link,
            inner: Arc::new(Mutex::new(Inner {
                status: ConnectionStatus::Disconnected,
                session: None,
                device: None,
                generation: 0,
                subscriber: None,
                pump: None,
            })),
        }
    }

    /// Register the single consumer of connection events, replacing any
    /// previous one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner).subscriber = Some(tx);
        rx
    }

    pub fn unsubscribe(&self) {
        lock(&self.inner).subscriber = None;
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner).status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        lock(&self.inner).device.clone()
    }

    /// Connect to `device`. On failure the manager is back in
    /// `Disconnected` and nothing of the attempt is kept.
    pub async fn connect(&self, device: &DeviceHandle) -> Result<(), TransportError> {
        let generation = {
            let mut inner = lock(&self.inner);
            if inner.status != ConnectionStatus::Disconnected {
                return Err(TransportError::Busy);
            }
            inner.status = ConnectionStatus::Connecting;
            inner.generation += 1;
            inner.device = Some(device.clone());
            inner.emit(ConnectionEvent::StatusChanged(ConnectionStatus::Connecting));
            inner.generation
        };

        info!("Connecting to device: {}", device.id);

        let LinkConnection { session, events } = match self.link.connect(device).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Connection to {} failed: {}", device.id, e);
                let mut inner = lock(&self.inner);
                if inner.generation == generation {
                    inner.status = ConnectionStatus::Disconnected;
                    inner.device = None;
                    inner.emit(ConnectionEvent::StatusChanged(ConnectionStatus::Disconnected));
                }
                return Err(e);
            }
        };

        let superseded = {
            let mut inner = lock(&self.inner);
            if inner.generation != generation {
                true
            } else {
                inner.status = ConnectionStatus::Connected;
                inner.session = Some(session.clone());
                inner.pump = Some(tokio::spawn(Self::pump(
                    self.inner.clone(),
                    events,
                    generation,
                )));
                inner.emit(ConnectionEvent::StatusChanged(ConnectionStatus::Connected));
                false
            }
        };

        if superseded {
            warn!("Connection to {} cancelled while in progress", device.id);
            session.disconnect().await;
            return Err(TransportError::Closed);
        }

        info!("Connected to device: {}", device.id);
        Ok(())
    }

    /// Forward link events until the link reports loss or closes.
    async fn pump(
        inner: Arc<Mutex<Inner>>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        generation: u64,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Notification(bytes) => {
                    trace!("RX {}", hex(&bytes));
                    let guard = lock(&inner);
                    if guard.generation != generation {
                        return;
                    }
                    guard.emit(ConnectionEvent::Notification(bytes));
                }
                LinkEvent::Lost => break,
            }
        }

        warn!("Link lost");
        if let Some((session, _pump)) =
            Self::teardown(&inner, Some(generation), DisconnectReason::LinkLost)
        {
            session.disconnect().await;
        }
    }

    /// The one teardown path. Returns the session to close, or `None` when
    /// already torn down (or `generation` is stale).
    fn teardown(
        inner: &Mutex<Inner>,
        generation: Option<u64>,
        reason: DisconnectReason,
    ) -> Option<Teardown> {
        let mut inner = lock(inner);
        if inner.status == ConnectionStatus::Disconnected {
            return None;
        }
        if generation.is_some_and(|g| g != inner.generation) {
            return None;
        }

        inner.status = ConnectionStatus::Disconnected;
        inner.generation += 1;
        inner.device = None;
        let session = inner.session.take();
        let pump = inner.pump.take();
        inner.emit(ConnectionEvent::Disconnected { reason });
        debug!("Connection torn down ({:?})", reason);

        session.map(|session| (session, pump))
    }

    /// Disconnect from the current device. A no-op when already disconnected.
    pub async fn disconnect(&self) {
        if let Some((session, pump)) =
            Self::teardown(&self.inner, None, DisconnectReason::Requested)
        {
            if let Some(pump) = pump {
                pump.abort();
            }
            session.disconnect().await;
            info!("Disconnected from device");
        }
    }

    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let session = {
            let inner = lock(&self.inner);
            match (&inner.status, &inner.session) {
                (ConnectionStatus::Connected, Some(session)) => session.clone(),
                _ => return Err(TransportError::NotConnected),
            }
        };

        trace!("TX {}", hex(bytes));
        session.write(bytes).await.map_err(|e| {
            error!("Write failed: {}", e);
            e
        })
    }

    pub async fn read_characteristic(
        &self,
        service: &str,
        characteristic: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let session = {
            let inner = lock(&self.inner);
            match (&inner.status, &inner.session) {
                (ConnectionStatus::Connected, Some(session)) => session.clone(),
                _ => return Err(TransportError::NotConnected),
            }
        };

        let value = session.read(service, characteristic).await?;
        trace!("READ {} {}", characteristic, hex(&value));
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::MockLink;

    fn manager() -> (MockLink, ConnectionManager) {
        let link = MockLink::new();
        let manager = ConnectionManager::new(Arc::new(link.clone()));
        (link, manager)
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn connect_walks_the_state_machine() {
        let (_link, manager) = manager();
        let mut rx = manager.subscribe();

        manager.connect(&DeviceHandle::new("rec")).await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(manager.device().map(|d| d.id), Some("rec".to_string()));
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::StatusChanged(ConnectionStatus::Connecting))
        );
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::StatusChanged(ConnectionStatus::Connected))
        );
    }

    #[tokio::test]
    async fn failed_connect_returns_to_disconnected() {
        let (link, manager) = manager();
        let mut rx = manager.subscribe();
        link.fail_next_connect(TransportError::Discovery("service".to_string()));

        let err = manager.connect(&DeviceHandle::new("rec")).await.unwrap_err();
        assert_eq!(err, TransportError::Discovery("service".to_string()));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(manager.device().is_none());

        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::StatusChanged(ConnectionStatus::Connecting))
        );
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::StatusChanged(ConnectionStatus::Disconnected))
        );

        // A later attempt still works
        manager.connect(&DeviceHandle::new("rec")).await.unwrap();
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn second_connect_is_refused() {
        let (_link, manager) = manager();
        manager.connect(&DeviceHandle::new("a")).await.unwrap();
        assert_eq!(
            manager.connect(&DeviceHandle::new("b")).await,
            Err(TransportError::Busy)
        );
    }

    #[tokio::test]
    async fn write_requires_connection() {
        let (link, manager) = manager();
        assert_eq!(
            manager.write_bytes(&[1, 3, 0]).await,
            Err(TransportError::NotConnected)
        );

        manager.connect(&DeviceHandle::new("rec")).await.unwrap();
        manager.write_bytes(&[1, 3, 0]).await.unwrap();
        assert_eq!(link.writes(), vec![vec![1, 3, 0]]);

        link.set_fail_writes(true);
        assert!(matches!(
            manager.write_bytes(&[1, 9, 0]).await,
            Err(TransportError::Write(_))
        ));
    }

    #[tokio::test]
    async fn notifications_are_forwarded_in_order() {
        let (link, manager) = manager();
        let mut rx = manager.subscribe();
        manager.connect(&DeviceHandle::new("rec")).await.unwrap();
        let _ = rx.recv().await;
        let _ = rx.recv().await;

        link.notify(vec![1, 9, 0, 0, 80]);
        link.notify(vec![2, 0xAA]);

        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::Notification(vec![1, 9, 0, 0, 80]))
        );
        assert_eq!(rx.recv().await, Some(ConnectionEvent::Notification(vec![2, 0xAA])));
    }

    #[tokio::test]
    async fn disconnect_emits_exactly_one_event() {
        let (link, manager) = manager();
        manager.connect(&DeviceHandle::new("rec")).await.unwrap();
        let mut rx = manager.subscribe();

        manager.disconnect().await;
        manager.disconnect().await;
        settle().await;

        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::Disconnected {
                reason: DisconnectReason::Requested
            })
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(link.disconnect_count(), 1);
        assert_eq!(
            manager.write_bytes(&[1]).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn link_loss_and_disconnect_share_one_teardown() {
        let (link, manager) = manager();
        manager.connect(&DeviceHandle::new("rec")).await.unwrap();
        let mut rx = manager.subscribe();

        link.drop_link();
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::Disconnected {
                reason: DisconnectReason::LinkLost
            })
        );
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);

        manager.disconnect().await;
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribed_consumer_sees_channel_close() {
        let (link, manager) = manager();
        let mut rx = manager.subscribe();
        manager.unsubscribe();

        manager.connect(&DeviceHandle::new("rec")).await.unwrap();
        link.notify(vec![1, 110, 0]);
        settle().await;

        assert_eq!(rx.recv().await, None);
    }
}
