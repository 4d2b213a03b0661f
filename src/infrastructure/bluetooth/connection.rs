//! BLE Connection Module
//!
//! Handles link establishment, notification subscription and the per-device
//! connection table.

use crate::domain::models::SessionState;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::error::{BridgeError, BridgeResult};
use crate::infrastructure::bluetooth::multiplexer::DEFAULT_TIMEOUT;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{DeviceEvent, EventSender, Transport};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Delay after enabling notifications so the CCCD write can settle
pub const NOTIFICATION_GRACE: Duration = Duration::from_millis(100);

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Lockmate service
    pub service_uuid: Uuid,
    /// Characteristic the app writes requests to
    pub rx_char_uuid: Uuid,
    /// Characteristic the lock notifies responses on
    pub tx_char_uuid: Uuid,
    /// Deadline for each request unless the caller overrides it
    pub request_timeout: Duration,
    /// Wait after subscribing before the link is reported ready
    pub notification_grace: Duration,
    /// Case-insensitive substring that identifies a Lockmate by name
    pub device_name_marker: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE,
            rx_char_uuid: protocol::RX_CHAR,
            tx_char_uuid: protocol::TX_CHAR,
            request_timeout: DEFAULT_TIMEOUT,
            notification_grace: NOTIFICATION_GRACE,
            device_name_marker: "lockmate".to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            service_uuid: protocol::parse_uuid(&settings.ble_service_uuid)?,
            rx_char_uuid: protocol::parse_uuid(&settings.ble_rx_char_uuid)?,
            tx_char_uuid: protocol::parse_uuid(&settings.ble_tx_char_uuid)?,
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            notification_grace: Duration::from_millis(settings.notification_grace_ms),
            device_name_marker: settings.device_name_marker.clone(),
        })
    }
}

/// One live link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConnection {
    pub state: SessionState,
    pub notifications_enabled: bool,
    /// Identifies this link among successive links to the same device
    pub generation: u64,
}

/// A transport event tagged with the link that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub generation: u64,
    pub event: DeviceEvent,
}

pub type LinkSender = mpsc::UnboundedSender<LinkEvent>;

/// Outcome of [`Connections::begin`]
#[derive(Debug, Clone, Copy)]
struct Link {
    generation: u64,
    /// The device already had a subscribed link, which is being reused
    reused: bool,
}

/// Connection table shared between callers and the event pump
#[derive(Debug, Clone)]
pub struct Connections {
    inner: Arc<Mutex<HashMap<String, DeviceConnection>>>,
    next_generation: Arc<AtomicU64>,
}

impl Default for Connections {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DeviceConnection>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, device_id: &str) -> SessionState {
        self.lock()
            .get(device_id)
            .map_or(SessionState::Disconnected, |c| c.state)
    }

    pub fn notifications_enabled(&self, device_id: &str) -> bool {
        self.lock()
            .get(device_id)
            .is_some_and(|c| c.notifications_enabled)
    }

    /// Generation of the device's current link, if any
    pub fn generation(&self, device_id: &str) -> Option<u64> {
        self.lock().get(device_id).map(|c| c.generation)
    }

    /// Record a link attempt. A subscribed link keeps its generation;
    /// anything else starts a fresh one.
    fn begin(&self, device_id: &str) -> Link {
        let mut table = self.lock();
        if let Some(entry) = table.get(device_id).filter(|c| c.notifications_enabled) {
            return Link {
                generation: entry.generation,
                reused: true,
            };
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        table.insert(
            device_id.to_string(),
            DeviceConnection {
                state: SessionState::Connecting,
                notifications_enabled: false,
                generation,
            },
        );
        Link {
            generation,
            reused: false,
        }
    }

    /// Update the entry of one link. Returns `false` if that link was torn
    /// down or replaced meanwhile.
    fn update(&self, device_id: &str, generation: u64, f: impl FnOnce(&mut DeviceConnection)) -> bool {
        match self.lock().get_mut(device_id) {
            Some(connection) if connection.generation == generation => {
                f(connection);
                true
            }
            _ => false,
        }
    }

    /// Forget a device, clearing its notification flag
    pub fn remove(&self, device_id: &str) -> Option<DeviceConnection> {
        self.lock().remove(device_id)
    }

    /// Forget a device only if its current link is `generation`
    pub fn remove_link(&self, device_id: &str, generation: u64) -> bool {
        let mut table = self.lock();
        if table.get(device_id).is_some_and(|c| c.generation == generation) {
            table.remove(device_id);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Sender handed to the transport for one link; everything it receives
/// reaches the pump tagged with `generation`.
fn link_events(generation: u64, pump: LinkSender) -> EventSender {
    let (events, mut link) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = link.recv().await {
            if pump.send(LinkEvent { generation, event }).is_err() {
                break;
            }
        }
    });
    events
}

/// BLE Connection handler
pub struct BleConnection<T: Transport> {
    transport: Arc<T>,
    config: ConnectionConfig,
}

impl<T: Transport> BleConnection<T> {
    /// Create a new connection handler
    pub fn new(transport: Arc<T>, config: ConnectionConfig) -> Self {
        Self { transport, config }
    }

    /// Link to a device and make it ready for requests
    ///
    /// Link events reach `pump` for the lifetime of the link. Notifications
    /// are enabled once per link; a repeated call on a ready device skips
    /// re-subscription.
    pub async fn connect(
        &self,
        device_id: &str,
        connections: &Connections,
        pump: &LinkSender,
    ) -> BridgeResult<()> {
        info!(device_id, "Connecting to device");
        let link = connections.begin(device_id);
        let events = link_events(link.generation, pump.clone());

        // Step 1: Open the link
        if let Err(e) = self.transport.connect(device_id, events.clone()).await {
            error!(device_id, "Failed to connect: {}", e);
            // A live link stays as it is; its own disconnect event tears it down
            if !link.reused {
                connections.remove_link(device_id, link.generation);
            }
            return Err(BridgeError::Transport(e));
        }
        info!(device_id, generation = link.generation, "Connected to device");

        if link.reused {
            debug!(device_id, "Notifications already enabled");
            return self.mark_ready(device_id, link.generation, connections);
        }

        // Step 2: Enable TX notifications
        if !connections.update(device_id, link.generation, |c| {
            c.state = SessionState::AwaitingNotifications
        }) {
            return Err(disconnected(device_id));
        }
        if let Err(e) = self
            .transport
            .subscribe(
                device_id,
                self.config.service_uuid,
                self.config.tx_char_uuid,
                events,
            )
            .await
        {
            error!(device_id, "Failed to enable notifications: {}", e);
            connections.remove_link(device_id, link.generation);
            return Err(BridgeError::Transport(e));
        }
        if !connections.update(device_id, link.generation, |c| c.notifications_enabled = true) {
            return Err(disconnected(device_id));
        }
        info!(device_id, "TX notifications enabled");

        // Step 3: Give the CCCD write time to complete
        tokio::time::sleep(self.config.notification_grace).await;

        self.mark_ready(device_id, link.generation, connections)
    }

    fn mark_ready(&self, device_id: &str, generation: u64, connections: &Connections) -> BridgeResult<()> {
        if connections.update(device_id, generation, |c| c.state = SessionState::Ready) {
            Ok(())
        } else {
            // The link dropped while we were setting it up
            Err(disconnected(device_id))
        }
    }
}

fn disconnected(device_id: &str) -> BridgeError {
    BridgeError::Disconnected {
        device_id: device_id.to_string(),
    }
}
