//! Transport Adapter
//!
//! The seam between the protocol bridge and a concrete BLE stack. Link
//! activity flows back to the bridge as [`DeviceEvent`]s over an unbounded
//! channel supplied at connect/subscribe time.

use crate::domain::models::ScanResult;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Events raised by a transport for a connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A notification chunk arrived on a subscribed characteristic
    ValueChanged { device_id: String, value: Vec<u8> },
    /// The link dropped, whether requested locally or not
    Disconnected { device_id: String },
}

pub type EventSender = mpsc::UnboundedSender<DeviceEvent>;
pub type ScanSender = mpsc::UnboundedSender<ScanResult>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no Bluetooth adapter available")]
    NoAdapter,
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("characteristic {characteristic} not found on device {device_id}")]
    CharacteristicNotFound {
        device_id: String,
        characteristic: Uuid,
    },
    #[error("operation rejected: {0}")]
    Rejected(String),
    #[cfg(feature = "hardware")]
    #[error(transparent)]
    Backend(#[from] btleplug::Error),
}

/// Platform BLE primitives consumed by the bridge
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Prepare the radio. Called once before the first scan.
    async fn initialize(&self) -> Result<(), TransportError>;

    /// Start discovery for peripherals advertising any of `services`
    async fn start_scan(&self, services: &[Uuid], results: ScanSender) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Open a link. A [`DeviceEvent::Disconnected`] must be sent on `events`
    /// whenever this link later drops.
    async fn connect(&self, device_id: &str, events: EventSender) -> Result<(), TransportError>;

    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError>;

    /// Write a full payload. Implementations must not fragment it.
    async fn write(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Enable notifications and forward each value as [`DeviceEvent::ValueChanged`]
    async fn subscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        events: EventSender,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;
}
