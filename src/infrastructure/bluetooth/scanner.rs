//! BLE Scanner Module
//!
//! Handles Bluetooth LE discovery of Lockmate controllers.

use crate::domain::models::ScanResult;
use crate::infrastructure::bluetooth::transport::{Transport, TransportError};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Whether an advertised name belongs to a Lockmate
pub fn matches_marker(name: Option<&str>, marker: &str) -> bool {
    name.is_some_and(|name| name.to_lowercase().contains(&marker.to_lowercase()))
}

/// Filters one scan session down to unique Lockmate devices
#[derive(Debug)]
pub struct ScanFilter {
    marker: String,
    seen: HashSet<String>,
}

impl ScanFilter {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            seen: HashSet::new(),
        }
    }

    /// `true` the first time a matching device is seen in this session
    pub fn accept(&mut self, result: &ScanResult) -> bool {
        matches_marker(result.name.as_deref(), &self.marker)
            && self.seen.insert(result.device_id.clone())
    }
}

/// BLE Scanner for discovering Lockmate controllers
pub struct BleScanner<T: Transport> {
    transport: Arc<T>,
    initialized: bool,
    forwarder: Option<JoinHandle<()>>,
}

impl<T: Transport> BleScanner<T> {
    /// Create a new scanner
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            initialized: false,
            forwarder: None,
        }
    }

    /// Start scanning for BLE devices
    ///
    /// # Arguments
    /// * `service_uuid` - The service UUID to scan for
    /// * `marker` - Name substring a device must carry (case-insensitive)
    ///
    /// Each matching device is yielded once per scan session.
    pub async fn start(
        &mut self,
        service_uuid: Uuid,
        marker: &str,
    ) -> Result<mpsc::UnboundedReceiver<ScanResult>, TransportError> {
        // Stop any existing scan
        self.stop().await?;

        if !self.initialized {
            self.transport.initialize().await?;
            self.initialized = true;
        }

        info!("Starting BLE scan for service UUID: {}", service_uuid);
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let (found_tx, found_rx) = mpsc::unbounded_channel();
        self.transport.start_scan(&[service_uuid], raw_tx).await?;

        let mut filter = ScanFilter::new(marker);
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(result) = raw_rx.recv().await {
                if !filter.accept(&result) {
                    continue;
                }
                debug!(device_id = %result.device_id, "Found {}", result.display_name());
                if found_tx.send(result).is_err() {
                    break;
                }
            }
        }));

        Ok(found_rx)
    }

    /// Stop scanning
    pub async fn stop(&mut self) -> Result<(), TransportError> {
        if let Some(forwarder) = self.forwarder.take() {
            info!("Stopping BLE scan...");
            forwarder.abort();
            self.transport.stop_scan().await?;
        }
        Ok(())
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.forwarder.is_some()
    }
}

impl<T: Transport> Drop for BleScanner<T> {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
