//! btleplug transport
//!
//! Drives a real radio through the platform adapter. Device ids are the
//! platform peripheral ids rendered as strings.

use crate::domain::models::ScanResult;
use crate::infrastructure::bluetooth::transport::{
    DeviceEvent, EventSender, ScanSender, Transport, TransportError,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter as AdapterScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct BtleState {
    adapter: Adapter,
    peripherals: RwLock<HashMap<String, Peripheral>>,
    scan: Mutex<Option<ScanSender>>,
    links: Mutex<HashMap<String, EventSender>>,
    notification_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BtleState {
    fn scan(&self) -> MutexGuard<'_, Option<ScanSender>> {
        self.scan.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn links(&self) -> MutexGuard<'_, HashMap<String, EventSender>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notification_tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.notification_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_notifications(&self, device_id: &str) {
        if let Some(task) = self.notification_tasks().remove(device_id) {
            task.abort();
        }
    }

    async fn handle(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Some(sender) = self.scan().clone() else {
                    return;
                };
                let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                    return;
                };
                let properties = match peripheral.properties().await {
                    Ok(Some(properties)) => properties,
                    Ok(None) => return,
                    Err(e) => {
                        debug!("Failed to read properties: {}", e);
                        return;
                    }
                };
                let device_id = peripheral_key(&id);
                self.peripherals
                    .write()
                    .await
                    .insert(device_id.clone(), peripheral);
                let _ = sender.send(scan_result(device_id, &properties));
            }
            CentralEvent::DeviceDisconnected(id) => {
                let device_id = peripheral_key(&id);
                self.stop_notifications(&device_id);
                if let Some(link) = self.links().remove(&device_id) {
                    info!(device_id = %device_id, "Device disconnected");
                    let _ = link.send(DeviceEvent::Disconnected { device_id });
                }
            }
            _ => {}
        }
    }
}

/// Transport backed by the first platform Bluetooth adapter
pub struct BtleTransport {
    state: Arc<BtleState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BtleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(TransportError::NoAdapter);
        }
        let adapter = adapters.remove(0);
        info!("Using Bluetooth adapter: {}", adapter.adapter_info().await?);

        Ok(Self {
            state: Arc::new(BtleState {
                adapter,
                peripherals: RwLock::new(HashMap::new()),
                scan: Mutex::new(None),
                links: Mutex::new(HashMap::new()),
                notification_tasks: Mutex::new(HashMap::new()),
            }),
            listener: Mutex::new(None),
        })
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral, TransportError> {
        if let Some(peripheral) = self.state.peripherals.read().await.get(device_id) {
            return Ok(peripheral.clone());
        }
        for peripheral in self.state.adapter.peripherals().await? {
            if peripheral_key(&peripheral.id()) == device_id {
                self.state
                    .peripherals
                    .write()
                    .await
                    .insert(device_id.to_string(), peripheral.clone());
                return Ok(peripheral);
            }
        }
        Err(TransportError::DeviceNotFound(device_id.to_string()))
    }

    async fn characteristic(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(Peripheral, Characteristic), TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        if !peripheral.is_connected().await? {
            return Err(TransportError::NotConnected(device_id.to_string()));
        }
        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or(TransportError::CharacteristicNotFound {
                device_id: device_id.to_string(),
                characteristic,
            })?;
        Ok((peripheral, found))
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() {
            return Ok(());
        }

        let state = self.state.clone();
        *listener = Some(tokio::spawn(async move {
            let mut events = match state.adapter.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to subscribe to adapter events: {}", e);
                    return;
                }
            };
            while let Some(event) = events.next().await {
                state.handle(event).await;
            }
            warn!("Adapter event stream ended");
        }));
        info!("Bluetooth adapter initialized");
        Ok(())
    }

    async fn start_scan(&self, services: &[Uuid], results: ScanSender) -> Result<(), TransportError> {
        *self.state.scan() = Some(results);
        let filter = AdapterScanFilter {
            services: services.to_vec(),
        };
        self.state.adapter.start_scan(filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.state.scan().take();
        self.state.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, device_id: &str, events: EventSender) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;
        self.state.links().insert(device_id.to_string(), events);
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        self.state.stop_notifications(device_id);
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        // Some platforms never report a disconnect we asked for
        if let Some(link) = self.state.links().remove(device_id) {
            let _ = link.send(DeviceEvent::Disconnected {
                device_id: device_id.to_string(),
            });
        }
        Ok(())
    }

    async fn write(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let (peripheral, characteristic) =
            self.characteristic(device_id, service, characteristic).await?;
        peripheral
            .write(&characteristic, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        events: EventSender,
    ) -> Result<(), TransportError> {
        let (peripheral, characteristic) =
            self.characteristic(device_id, service, characteristic).await?;
        peripheral.subscribe(&characteristic).await?;
        let mut stream = peripheral.notifications().await?;

        let id = device_id.to_string();
        let uuid = characteristic.uuid;
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                let event = DeviceEvent::ValueChanged {
                    device_id: id.clone(),
                    value: notification.value,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self
            .state
            .notification_tasks()
            .insert(device_id.to_string(), task)
        {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.state.stop_notifications(device_id);
        let (peripheral, characteristic) =
            self.characteristic(device_id, service, characteristic).await?;
        peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        for (_, task) in self.state.notification_tasks().drain() {
            task.abort();
        }
    }
}

fn peripheral_key(id: &PeripheralId) -> String {
    id.to_string()
}

fn scan_result(device_id: String, properties: &PeripheralProperties) -> ScanResult {
    ScanResult {
        device_id,
        name: properties.local_name.clone(),
        rssi: properties.rssi,
        tx_power: properties.tx_power_level,
    }
}
