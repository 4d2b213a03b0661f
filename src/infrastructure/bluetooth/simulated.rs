//! Simulated Lockmate
//!
//! An in-memory transport that behaves like a lock running the production
//! firmware: it answers the four APIs and sends every response back in
//! MTU-sized notification chunks. Used when no radio is available.

use crate::domain::models::ScanResult;
use crate::infrastructure::bluetooth::protocol::{
    self, BleApi, BleParam, Fields, STATUS_KEY, STATUS_SUCCESS,
};
use crate::infrastructure::bluetooth::transport::{
    DeviceEvent, EventSender, ScanSender, Transport, TransportError,
};
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Default BLE payload size per notification
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// One simulated lock
#[derive(Debug, Clone)]
pub struct SimulatedLock {
    pub device_id: String,
    pub name: String,
    pub pairing_password: String,
    pub networks: Vec<String>,
    /// Password every network accepts; `None` accepts anything non-empty
    pub wifi_password: Option<String>,
}

impl SimulatedLock {
    pub fn new(device_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            pairing_password: "123456".to_string(),
            networks: vec![
                "Home WiFi".to_string(),
                "Office Net".to_string(),
                "Caf\u{e9} 5G".to_string(),
            ],
            wifi_password: None,
        }
    }

    pub fn with_pairing_password(mut self, password: impl Into<String>) -> Self {
        self.pairing_password = password.into();
        self
    }

    pub fn with_networks<I, S>(mut self, networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.networks = networks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_wifi_password(mut self, password: impl Into<String>) -> Self {
        self.wifi_password = Some(password.into());
        self
    }

    fn scan_result(&self) -> ScanResult {
        ScanResult {
            device_id: self.device_id.clone(),
            name: Some(self.name.clone()),
            rssi: Some(-58),
            tx_power: Some(4),
        }
    }
}

#[derive(Default)]
struct SimState {
    links: HashMap<String, EventSender>,
    subscriptions: HashMap<String, EventSender>,
    joined: HashMap<String, String>,
    authorized: HashMap<String, HashSet<String>>,
}

pub struct SimulatedTransport {
    locks: Vec<SimulatedLock>,
    bystanders: Vec<ScanResult>,
    chunk_size: usize,
    latency: Duration,
    state: Mutex<SimState>,
}

impl SimulatedTransport {
    pub fn new(locks: Vec<SimulatedLock>) -> Self {
        Self {
            locks,
            bystanders: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            latency: Duration::from_millis(20),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Two locks and an unrelated peripheral that scans must filter out
    pub fn demo() -> Self {
        Self::new(vec![
            SimulatedLock::new("37219402", "Lockmate E203"),
            SimulatedLock::new("32569403", "Lockmate H013"),
        ])
        .with_bystander(ScanResult {
            device_id: "90410022".to_string(),
            name: Some("JBL Flip 5".to_string()),
            rssi: Some(-71),
            tx_power: None,
        })
    }

    pub fn with_bystander(mut self, result: ScanResult) -> Self {
        self.bystanders.push(result);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Simulate the lock walking out of range
    pub fn drop_link(&self, device_id: &str) {
        let link = {
            let mut state = self.lock_state();
            state.subscriptions.remove(device_id);
            state.links.remove(device_id)
        };
        if let Some(link) = link {
            info!(device_id, "Simulated link lost");
            let _ = link.send(DeviceEvent::Disconnected {
                device_id: device_id.to_string(),
            });
        }
    }

    /// Network the lock joined, if any
    pub fn joined_network(&self, device_id: &str) -> Option<String> {
        self.lock_state().joined.get(device_id).cloned()
    }

    pub fn is_authorized(&self, device_id: &str, user_id: &str) -> bool {
        self.lock_state()
            .authorized
            .get(device_id)
            .is_some_and(|users| users.contains(user_id))
    }

    fn lock_state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, device_id: &str) -> Result<&SimulatedLock, TransportError> {
        self.locks
            .iter()
            .find(|lock| lock.device_id == device_id)
            .ok_or_else(|| TransportError::DeviceNotFound(device_id.to_string()))
    }

    /// Firmware behaviour for one request
    fn respond(&self, lock: &SimulatedLock, request: &Fields) -> Fields {
        let mut response = Fields::new();
        let authorized = request.param(BleParam::Password) == Some(lock.pairing_password.as_str());
        let status = |ok: bool| if ok { STATUS_SUCCESS } else { "failure" };

        match request.param(BleParam::Api).and_then(BleApi::from_wire) {
            Some(BleApi::ConfirmPassword) => {
                response.insert(STATUS_KEY, status(authorized));
            }
            Some(BleApi::GetAvailableNetworks) if authorized => {
                let encoded = lock
                    .networks
                    .iter()
                    .map(|name| utf8_percent_encode(name, NON_ALPHANUMERIC).to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                response.insert("networks", encoded);
            }
            Some(BleApi::ConnectToNetwork) => {
                let ssid = request.param(BleParam::NetworkSsid).unwrap_or_default();
                let password = request.param(BleParam::NetworkPassword).unwrap_or_default();
                let password_ok = match &lock.wifi_password {
                    Some(expected) => password == expected,
                    None => !password.is_empty(),
                };
                let ok = authorized && password_ok && lock.networks.iter().any(|n| n == ssid);
                if ok {
                    self.lock_state()
                        .joined
                        .insert(lock.device_id.clone(), ssid.to_string());
                }
                response.insert(STATUS_KEY, status(ok));
            }
            Some(BleApi::RequestAuthentication) => {
                let user_id = request.param(BleParam::UserId).unwrap_or_default();
                let mut state = self.lock_state();
                let ok = authorized
                    && !user_id.is_empty()
                    && state.joined.contains_key(&lock.device_id);
                if ok {
                    state
                        .authorized
                        .entry(lock.device_id.clone())
                        .or_default()
                        .insert(user_id.to_string());
                }
                response.insert(STATUS_KEY, status(ok));
            }
            Some(BleApi::GetAvailableNetworks) => {
                response.insert(STATUS_KEY, "unauthorized");
            }
            None => {
                response.insert(STATUS_KEY, "unsupported");
            }
        }

        if let Some(request_id) = request.param(BleParam::RequestId) {
            response.insert(BleParam::RequestId.as_str(), request_id);
        }
        response
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        info!("Simulated Bluetooth initialized");
        Ok(())
    }

    async fn start_scan(&self, _services: &[Uuid], results: ScanSender) -> Result<(), TransportError> {
        let advertised: Vec<ScanResult> = self
            .locks
            .iter()
            .map(SimulatedLock::scan_result)
            .chain(self.bystanders.iter().cloned())
            .collect();
        let latency = self.latency;
        tokio::spawn(async move {
            for result in advertised {
                tokio::time::sleep(latency).await;
                if results.send(result).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        debug!("Simulated scan stopped");
        Ok(())
    }

    async fn connect(&self, device_id: &str, events: EventSender) -> Result<(), TransportError> {
        self.find(device_id)?;
        self.lock_state().links.insert(device_id.to_string(), events);
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError> {
        self.drop_link(device_id);
        Ok(())
    }

    async fn write(
        &self,
        device_id: &str,
        _service: Uuid,
        _characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let lock = self.find(device_id)?;
        if !self.lock_state().links.contains_key(device_id) {
            return Err(TransportError::NotConnected(device_id.to_string()));
        }

        let request = protocol::decode(&String::from_utf8_lossy(data));
        let response = protocol::encode(&self.respond(lock, &request));

        // Without a subscription the lock has nowhere to send the answer
        let Some(notify) = self.lock_state().subscriptions.get(device_id).cloned() else {
            return Ok(());
        };

        let chunks: Vec<Vec<u8>> = response
            .as_bytes()
            .chunks(self.chunk_size)
            .map(<[u8]>::to_vec)
            .collect();
        let device_id = device_id.to_string();
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            for value in chunks {
                let event = DeviceEvent::ValueChanged {
                    device_id: device_id.clone(),
                    value,
                };
                if notify.send(event).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        device_id: &str,
        _service: Uuid,
        _characteristic: Uuid,
        events: EventSender,
    ) -> Result<(), TransportError> {
        self.find(device_id)?;
        let mut state = self.lock_state();
        if !state.links.contains_key(device_id) {
            return Err(TransportError::NotConnected(device_id.to_string()));
        }
        state.subscriptions.insert(device_id.to_string(), events);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        device_id: &str,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.lock_state().subscriptions.remove(device_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{BleDevice, SessionState};
    use crate::infrastructure::bluetooth::connection::ConnectionConfig;
    use crate::infrastructure::bluetooth::service::BluetoothService;
    use std::sync::Arc;

    fn service(transport: &Arc<SimulatedTransport>) -> BluetoothService<SimulatedTransport> {
        let config = ConnectionConfig {
            notification_grace: Duration::from_millis(1),
            request_timeout: Duration::from_secs(2),
            ..ConnectionConfig::default()
        };
        BluetoothService::new(transport.clone(), config)
    }

    fn demo() -> Arc<SimulatedTransport> {
        Arc::new(SimulatedTransport::demo().with_latency(Duration::from_millis(1)))
    }

    #[test]
    fn test_firmware_answers() {
        let transport = SimulatedTransport::demo();
        let lock = &transport.locks[0];

        let request = Fields::new()
            .with(BleParam::Api, "CONFIRM_PASSWORD")
            .with(BleParam::Password, "nope")
            .with(BleParam::RequestId, "request-9");
        let response = transport.respond(lock, &request);
        assert_eq!(response.get(STATUS_KEY), Some("failure"));
        assert_eq!(response.param(BleParam::RequestId), Some("request-9"));

        let request = Fields::new()
            .with(BleParam::Api, "GET_AVAILABLE_NETWORKS")
            .with(BleParam::Password, "123456");
        let response = transport.respond(lock, &request);
        assert_eq!(
            protocol::parse_networks(&response),
            vec!["Home WiFi", "Office Net", "Caf\u{e9} 5G"]
        );

        let request = Fields::new().with(BleParam::Api, "SELF_DESTRUCT");
        assert_eq!(
            transport.respond(lock, &request).get(STATUS_KEY),
            Some("unsupported")
        );
    }

    #[tokio::test]
    async fn test_scan_skips_other_peripherals() {
        let transport = demo();
        let mut service = service(&transport);

        let mut found = service.start_scan().await.unwrap();
        let first = found.recv().await.unwrap();
        let second = found.recv().await.unwrap();
        assert_eq!(first.display_name(), "Lockmate E203");
        assert_eq!(second.display_name(), "Lockmate H013");
        service.stop_scan().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_provisioning_over_small_chunks() {
        let transport = Arc::new(
            SimulatedTransport::demo()
                .with_chunk_size(3)
                .with_latency(Duration::from_millis(1)),
        );
        let service = service(&transport);
        let device = BleDevice::new("37219402", "Lockmate E203");

        service.connect(&device.id).await.unwrap();
        assert_eq!(service.state(&device.id), SessionState::Ready);

        assert_eq!(
            service.confirm_pairing_password(&device.id, "000000").await.unwrap(),
            "failure"
        );
        assert_eq!(
            service.confirm_pairing_password(&device.id, "123456").await.unwrap(),
            STATUS_SUCCESS
        );

        let device = device.with_password("123456");
        let networks = service.list_networks(&device).await.unwrap();
        assert_eq!(networks, vec!["Home WiFi", "Office Net", "Caf\u{e9} 5G"]);

        assert!(service
            .join_network(&device, "Caf\u{e9} 5G", "espresso")
            .await
            .unwrap());
        assert_eq!(transport.joined_network(&device.id).as_deref(), Some("Caf\u{e9} 5G"));

        assert!(service
            .request_user_authentication(&device, "user@example.com")
            .await
            .unwrap());
        assert!(transport.is_authorized(&device.id, "user@example.com"));
        assert_eq!(service.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_link_loss_fails_outstanding_request() {
        let transport = Arc::new(
            SimulatedTransport::demo().with_latency(Duration::from_millis(200)),
        );
        let service = Arc::new(service(&transport));
        service.connect("37219402").await.unwrap();

        let call = {
            let service = service.clone();
            tokio::spawn(async move {
                service.confirm_pairing_password("37219402", "123456").await
            })
        };
        while service.pending_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        transport.drop_link("37219402");

        assert!(call.await.unwrap().unwrap_err().is_disconnected());
        assert_eq!(service.state("37219402"), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unknown_device_cannot_connect() {
        let transport = demo();
        let service = service(&transport);
        assert!(service.connect("00000000").await.is_err());
        assert_eq!(service.state("00000000"), SessionState::Disconnected);
    }
}
