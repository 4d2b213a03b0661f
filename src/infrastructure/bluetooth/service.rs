//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, connection, the event pump and the
//! request/response operations exposed to the application.

use crate::domain::models::{BleDevice, ScanResult, SessionState};
use crate::infrastructure::bluetooth::{
    connection::{BleConnection, ConnectionConfig, Connections, LinkEvent, LinkSender},
    error::BridgeResult,
    multiplexer::RequestMultiplexer,
    protocol::{self, BleApi, BleParam, Fields, STATUS_KEY, STATUS_SUCCESS},
    reassembler::StreamReassembler,
    scanner::BleScanner,
    transport::{DeviceEvent, Transport},
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService<T: Transport> {
    transport: Arc<T>,
    config: ConnectionConfig,
    connection: BleConnection<T>,
    connections: Connections,
    multiplexer: Arc<RequestMultiplexer<T>>,
    scanner: BleScanner<T>,
    events: LinkSender,
    pump: JoinHandle<()>,
}

impl<T: Transport> BluetoothService<T> {
    /// Create a new Bluetooth service
    ///
    /// Must be called from within a Tokio runtime: the inbound event pump is
    /// spawned here and lives as long as the service.
    pub fn new(transport: Arc<T>, config: ConnectionConfig) -> Self {
        let multiplexer = Arc::new(RequestMultiplexer::new(
            transport.clone(),
            config.service_uuid,
            config.rx_char_uuid,
        ));
        let connections = Connections::new();
        let (events, inbound) = mpsc::unbounded_channel();
        let pump = tokio::spawn(run_event_pump(
            inbound,
            multiplexer.clone(),
            connections.clone(),
        ));

        Self {
            connection: BleConnection::new(transport.clone(), config.clone()),
            scanner: BleScanner::new(transport.clone()),
            transport,
            config,
            connections,
            multiplexer,
            events,
            pump,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Start scanning; matching devices arrive on the returned channel
    pub async fn start_scan(&mut self) -> BridgeResult<mpsc::UnboundedReceiver<ScanResult>> {
        let found = self
            .scanner
            .start(self.config.service_uuid, &self.config.device_name_marker)
            .await?;
        Ok(found)
    }

    /// Stop scanning
    pub async fn stop_scan(&mut self) -> BridgeResult<()> {
        self.scanner.stop().await?;
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Connect to a device and enable its response notifications
    pub async fn connect(&self, device_id: &str) -> BridgeResult<()> {
        self.connection
            .connect(device_id, &self.connections, &self.events)
            .await
    }

    /// Disconnect from a device
    ///
    /// The link is torn down before returning: in-flight requests fail with
    /// `Disconnected` and a following `connect` starts a fresh link. Unknown
    /// devices are a no-op.
    pub async fn disconnect(&self, device_id: &str) -> BridgeResult<()> {
        if self.connections.state(device_id) == SessionState::Disconnected {
            debug!(device_id, "Already disconnected");
            return Ok(());
        }
        if self.connections.notifications_enabled(device_id) {
            if let Err(e) = self
                .transport
                .unsubscribe(device_id, self.config.service_uuid, self.config.tx_char_uuid)
                .await
            {
                warn!(device_id, "Failed to disable notifications: {}", e);
            }
        }
        self.transport.disconnect(device_id).await?;
        // The transport's own disconnect event now belongs to a retired link
        if self.connections.remove(device_id).is_some() {
            self.multiplexer.fail_device(device_id);
        }
        info!(device_id, "Disconnected from device");
        Ok(())
    }

    pub fn state(&self, device_id: &str) -> SessionState {
        self.connections.state(device_id)
    }

    pub fn pending_requests(&self) -> usize {
        self.multiplexer.pending_count()
    }

    /// Send raw fields with an explicit deadline
    pub async fn request(
        &self,
        device_id: &str,
        fields: Fields,
        timeout: Duration,
    ) -> BridgeResult<Fields> {
        self.multiplexer.send(device_id, fields, timeout).await
    }

    async fn call(&self, device_id: &str, api: BleApi, fields: Fields) -> BridgeResult<Fields> {
        let fields = Fields::new().with(BleParam::Api, api.as_str()).merged(fields);
        debug!(device_id, api = api.as_str(), "Calling device");
        self.request(device_id, fields, self.config.request_timeout)
            .await
    }

    /// Check the pairing password; returns the lock's raw status
    pub async fn confirm_pairing_password(
        &self,
        device_id: &str,
        password: &str,
    ) -> BridgeResult<String> {
        let response = self
            .call(
                device_id,
                BleApi::ConfirmPassword,
                Fields::new().with(BleParam::Password, password),
            )
            .await?;
        Ok(response.get(STATUS_KEY).unwrap_or_default().to_string())
    }

    /// Networks the lock can currently see, in the order it reported them
    pub async fn list_networks(&self, device: &BleDevice) -> BridgeResult<Vec<String>> {
        let response = self
            .call(
                &device.id,
                BleApi::GetAvailableNetworks,
                Fields::new().with(BleParam::Password, device.password_or_empty()),
            )
            .await?;
        let networks = protocol::parse_networks(&response);
        debug!(device_id = %device.id, count = networks.len(), "Parsed network list");
        Ok(networks)
    }

    /// Ask the lock to join a WiFi network
    pub async fn join_network(
        &self,
        device: &BleDevice,
        ssid: &str,
        password: &str,
    ) -> BridgeResult<bool> {
        info!(device_id = %device.id, ssid, "Connecting lock to network");
        let response = self
            .call(
                &device.id,
                BleApi::ConnectToNetwork,
                Fields::new()
                    .with(BleParam::Password, device.password_or_empty())
                    .with(BleParam::NetworkSsid, ssid)
                    .with(BleParam::NetworkPassword, password),
            )
            .await?;
        Ok(is_success(&response))
    }

    /// Ask the lock to authenticate a cloud user
    pub async fn request_user_authentication(
        &self,
        device: &BleDevice,
        user_id: &str,
    ) -> BridgeResult<bool> {
        info!(device_id = %device.id, "Requesting user authentication");
        let response = self
            .call(
                &device.id,
                BleApi::RequestAuthentication,
                Fields::new()
                    .with(BleParam::Password, device.password_or_empty())
                    .with(BleParam::UserId, user_id),
            )
            .await?;
        Ok(is_success(&response))
    }
}

impl<T: Transport> Drop for BluetoothService<T> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn is_success(response: &Fields) -> bool {
    response.get(STATUS_KEY) == Some(STATUS_SUCCESS)
}

/// Single consumer of link events: reassembles chunks into frames and routes
/// them, and tears down per-device state on disconnect. Events from a link
/// that is no longer the device's current one are dropped.
async fn run_event_pump<T: Transport>(
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
    multiplexer: Arc<RequestMultiplexer<T>>,
    connections: Connections,
) {
    let mut reassembler = StreamReassembler::new();
    // Link whose bytes each device buffer holds
    let mut buffered: HashMap<String, u64> = HashMap::new();

    while let Some(LinkEvent { generation, event }) = inbound.recv().await {
        match event {
            DeviceEvent::ValueChanged { device_id, value } => {
                if connections.generation(&device_id) != Some(generation) {
                    trace!(device_id = %device_id, generation, "Dropping chunk from a retired link");
                    continue;
                }
                if buffered.insert(device_id.clone(), generation) != Some(generation) {
                    reassembler.clear(&device_id);
                }
                let Some(frame) = reassembler.push(&device_id, &value) else {
                    continue;
                };
                debug!(device_id = %device_id, "Complete message: {:?}", frame.trim_end());
                let fields = protocol::decode(&frame);
                if fields.is_empty() {
                    warn!(device_id = %device_id, "Ignoring malformed frame");
                    continue;
                }
                multiplexer.route(fields);
            }
            DeviceEvent::Disconnected { device_id } => {
                if buffered.get(&device_id) == Some(&generation) {
                    buffered.remove(&device_id);
                    reassembler.clear(&device_id);
                }
                if !connections.remove_link(&device_id, generation) {
                    debug!(device_id = %device_id, generation, "Ignoring disconnect of a retired link");
                    continue;
                }
                info!(device_id = %device_id, "Device disconnected");
                multiplexer.fail_device(&device_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::error::BridgeError;
    use crate::infrastructure::bluetooth::testing::{request_id_of, ScriptedTransport};

    fn new_service(transport: &Arc<ScriptedTransport>) -> BluetoothService<ScriptedTransport> {
        let config = ConnectionConfig {
            notification_grace: Duration::from_millis(1),
            request_timeout: Duration::from_secs(2),
            ..ConnectionConfig::default()
        };
        BluetoothService::new(transport.clone(), config)
    }

    fn lock_device() -> BleDevice {
        BleDevice::new("lock", "Lockmate E203").with_password("abc123")
    }

    /// Answer the latest request with `body`, split into two chunks
    async fn reply(transport: &ScriptedTransport, expected_writes: usize, body: &str) -> String {
        let writes = transport.wait_for_writes(expected_writes).await;
        let (device_id, frame) = writes[expected_writes - 1].clone();
        let response = format!("{body}&REQUEST_ID={}\n", request_id_of(&frame));
        let (head, tail) = response.split_at(response.len() / 2);
        transport.notify(&device_id, head);
        transport.notify(&device_id, tail);
        frame
    }

    #[tokio::test]
    async fn test_connect_subscribes_once() {
        let transport = Arc::new(ScriptedTransport::new());
        let service = new_service(&transport);

        service.connect("lock").await.unwrap();
        assert_eq!(service.state("lock"), SessionState::Ready);
        service.connect("lock").await.unwrap();

        assert_eq!(transport.connects(), 2);
        assert_eq!(transport.subscribes(), 1);
    }

    #[tokio::test]
    async fn test_connect_failures_are_transport_errors() {
        let transport = Arc::new(ScriptedTransport::new());
        let service = new_service(&transport);

        transport.fail_connect(true);
        let err = service.connect("lock").await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(service.state("lock"), SessionState::Disconnected);

        transport.fail_connect(false);
        transport.fail_subscribe(true);
        let err = service.connect("lock").await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(service.state("lock"), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_confirm_pairing_password_over_chunks() {
        let transport = Arc::new(ScriptedTransport::new());
        let service = Arc::new(new_service(&transport));
        service.connect("lock").await.unwrap();

        let call = {
            let service = service.clone();
            tokio::spawn(async move { service.confirm_pairing_password("lock", "abc123").await })
        };

        let frame = reply(&transport, 1, "status=success").await;
        assert!(frame.starts_with("API=CONFIRM_PASSWORD&PASSWORD=abc123&REQUEST_ID="));
        assert_eq!(call.await.unwrap().unwrap(), STATUS_SUCCESS);
        assert_eq!(service.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_list_networks() {
        let transport = Arc::new(ScriptedTransport::new());
        let service = Arc::new(new_service(&transport));
        service.connect("lock").await.unwrap();

        let call = {
            let service = service.clone();
            tokio::spawn(async move { service.list_networks(&lock_device()).await })
        };

        let frame = reply(&transport, 1, "networks=Home%20WiFi,Office%20Net").await;
        assert!(frame.starts_with("API=GET_AVAILABLE_NETWORKS&PASSWORD=abc123&"));
        assert_eq!(call.await.unwrap().unwrap(), vec!["Home WiFi", "Office Net"]);
    }

    #[tokio::test]
    async fn test_join_network_and_authentication_status() {
        let transport = Arc::new(ScriptedTransport::new());
        let service = Arc::new(new_service(&transport));
        service.connect("lock").await.unwrap();

        let join = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .join_network(&lock_device(), "Home WiFi", "hunter2")
                    .await
            })
        };
        let frame = reply(&transport, 1, "status=success").await;
        assert!(frame.contains("NETWORK_SSID=Home WiFi&NETWORK_PASSWORD=hunter2&"));
        assert!(join.await.unwrap().unwrap());

        let auth = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .request_user_authentication(&lock_device(), "user@example.com")
                    .await
            })
        };
        let frame = reply(&transport, 2, "status=failure").await;
        assert!(frame.contains("USER_ID=user@example.com&"));
        assert!(!auth.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_link_drop_rejects_in_flight_requests() {
        let transport = Arc::new(ScriptedTransport::new());
        let service = Arc::new(new_service(&transport));
        service.connect("lock").await.unwrap();

        let mut calls = Vec::new();
        for _ in 0..3 {
            let service = service.clone();
            calls.push(tokio::spawn(async move {
                service.list_networks(&lock_device()).await
            }));
        }
        transport.wait_for_writes(3).await;
        // Half a frame is buffered when the link drops
        transport.notify("lock", "networks=Ho");
        transport.drop_link("lock");

        for call in calls {
            assert!(call.await.unwrap().unwrap_err().is_disconnected());
        }
        assert_eq!(service.pending_requests(), 0);
        assert_eq!(service.state("lock"), SessionState::Disconnected);

        // Reconnecting starts a fresh session with a fresh subscription
        service.connect("lock").await.unwrap();
        assert_eq!(transport.subscribes(), 2);

        let call = {
            let service = service.clone();
            tokio::spawn(async move { service.confirm_pairing_password("lock", "abc123").await })
        };
        let frame = reply(&transport, 4, "status=success").await;
        assert_eq!(request_id_of(&frame), "request-4");
        assert_eq!(call.await.unwrap().unwrap(), STATUS_SUCCESS);
    }

    #[tokio::test]
    async fn test_user_disconnect_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::new());
        let service = new_service(&transport);

        service.disconnect("lock").await.unwrap();
        assert_eq!(transport.disconnects(), 0);

        service.connect("lock").await.unwrap();
        service.disconnect("lock").await.unwrap();
        assert_eq!(transport.unsubscribes(), 1);
        assert_eq!(transport.disconnects(), 1);

        assert_eq!(service.state("lock"), SessionState::Disconnected);
        service.disconnect("lock").await.unwrap();
        assert_eq!(transport.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_right_after_disconnect() {
        let transport = Arc::new(ScriptedTransport::new());
        let service = Arc::new(new_service(&transport));
        service.connect("lock").await.unwrap();

        let in_flight = {
            let service = service.clone();
            tokio::spawn(async move { service.confirm_pairing_password("lock", "abc123").await })
        };
        transport.wait_for_writes(1).await;

        service.disconnect("lock").await.unwrap();
        assert_eq!(service.state("lock"), SessionState::Disconnected);
        assert!(in_flight.await.unwrap().unwrap_err().is_disconnected());
        assert_eq!(service.pending_requests(), 0);

        service.connect("lock").await.unwrap();
        assert_eq!(transport.subscribes(), 2);

        // Let the pump see the old link's disconnect event
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.state("lock"), SessionState::Ready);

        let call = {
            let service = service.clone();
            tokio::spawn(async move { service.confirm_pairing_password("lock", "abc123").await })
        };
        reply(&transport, 2, "status=success").await;
        assert_eq!(call.await.unwrap().unwrap(), STATUS_SUCCESS);
    }

    #[tokio::test]
    async fn test_failed_reconnect_keeps_live_link() {
        let transport = Arc::new(ScriptedTransport::new());
        let service = Arc::new(new_service(&transport));
        service.connect("lock").await.unwrap();

        transport.fail_connect(true);
        let err = service.connect("lock").await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(service.state("lock"), SessionState::Ready);
        transport.fail_connect(false);

        let call = {
            let service = service.clone();
            tokio::spawn(async move { service.confirm_pairing_password("lock", "abc123").await })
        };
        reply(&transport, 1, "status=success").await;
        assert_eq!(call.await.unwrap().unwrap(), STATUS_SUCCESS);
        assert_eq!(transport.subscribes(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_and_malformed_frames_are_dropped() {
        let transport = Arc::new(ScriptedTransport::new());
        let service = Arc::new(new_service(&transport));
        service.connect("lock").await.unwrap();

        let call = {
            let service = service.clone();
            tokio::spawn(async move { service.confirm_pairing_password("lock", "pw").await })
        };
        transport.wait_for_writes(1).await;
        transport.notify("lock", "no fields here\n");
        transport.notify("lock", "status=late&REQUEST_ID=request-77\n");
        let frame = reply(&transport, 1, "status=success").await;
        assert!(frame.contains("PASSWORD=pw"));
        assert_eq!(call.await.unwrap().unwrap(), STATUS_SUCCESS);
    }

    #[tokio::test]
    async fn test_scan_filters_with_configured_marker() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.advertise(vec![
            ScanResult {
                device_id: "a".into(),
                name: Some("Speaker".into()),
                rssi: None,
                tx_power: None,
            },
            ScanResult {
                device_id: "b".into(),
                name: Some("Lockmate H013".into()),
                rssi: Some(-70),
                tx_power: None,
            },
        ]);
        let mut service = new_service(&transport);

        let mut found = service.start_scan().await.unwrap();
        assert_eq!(found.recv().await.unwrap().device_id, "b");
        assert!(service.is_scanning());
        service.stop_scan().await.unwrap();
        assert!(!service.is_scanning());
    }
}
