//! Scripted transport for driving the bridge in unit tests.

use crate::domain::models::ScanResult;
use crate::infrastructure::bluetooth::protocol::{decode, BleParam};
use crate::infrastructure::bluetooth::transport::{
    DeviceEvent, EventSender, ScanSender, Transport, TransportError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct ScriptState {
    writes: Vec<(String, String)>,
    links: HashMap<String, EventSender>,
    subscriptions: HashMap<String, EventSender>,
    scan_sender: Option<ScanSender>,
    advertised: Vec<ScanResult>,
    connects: usize,
    subscribes: usize,
    unsubscribes: usize,
    disconnects: usize,
    stop_scans: usize,
    fail_connect: bool,
    fail_subscribe: bool,
    fail_writes: bool,
}

/// Records every call and lets the test play the lock's side
#[derive(Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state().fail_subscribe = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn advertise(&self, results: Vec<ScanResult>) {
        self.state().advertised = results;
    }

    /// Emit a scan result while a scan is running
    pub fn discover(&self, result: ScanResult) {
        if let Some(sender) = &self.state().scan_sender {
            let _ = sender.send(result);
        }
    }

    pub fn writes(&self) -> Vec<(String, String)> {
        self.state().writes.clone()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn subscribes(&self) -> usize {
        self.state().subscribes
    }

    pub fn unsubscribes(&self) -> usize {
        self.state().unsubscribes
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    pub fn stop_scans(&self) -> usize {
        self.state().stop_scans
    }

    /// Wait until at least `count` frames have been written
    pub async fn wait_for_writes(&self, count: usize) -> Vec<(String, String)> {
        for _ in 0..500 {
            let writes = self.writes();
            if writes.len() >= count {
                return writes;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("expected {count} writes, saw {:?}", self.writes());
    }

    /// Deliver a notification chunk on the subscribed characteristic
    pub fn notify(&self, device_id: &str, chunk: &str) {
        let state = self.state();
        let sender = state
            .subscriptions
            .get(device_id)
            .expect("device is not subscribed");
        let _ = sender.send(DeviceEvent::ValueChanged {
            device_id: device_id.to_string(),
            value: chunk.as_bytes().to_vec(),
        });
    }

    /// Simulate the lock dropping the link
    pub fn drop_link(&self, device_id: &str) {
        let sender = self.state().links.remove(device_id);
        if let Some(sender) = sender {
            let _ = sender.send(DeviceEvent::Disconnected {
                device_id: device_id.to_string(),
            });
        }
    }
}

/// Request id carried by an encoded frame
pub fn request_id_of(frame: &str) -> String {
    decode(frame)
        .param(BleParam::RequestId)
        .expect("frame has no request id")
        .to_string()
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn initialize(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn start_scan(&self, _services: &[Uuid], results: ScanSender) -> Result<(), TransportError> {
        let mut state = self.state();
        for result in state.advertised.clone() {
            let _ = results.send(result);
        }
        state.scan_sender = Some(results);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.scan_sender = None;
        state.stop_scans += 1;
        Ok(())
    }

    async fn connect(&self, device_id: &str, events: EventSender) -> Result<(), TransportError> {
        let mut state = self.state();
        state.connects += 1;
        if state.fail_connect {
            return Err(TransportError::DeviceNotFound(device_id.to_string()));
        }
        state.links.insert(device_id.to_string(), events);
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError> {
        let sender = {
            let mut state = self.state();
            state.disconnects += 1;
            state.subscriptions.remove(device_id);
            state.links.remove(device_id)
        };
        if let Some(sender) = sender {
            let _ = sender.send(DeviceEvent::Disconnected {
                device_id: device_id.to_string(),
            });
        }
        Ok(())
    }

    async fn write(
        &self,
        device_id: &str,
        _service: Uuid,
        _characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(TransportError::Rejected("scripted write failure".into()));
        }
        state
            .writes
            .push((device_id.to_string(), String::from_utf8_lossy(data).into_owned()));
        Ok(())
    }

    async fn subscribe(
        &self,
        device_id: &str,
        _service: Uuid,
        characteristic: Uuid,
        events: EventSender,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        state.subscribes += 1;
        if state.fail_subscribe {
            return Err(TransportError::CharacteristicNotFound {
                device_id: device_id.to_string(),
                characteristic,
            });
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
        let mut state = self.state();
        state.unsubscribes += 1;
        state.subscriptions.remove(device_id);
        Ok(())
    }
}
