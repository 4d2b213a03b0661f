//! Request Multiplexer
//!
//! Turns the fire-and-forget RX write / TX notify pair into awaitable
//! request/response calls. Every request carries a `REQUEST_ID`; responses are
//! routed back to the waiting caller by that id, in whatever order they come.
//!
//! ```text
//!  send() ──► register pending ──► encode ──► transport.write()
//!                  │                                   │
//!                  ▼                                   ▼
//!        pending: request_id ─► oneshot          (lock replies)
//!                  ▲                                   │
//!                  └──────── route(decoded frame) ◄────┘
//! ```
//!
//! A pending entry leaves the table exactly once: on a matching response, on
//! timeout, on write failure, on device disconnect, or when the caller drops
//! the `send` future.

use crate::infrastructure::bluetooth::error::{BridgeError, BridgeResult};
use crate::infrastructure::bluetooth::protocol::{self, BleParam, Fields};
use crate::infrastructure::bluetooth::transport::Transport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default per-request deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

const REQUEST_ID_PREFIX: &str = "request-";

enum Completion {
    Response(Fields),
    Disconnected,
}

struct PendingRequest {
    device_id: String,
    responder: oneshot::Sender<Completion>,
}

type PendingTable = Mutex<HashMap<String, PendingRequest>>;

/// Removes a pending entry when the owning `send` finishes for any reason
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(self.request_id);
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn lock(pending: &PendingTable) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RequestMultiplexer<T: Transport> {
    transport: Arc<T>,
    service: Uuid,
    rx_characteristic: Uuid,
    next_id: AtomicU64,
    pending: PendingTable,
}

impl<T: Transport> RequestMultiplexer<T> {
    /// Create a multiplexer writing frames to `rx_characteristic` of `service`
    pub fn new(transport: Arc<T>, service: Uuid, rx_characteristic: Uuid) -> Self {
        Self {
            transport,
            service,
            rx_characteristic,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send a request and wait for the response bearing its id
    ///
    /// `REQUEST_ID` is added to `fields` (replacing any caller value). The
    /// returned map is the full decoded response.
    pub async fn send(
        &self,
        device_id: &str,
        mut fields: Fields,
        timeout: Duration,
    ) -> BridgeResult<Fields> {
        let request_id = self.next_request_id();
        fields.insert(BleParam::RequestId.as_str(), request_id.as_str());
        let frame = protocol::encode(&fields);

        let (responder, response) = oneshot::channel();
        lock(&self.pending).insert(
            request_id.clone(),
            PendingRequest {
                device_id: device_id.to_string(),
                responder,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: &request_id,
        };

        let exchange = self.exchange(device_id, &request_id, &frame, response);
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(device_id, request_id = %request_id, "Request timed out");
                Err(BridgeError::Timeout {
                    request_id: request_id.clone(),
                    timeout_ms: millis(timeout),
                })
            }
        }
    }

    async fn exchange(
        &self,
        device_id: &str,
        request_id: &str,
        frame: &str,
        response: oneshot::Receiver<Completion>,
    ) -> BridgeResult<Fields> {
        if let Err(e) = self
            .transport
            .write(device_id, self.service, self.rx_characteristic, frame.as_bytes())
            .await
        {
            error!(device_id, request_id, "Failed to write request: {}", e);
            return Err(BridgeError::Transport(e));
        }
        debug!(device_id, request_id, "Sent request: {:?}", frame.trim_end());

        match response.await {
            Ok(Completion::Response(fields)) => Ok(fields),
            Ok(Completion::Disconnected) | Err(_) => Err(BridgeError::Disconnected {
                device_id: device_id.to_string(),
            }),
        }
    }

    /// Deliver a decoded frame to its waiting caller
    ///
    /// Returns `false` when no request is waiting for the frame's id; such
    /// frames are dropped.
    pub fn route(&self, fields: Fields) -> bool {
        let Some(request_id) = fields.param(BleParam::RequestId).map(str::to_string) else {
            debug!("Dropping frame without request id: {:?}", fields);
            return false;
        };

        let Some(pending) = lock(&self.pending).remove(&request_id) else {
            debug!(request_id = %request_id, "No pending request for ID");
            return false;
        };

        debug!(device_id = %pending.device_id, request_id = %request_id, "Response routed");
        if pending.responder.send(Completion::Response(fields)).is_err() {
            debug!(request_id = %request_id, "Caller stopped waiting before the response");
        }
        true
    }

    /// Reject every request outstanding on `device_id`
    pub fn fail_device(&self, device_id: &str) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.device_id == device_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = failed.len();
        for request in failed {
            let _ = request.responder.send(Completion::Disconnected);
        }
        if count > 0 {
            info!(device_id, count, "Rejected in-flight requests after disconnect");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    fn next_request_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{REQUEST_ID_PREFIX}{n}")
    }
}
