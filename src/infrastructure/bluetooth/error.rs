use crate::infrastructure::bluetooth::transport::TransportError;
use thiserror::Error;

/// Failures surfaced by the request/response bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No matching response arrived before the deadline
    #[error("request {request_id} timed out after {timeout_ms} ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    /// The underlying connect, subscribe or write call failed
    #[error("transport error")]
    Transport(#[from] TransportError),

    /// The link dropped while the request was outstanding
    #[error("device {device_id} disconnected")]
    Disconnected { device_id: String },
}

impl BridgeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
