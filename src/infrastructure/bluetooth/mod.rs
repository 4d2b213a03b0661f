//! Bluetooth Module
//!
//! Provides the BLE request/response bridge to Lockmate smart locks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!     ┌─────────────┬───┴─────────┬──────────────┐
//!     │             │             │              │
//!     ▼             ▼             ▼              ▼
//! ┌─────────┐ ┌────────────┐ ┌─────────────┐ ┌─────────────┐
//! │ Scanner │ │ Connection │ │ Multiplexer │ │ Event pump  │
//! │         │ │            │ │             │ │             │
//! │ - name  │ │ - link     │ │ - ids       │ │ - reassembly│
//! │  filter │ │ - notify   │ │ - timeouts  │ │ - routing   │
//! └────┬────┘ └─────┬──────┘ └──────┬──────┘ └──────┬──────┘
//!      └────────────┴───────┬───────┴───────────────┘
//!                           ▼
//!                 ┌───────────────────┐
//!                 │ Transport (trait) │
//!                 │ btle / simulated  │
//!                 └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, API names and the `key=value&...\n` frame codec
//! - [`reassembler`] - Per-device notification chunk buffering
//! - [`multiplexer`] - Request ids, pending table and deadlines
//! - [`scanner`] - BLE device discovery
//! - [`connection`] - Link setup and notification subscription
//! - [`service`] - Main service coordinator
//! - [`transport`] - The seam to a BLE stack
//! - [`simulated`] - In-memory locks for running without a radio

pub mod connection;
pub mod error;
pub mod multiplexer;
pub mod protocol;
pub mod reassembler;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod transport;

#[cfg(feature = "hardware")]
pub mod btle;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main service for convenience
pub use error::{BridgeError, BridgeResult};
pub use service::BluetoothService;
pub use transport::{DeviceEvent, Transport, TransportError};
