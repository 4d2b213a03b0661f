//! Lockmate BLE bridge
//!
//! Request/response messaging with Lockmate smart locks over a BLE
//! characteristic pair, plus the provisioning flow built on top of it.

pub mod domain;
pub mod infrastructure;
pub mod provisioning;

pub use domain::models::{BleDevice, KnownNetworks, ScanResult, SessionState};
pub use infrastructure::bluetooth::{BluetoothService, BridgeError, Transport};
pub use provisioning::{ProvisionPolicy, Provisioner};
