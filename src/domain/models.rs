use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A peripheral seen during discovery
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub device_id: String,
    pub name: Option<String>,
    /// Signal strength in dBm, when the stack reports it
    pub rssi: Option<i16>,
    pub tx_power: Option<i16>,
}

impl ScanResult {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown Device")
    }
}

/// A lock the app is pairing with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleDevice {
    pub id: String,
    pub name: String,
    /// Pairing password, known once the user has confirmed it
    #[serde(default)]
    pub password: Option<String>,
}

impl BleDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn password_or_empty(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}

impl From<&ScanResult> for BleDevice {
    fn from(result: &ScanResult) -> Self {
        Self::new(result.device_id.clone(), result.display_name())
    }
}

/// Per-device link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Linked, notification subscription not yet settled
    AwaitingNotifications,
    Ready,
}

/// Networks reported by a lock, accumulated across polls
///
/// Names keep the order in which they were first seen; later polls only
/// append names not seen before.
#[derive(Debug, Clone, Default)]
pub struct KnownNetworks {
    names: Vec<String>,
    seen: HashSet<String>,
}

impl KnownNetworks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one poll result, returning how many names were new
    pub fn merge<I, S>(&mut self, names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for name in names {
            let name = name.into();
            if self.seen.insert(name.clone()) {
                self.names.push(name);
                added += 1;
            }
        }
        added
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
