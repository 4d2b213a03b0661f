//! Lockmate Wire Protocol
//!
//! This module contains the protocol definitions for talking to the
//! Lockmate controller: characteristic UUIDs, API names, parameter keys and
//! the text frame codec.
//!
//! # Frame Format
//!
//! ```text
//! API=CONFIRM_PASSWORD&PASSWORD=abc123&REQUEST_ID=request-1\n
//! └────── key=value pairs joined by '&', one '\n' terminator ──────┘
//! ```
//!
//! Values are never escaped. Multi-valued fields (the network list) are
//! percent-encoded and comma-joined by the lock before insertion.

use anyhow::Result;
use percent_encoding::percent_decode_str;
use tracing::{trace, warn};
use uuid::Uuid;

/// Lockmate BLE Service UUID
pub const SERVICE_UUID: &str = "ab907856-3412-3412-3412-785634123412";

/// RX Characteristic UUID - the app writes command frames here
pub const RX_CHAR_UUID: &str = "ad907856-3412-3412-3412-785634123412";

/// TX Characteristic UUID - the lock notifies response chunks here
pub const TX_CHAR_UUID: &str = "ac907856-3412-3412-3412-785634123412";

/// [`SERVICE_UUID`] as a typed UUID
pub const SERVICE: Uuid = Uuid::from_u128(0xab907856_3412_3412_3412_785634123412);

/// [`RX_CHAR_UUID`] as a typed UUID
pub const RX_CHAR: Uuid = Uuid::from_u128(0xad907856_3412_3412_3412_785634123412);

/// [`TX_CHAR_UUID`] as a typed UUID
pub const TX_CHAR: Uuid = Uuid::from_u128(0xac907856_3412_3412_3412_785634123412);

/// Frame terminator
pub const FRAME_TERMINATOR: char = '\n';

/// Status value the lock reports for a successful operation
pub const STATUS_SUCCESS: &str = "success";

/// Response key carrying the operation status
pub const STATUS_KEY: &str = "status";

/// Response keys that have carried the network list across firmware versions,
/// in lookup order.
pub const NETWORK_KEYS: &[&str] = &["networks", "NETWORKS", "available_networks"];

/// Operations understood by the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleApi {
    /// Check the pairing password printed on the lock
    ConfirmPassword,
    /// List WiFi networks visible to the lock
    GetAvailableNetworks,
    /// Join a WiFi network
    ConnectToNetwork,
    /// Link a cloud user to the lock
    RequestAuthentication,
}

impl BleApi {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfirmPassword => "CONFIRM_PASSWORD",
            Self::GetAvailableNetworks => "GET_AVAILABLE_NETWORKS",
            Self::ConnectToNetwork => "CONNECT_TO_NETWORK",
            Self::RequestAuthentication => "REQUEST_AUTHENTICATION",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "CONFIRM_PASSWORD" => Some(Self::ConfirmPassword),
            "GET_AVAILABLE_NETWORKS" => Some(Self::GetAvailableNetworks),
            "CONNECT_TO_NETWORK" => Some(Self::ConnectToNetwork),
            "REQUEST_AUTHENTICATION" => Some(Self::RequestAuthentication),
            _ => None,
        }
    }
}

/// Request parameter keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleParam {
    Api,
    Password,
    NetworkSsid,
    NetworkPassword,
    UserId,
    RequestId,
}

impl BleParam {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "API",
            Self::Password => "PASSWORD",
            Self::NetworkSsid => "NETWORK_SSID",
            Self::NetworkPassword => "NETWORK_PASSWORD",
            Self::UserId => "USER_ID",
            Self::RequestId => "REQUEST_ID",
        }
    }
}

/// Insertion-ordered set of frame fields.
///
/// Inserting an existing key replaces its value in place, so a decoded frame
/// with duplicate keys keeps the last value. Equality ignores ordering.
#[derive(Debug, Clone, Default, Eq)]
pub struct Fields {
    entries: Vec<(String, String)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style insert keyed by a protocol parameter
    pub fn with(mut self, param: BleParam, value: impl Into<String>) -> Self {
        self.insert(param.as_str(), value);
        self
    }

    /// Append `other`'s fields, overriding values for keys already present
    pub fn merged(mut self, other: Fields) -> Self {
        for (key, value) in other.entries {
            self.insert(key, value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn param(&self, param: BleParam) -> Option<&str> {
        self.get(param.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for Fields {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

/// Encode fields into a single terminated frame
///
/// No escaping is applied: callers must pre-encode values that could
/// contain `&`, `=` or the terminator.
pub fn encode(fields: &Fields) -> String {
    let mut frame = fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    frame.push(FRAME_TERMINATOR);
    frame
}

/// Decode one complete frame
///
/// Text without any `=` decodes to an empty set of fields. Only the first
/// line is considered; each `&` token is split on its first `=`.
pub fn decode(text: &str) -> Fields {
    if !text.contains('=') {
        trace!("Ignoring frame without fields: {:?}", text);
        return Fields::new();
    }

    let line = text.split(FRAME_TERMINATOR).next().unwrap_or_default();
    let mut fields = Fields::new();
    for token in line.split('&') {
        match token.split_once('=') {
            Some((key, value)) => fields.insert(key, value),
            None => fields.insert(token, ""),
        }
    }
    fields
}

/// Extract the network list from a `GET_AVAILABLE_NETWORKS` response
///
/// The first non-empty alias wins. The whole value is percent-decoded before
/// splitting on commas, then entries are trimmed and empties dropped.
pub fn parse_networks(response: &Fields) -> Vec<String> {
    let raw = NETWORK_KEYS
        .iter()
        .filter_map(|key| response.get(key))
        .find(|value| !value.is_empty());

    let Some(raw) = raw else {
        warn!("No networks field found in response");
        return Vec::new();
    };

    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    decoded
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a UUID string from settings
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid_str.trim())
        .map_err(|e| anyhow::anyhow!("Invalid UUID format {:?}: {}", uuid_str, e))
}
