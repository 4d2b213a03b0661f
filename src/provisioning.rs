//! Provisioning Flow
//!
//! Walks a lock through pairing, WiFi setup and user authorization on top of
//! [`BluetoothService`], retrying the steps the firmware is known to flake on.

use crate::domain::models::{BleDevice, KnownNetworks};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::{protocol::STATUS_SUCCESS, BluetoothService, Transport};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Pause between attempts of a retried step
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ProvisionPolicy {
    pub network_poll_interval: Duration,
    pub join_max_attempts: u32,
    pub auth_max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ProvisionPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ProvisionPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            network_poll_interval: Duration::from_millis(settings.network_poll_interval_ms),
            join_max_attempts: settings.join_max_attempts.max(1),
            auth_max_attempts: settings.auth_max_attempts.max(1),
            retry_delay: RETRY_DELAY,
        }
    }
}

pub struct Provisioner<T: Transport> {
    service: Arc<BluetoothService<T>>,
    policy: ProvisionPolicy,
}

impl<T: Transport> Provisioner<T> {
    pub fn new(service: Arc<BluetoothService<T>>, policy: ProvisionPolicy) -> Self {
        Self { service, policy }
    }

    pub fn service(&self) -> &BluetoothService<T> {
        &self.service
    }

    /// Check the pairing password and remember it on the device
    pub async fn confirm_pairing(&self, device: &mut BleDevice, password: &str) -> Result<()> {
        let status = self
            .service
            .confirm_pairing_password(&device.id, password)
            .await
            .with_context(|| format!("Failed to confirm pairing password on {}", device.id))?;
        if status != STATUS_SUCCESS {
            bail!("Wrong pairing password for {} (status: {:?})", device.name, status);
        }
        device.password = Some(password.to_string());
        info!(device_id = %device.id, "Pairing password confirmed");
        Ok(())
    }

    /// Fetch the lock's network list once and merge it into `known`.
    /// Returns how many names were new.
    pub async fn poll_networks(&self, device: &BleDevice, known: &mut KnownNetworks) -> Result<usize> {
        let networks = self
            .service
            .list_networks(device)
            .await
            .with_context(|| format!("Failed to list networks on {}", device.id))?;
        Ok(known.merge(networks))
    }

    /// Poll `rounds` times, one poll interval apart. Failed polls are logged and skipped.
    pub async fn watch_networks(&self, device: &BleDevice, known: &mut KnownNetworks, rounds: usize) {
        for round in 0..rounds {
            if round > 0 {
                tokio::time::sleep(self.policy.network_poll_interval).await;
            }
            match self.poll_networks(device, known).await {
                Ok(added) => info!(device_id = %device.id, added, total = known.len(), "Network list updated"),
                Err(e) => warn!(device_id = %device.id, "Network poll failed: {:#}", e),
            }
        }
    }

    pub async fn join_network(&self, device: &BleDevice, ssid: &str, password: &str) -> Result<()> {
        for attempt in 1..=self.policy.join_max_attempts {
            match self.service.join_network(device, ssid, password).await {
                Ok(true) => {
                    info!(device_id = %device.id, ssid, attempt, "Lock joined network");
                    return Ok(());
                }
                Ok(false) => warn!(device_id = %device.id, ssid, attempt, "Lock refused network"),
                Err(e) => warn!(device_id = %device.id, ssid, attempt, "Join request failed: {}", e),
            }
            if attempt < self.policy.join_max_attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }
        bail!(
            "Joining network {:?} failed after {} attempts",
            ssid,
            self.policy.join_max_attempts
        )
    }

    pub async fn authenticate(&self, device: &BleDevice, user_id: &str) -> Result<()> {
        for attempt in 1..=self.policy.auth_max_attempts {
            match self.service.request_user_authentication(device, user_id).await {
                Ok(true) => {
                    info!(device_id = %device.id, attempt, "User authenticated");
                    return Ok(());
                }
                Ok(false) => warn!(device_id = %device.id, attempt, "Lock rejected user"),
                Err(e) => warn!(device_id = %device.id, attempt, "Authentication request failed: {}", e),
            }
            if attempt < self.policy.auth_max_attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }
        bail!(
            "User authentication failed after {} attempts",
            self.policy.auth_max_attempts
        )
    }

    /// Join the network, then authorize the user
    pub async fn provision(
        &self,
        device: &BleDevice,
        ssid: &str,
        wifi_password: &str,
        user_id: &str,
    ) -> Result<()> {
        self.join_network(device, ssid, wifi_password).await?;
        self.authenticate(device, user_id).await
    }
}
