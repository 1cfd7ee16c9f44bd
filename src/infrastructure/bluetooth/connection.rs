//! BLE Connection Module
//!
//! Connects managed devices on demand and resolves the GATT handles a read
//! or write needs. Resolved handles are cached on the managed tree so a
//! steady-state poll costs a single radio read.

use crate::domain::managed::ManagedDevice;
use crate::domain::settings::NetworkSettings;
use crate::error::{Error, Result};
use crate::infrastructure::bluetooth::radio::{CharacteristicHandle, DeviceHandle, Radio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Attempts made when resolving a device or service
    pub trials: u32,
    /// Per-attempt timeout handed to the radio
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_settings(&NetworkSettings::default())
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self {
            trials: settings.device_get_trials,
            timeout: settings.device_get_timeout(),
        }
    }
}

/// BLE Connection handler
#[derive(Clone)]
pub struct Connection {
    radio: Arc<dyn Radio>,
    config: ConnectionConfig,
}

impl Connection {
    pub fn new(radio: Arc<dyn Radio>, config: ConnectionConfig) -> Self {
        Self { radio, config }
    }

    /// Try to bind the low-level device right away.
    ///
    /// Returns `false` when the radio does not know the device yet; the
    /// caller then leaves it to discovery.
    pub async fn attach(&self, device: &mut ManagedDevice) -> bool {
        let address = device.address();
        match self
            .radio
            .resolve_device(address, self.config.timeout, self.config.trials)
            .await
        {
            Ok(Some(handle)) => {
                info!("Attached device {} ({})", address, handle.name);
                device.bind(handle);
                true
            }
            Ok(None) => {
                debug!("Device {} not known to the adapter yet", address);
                false
            }
            Err(e) => {
                warn!("Failed to resolve device {}: {}", address, e);
                false
            }
        }
    }

    /// Connect the device unless it already is.
    pub async fn ensure_connected(&self, handle: &DeviceHandle) -> Result<()> {
        if self.radio.is_connected(handle).await? {
            return Ok(());
        }

        info!("Device {} is not connected, connecting...", handle.address);
        if self.radio.connect(handle).await? {
            info!("Device {} connected", handle.address);
            Ok(())
        } else {
            Err(Error::ConnectFailed(handle.address))
        }
    }

    /// Resolve a characteristic handle, using and filling the cache on `device`.
    pub async fn characteristic_handle(
        &self,
        device: &mut ManagedDevice,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle> {
        if let Some(handle) = device.characteristic_handle(service, characteristic) {
            return Ok(handle.clone());
        }

        let address = device.address();
        let low = device
            .low_device()
            .cloned()
            .ok_or(Error::NotDiscovered(address))?;

        let service_handle = match device.service_handle(service) {
            Some(handle) => handle.clone(),
            None => {
                let handle = self
                    .radio
                    .resolve_service(&low, service, self.config.timeout, self.config.trials)
                    .await?
                    .ok_or(Error::ServiceNotFound {
                        device: address,
                        service,
                    })?;
                device.bind_service_handle(service, handle.clone());
                handle
            }
        };

        let handle = self
            .radio
            .resolve_characteristic(&service_handle, characteristic)
            .await?
            .ok_or(Error::CharacteristicNotFound {
                device: address,
                service,
                characteristic,
            })?;
        device.bind_characteristic_handle(service, characteristic, handle.clone());
        Ok(handle)
    }

    /// Connect if needed and read one characteristic.
    ///
    /// A failed read drops the cached handle so the next attempt re-resolves it.
    pub async fn read(
        &self,
        device: &mut ManagedDevice,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        let low = device
            .low_device()
            .cloned()
            .ok_or(Error::NotDiscovered(device.address()))?;
        self.ensure_connected(&low).await?;

        let handle = self
            .characteristic_handle(device, service, characteristic)
            .await?;
        match self.radio.read(&handle).await {
            Ok(value) => Ok(value),
            Err(e) => {
                device.forget_characteristic_handle(service, characteristic);
                Err(e.into())
            }
        }
    }

    /// Connect if needed and write one characteristic.
    ///
    /// Returns whether the remote accepted the value.
    pub async fn write(
        &self,
        device: &mut ManagedDevice,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<bool> {
        let low = device
            .low_device()
            .cloned()
            .ok_or(Error::NotDiscovered(device.address()))?;
        self.ensure_connected(&low).await?;

        let handle = self
            .characteristic_handle(device, service, characteristic)
            .await?;
        match self.radio.write(&handle, value).await {
            Ok(accepted) => Ok(accepted),
            Err(e) => {
                device.forget_characteristic_handle(service, characteristic);
                Err(e.into())
            }
        }
    }
}
