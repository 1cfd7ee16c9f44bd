//! Radio abstraction
//!
//! The engine never talks to an adapter directly. Everything it needs from
//! the BLE transport goes through [`Radio`]: discovery, connection, GATT
//! resolution and characteristic I/O. Implementations bound their own call
//! latency; the engine only passes the configured timeout and trial count
//! to the resolve calls.

use crate::domain::models::MacAddress;
use crate::error::RadioError;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Low-level device as seen by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub address: MacAddress,
    pub name: String,
    pub rssi: i16,
}

/// Resolved GATT service on a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    pub device: MacAddress,
    pub uuid: Uuid,
    /// Transport-specific attribute handle.
    pub handle: u16,
}

/// Resolved GATT characteristic on a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub device: MacAddress,
    pub service: Uuid,
    pub uuid: Uuid,
    /// Transport-specific attribute handle.
    pub handle: u16,
}

#[async_trait]
pub trait Radio: Send + Sync {
    /// Switch adapter discovery mode on or off.
    async fn set_discovery(&self, enabled: bool) -> Result<(), RadioError>;

    /// Devices currently known to the adapter.
    async fn visible_devices(&self) -> Result<Vec<DeviceHandle>, RadioError>;

    /// Connect to the device, returning whether a connection was established.
    async fn connect(&self, device: &DeviceHandle) -> Result<bool, RadioError>;

    async fn is_connected(&self, device: &DeviceHandle) -> Result<bool, RadioError>;

    /// Look up a device by address, retrying up to `trials` times.
    async fn resolve_device(
        &self,
        address: MacAddress,
        timeout: Duration,
        trials: u32,
    ) -> Result<Option<DeviceHandle>, RadioError>;

    /// Look up a service on a connected device, retrying up to `trials` times.
    async fn resolve_service(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        timeout: Duration,
        trials: u32,
    ) -> Result<Option<ServiceHandle>, RadioError>;

    async fn resolve_characteristic(
        &self,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>, RadioError>;

    async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>, RadioError>;

    /// Write a value, returning whether the remote accepted it.
    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<bool, RadioError>;
}
