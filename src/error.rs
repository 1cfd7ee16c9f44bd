//! Error types for the BLE network engine.

use crate::domain::models::MacAddress;
use thiserror::Error;
use uuid::Uuid;

/// A specialized `Result` type for network operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a [`Radio`](crate::infrastructure::bluetooth::radio::Radio)
/// implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// The adapter is missing, powered off or otherwise unusable.
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// The remote device is not connected.
    #[error("Device {0} is not connected")]
    NotConnected(MacAddress),

    /// A GATT operation did not complete in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Any other transport-level failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors surfaced by the registry and the on-demand read/write API.
#[derive(Error, Debug)]
pub enum Error {
    /// No registration references the given device.
    #[error("Device {0} is not managed by this network, perhaps it was never registered?")]
    NotManaged(MacAddress),

    /// The device is managed but no low-level handle has been bound yet.
    #[error("Device {0} has not been discovered yet, please retry later")]
    NotDiscovered(MacAddress),

    /// The radio refused or failed to connect the device.
    #[error("Unable to connect to device {0}, perhaps it is out-of-range or sleeping")]
    ConnectFailed(MacAddress),

    /// The remote device does not expose the requested service.
    #[error("Service {service} not found on device {device}")]
    ServiceNotFound { device: MacAddress, service: Uuid },

    /// The remote service does not expose the requested characteristic.
    #[error("Characteristic {characteristic} of service {service} not found on device {device}")]
    CharacteristicNotFound {
        device: MacAddress,
        service: Uuid,
        characteristic: Uuid,
    },

    /// A registration was rejected before taking effect.
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    /// A MAC address string could not be parsed.
    #[error("Invalid MAC address: {0}")]
    InvalidAddress(String),

    /// A UUID string could not be parsed.
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    /// Network settings failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The ordered value dispatcher is no longer running.
    #[error("Value dispatcher is closed")]
    DispatchClosed,

    /// A failure reported by the radio.
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    /// A worker thread could not be spawned.
    #[error("Failed to start worker: {0}")]
    Worker(#[from] std::io::Error),
}
