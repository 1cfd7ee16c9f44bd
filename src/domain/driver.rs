//! Driver-facing contract
//!
//! Device drivers receive polled values through [`BleDriver`] and discovery
//! events through [`DiscoveryListener`]. Both are invoked off the I/O tasks.

use crate::domain::models::MacAddress;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one driver instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverId(u64);

impl DriverId {
    /// Allocate a process-unique identifier.
    pub fn next() -> Self {
        Self(NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver-{}", self.0)
    }
}

/// A value read from a monitored characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicValue {
    pub device: MacAddress,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Receives values polled on behalf of a driver instance.
///
/// Calls for one driver arrive in read order, from the value dispatch thread.
pub trait BleDriver: Send + Sync {
    fn on_value(&self, value: CharacteristicValue);
}

/// Shared handle to a driver instance together with its identity.
#[derive(Clone)]
pub struct DriverRef {
    id: DriverId,
    driver: Arc<dyn BleDriver>,
}

impl DriverRef {
    pub fn new(driver: Arc<dyn BleDriver>) -> Self {
        Self {
            id: DriverId::next(),
            driver,
        }
    }

    pub fn id(&self) -> DriverId {
        self.id
    }

    pub fn deliver(&self, value: CharacteristicValue) {
        self.driver.on_value(value);
    }
}

impl PartialEq for DriverRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DriverRef {}

impl fmt::Debug for DriverRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRef").field("id", &self.id).finish()
    }
}

/// A low-level device seen during a discovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: MacAddress,
    pub rssi: i16,
}

/// Observer of discovery activity.
pub trait DiscoveryListener: Send + Sync {
    /// A device is visible; `managed` tells whether any registration references it.
    fn on_discovered(&self, device: &DiscoveredDevice, managed: bool);

    /// Adapter discovery mode was switched on or off.
    fn on_discovery_enabled(&self, enabled: bool);
}

/// Handle returned when a discovery listener is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
