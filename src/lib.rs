//! Polling engine for networks of Bluetooth Low Energy sensors.
//!
//! Drivers describe which characteristics they need and how fresh the
//! values must be; [`BleNetwork`] merges those requirements per device,
//! polls on a shared schedule, binds devices as discovery finds them and
//! delivers values to each driver in read order.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::driver::{BleDriver, CharacteristicValue, DiscoveredDevice, DiscoveryListener, DriverRef};
pub use domain::models::MacAddress;
pub use domain::monitor::DeviceRegistration;
pub use error::{Error, RadioError, Result};
pub use infrastructure::bluetooth::radio::Radio;
pub use infrastructure::bluetooth::BleNetwork;
