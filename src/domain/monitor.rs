//! Monitoring requirements declared by drivers
//!
//! A [`DeviceRegistration`] lists, per GATT service, the characteristics a
//! driver wants polled and the longest interval it tolerates between two
//! reads. Registrations are plain values: they name the device by MAC and
//! never point into the managed tree.

use crate::domain::driver::{DriverId, DriverRef};
use crate::domain::models::MacAddress;
use crate::domain::settings::DeviceConfig;
use crate::error::{Error, Result};
use crate::infrastructure::bluetooth::protocol::parse_uuid;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Interest in one characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicMonitorSpec {
    characteristic: Uuid,
    max_interval: Duration,
}

impl CharacteristicMonitorSpec {
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }
}

/// Interest in a set of characteristics of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMonitorSpec {
    service: Uuid,
    characteristics: Vec<CharacteristicMonitorSpec>,
}

impl ServiceMonitorSpec {
    pub fn service(&self) -> Uuid {
        self.service
    }

    pub fn characteristics(&self) -> &[CharacteristicMonitorSpec] {
        &self.characteristics
    }

    pub fn characteristic(&self, characteristic: Uuid) -> Option<&CharacteristicMonitorSpec> {
        self.characteristics
            .iter()
            .find(|spec| spec.characteristic == characteristic)
    }
}

/// Everything one driver instance needs observed on one physical device.
#[derive(Debug, Clone)]
pub struct DeviceRegistration {
    device: MacAddress,
    adapter: Option<MacAddress>,
    driver: DriverRef,
    services: Vec<ServiceMonitorSpec>,
}

impl DeviceRegistration {
    pub fn builder(device: MacAddress, driver: DriverRef) -> RegistrationBuilder {
        RegistrationBuilder {
            registration: DeviceRegistration {
                device,
                adapter: None,
                driver,
                services: Vec::new(),
            },
            error: None,
        }
    }

    /// Build a registration from a declarative device description.
    pub fn from_config(config: &DeviceConfig, driver: DriverRef) -> Result<Self> {
        let device: MacAddress = config.mac.parse()?;
        let mut builder = Self::builder(device, driver);

        if let Some(adapter) = &config.adapter {
            builder = builder.adapter(adapter.parse()?);
        }

        for characteristic in &config.characteristics {
            let service = parse_uuid(&characteristic.service_uuid)?;
            let uuid = parse_uuid(&characteristic.characteristic_uuid)?;
            let millis = characteristic
                .polling_time_ms
                .unwrap_or(config.polling_time_ms);
            builder = builder.monitor(service, uuid, Duration::from_millis(millis));
        }

        builder.build()
    }

    pub fn device(&self) -> MacAddress {
        self.device
    }

    pub fn adapter(&self) -> Option<MacAddress> {
        self.adapter
    }

    pub fn driver(&self) -> &DriverRef {
        &self.driver
    }

    pub fn driver_id(&self) -> DriverId {
        self.driver.id()
    }

    pub fn services(&self) -> &[ServiceMonitorSpec] {
        &self.services
    }

    pub fn service(&self, service: Uuid) -> Option<&ServiceMonitorSpec> {
        self.services.iter().find(|spec| spec.service == service)
    }

    /// Re-time every characteristic of one service, e.g. to poll a
    /// sub-sensor faster than the rest of the device.
    ///
    /// Returns `false` when the registration does not monitor `service`.
    pub fn set_service_interval(&mut self, service: Uuid, interval: Duration) -> Result<bool> {
        check_interval(service, interval)?;
        match self.services.iter_mut().find(|spec| spec.service == service) {
            Some(spec) => {
                for characteristic in &mut spec.characteristics {
                    characteristic.max_interval = interval;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reject registrations that could never be honoured.
    pub fn validate(&self) -> Result<()> {
        for service in &self.services {
            for characteristic in &service.characteristics {
                check_interval(characteristic.characteristic, characteristic.max_interval)?;
            }
        }
        Ok(())
    }
}

impl PartialEq for DeviceRegistration {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device
            && self.adapter == other.adapter
            && self.driver == other.driver
            && self.services == other.services
    }
}

impl Eq for DeviceRegistration {}

fn check_interval(id: Uuid, interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(Error::InvalidRegistration(format!(
            "polling interval for {id} must be positive"
        )));
    }
    Ok(())
}

/// Incremental construction of a [`DeviceRegistration`].
pub struct RegistrationBuilder {
    registration: DeviceRegistration,
    error: Option<Error>,
}

impl RegistrationBuilder {
    pub fn adapter(mut self, adapter: MacAddress) -> Self {
        self.registration.adapter = Some(adapter);
        self
    }

    /// Ask for `characteristic` of `service` to be read at least every `max_interval`.
    ///
    /// A characteristic declared twice keeps its first interval.
    pub fn monitor(mut self, service: Uuid, characteristic: Uuid, max_interval: Duration) -> Self {
        if self.error.is_none() {
            if let Err(e) = check_interval(characteristic, max_interval) {
                self.error = Some(e);
                return self;
            }
        }

        let services = &mut self.registration.services;
        let index = match services.iter().position(|spec| spec.service == service) {
            Some(index) => index,
            None => {
                services.push(ServiceMonitorSpec {
                    service,
                    characteristics: Vec::new(),
                });
                services.len() - 1
            }
        };

        let spec = &mut services[index];
        if spec.characteristic(characteristic).is_some() {
            warn!(
                "Characteristic {} of service {} is already monitored for device {}, keeping the first declaration",
                characteristic, service, self.registration.device
            );
        } else {
            spec.characteristics.push(CharacteristicMonitorSpec {
                characteristic,
                max_interval,
            });
        }
        self
    }

    pub fn build(self) -> Result<DeviceRegistration> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.registration),
        }
    }
}

#[cfg(test)]
impl RegistrationBuilder {
    /// Add a characteristic without checking its interval.
    pub(crate) fn monitor_unchecked(mut self, service: Uuid, characteristic: Uuid, max_interval: Duration) -> Self {
        self.registration.services.push(ServiceMonitorSpec {
            service,
            characteristics: vec![CharacteristicMonitorSpec {
                characteristic,
                max_interval,
            }],
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::driver::{BleDriver, CharacteristicValue};
    use crate::domain::settings::CharacteristicConfig;
    use crate::infrastructure::bluetooth::protocol::{BATTERY_LEVEL_CHAR, BATTERY_SERVICE};
    use std::sync::Arc;

    struct Nop;

    impl BleDriver for Nop {
        fn on_value(&self, _value: CharacteristicValue) {}
    }

    fn driver() -> DriverRef {
        DriverRef::new(Arc::new(Nop))
    }

    fn mac() -> MacAddress {
        "B0:B4:48:C9:4E:01".parse().unwrap()
    }

    fn char_config(service: &str, characteristic: &str, ms: Option<u64>) -> CharacteristicConfig {
        CharacteristicConfig {
            service_uuid: service.to_string(),
            characteristic_uuid: characteristic.to_string(),
            polling_time_ms: ms,
            decoder: None,
        }
    }

    #[test]
    fn test_builder_groups_by_service() {
        let registration = DeviceRegistration::builder(mac(), driver())
            .monitor(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, Duration::from_secs(2))
            .monitor(BATTERY_SERVICE, Uuid::from_u128(7), Duration::from_secs(3))
            .monitor(Uuid::from_u128(1), Uuid::from_u128(2), Duration::from_secs(4))
            .build()
            .unwrap();

        assert_eq!(registration.services().len(), 2);
        let battery = registration.service(BATTERY_SERVICE).unwrap();
        assert_eq!(battery.characteristics().len(), 2);
        assert_eq!(
            battery.characteristic(BATTERY_LEVEL_CHAR).unwrap().max_interval(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_duplicate_characteristic_keeps_first() {
        let registration = DeviceRegistration::builder(mac(), driver())
            .monitor(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, Duration::from_secs(2))
            .monitor(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, Duration::from_millis(10))
            .build()
            .unwrap();

        let battery = registration.service(BATTERY_SERVICE).unwrap();
        assert_eq!(battery.characteristics().len(), 1);
        assert_eq!(battery.characteristics()[0].max_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = DeviceRegistration::builder(mac(), driver())
            .monitor(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, Duration::ZERO)
            .build();
        assert!(matches!(result, Err(Error::InvalidRegistration(_))));
    }

    #[test]
    fn test_set_service_interval() {
        let mut registration = DeviceRegistration::builder(mac(), driver())
            .monitor(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, Duration::from_secs(5))
            .build()
            .unwrap();

        assert!(registration
            .set_service_interval(BATTERY_SERVICE, Duration::from_millis(500))
            .unwrap());
        assert!(!registration
            .set_service_interval(Uuid::from_u128(9), Duration::from_millis(500))
            .unwrap());
        assert!(registration
            .set_service_interval(BATTERY_SERVICE, Duration::ZERO)
            .is_err());

        let spec = registration.service(BATTERY_SERVICE).unwrap();
        assert_eq!(spec.characteristics()[0].max_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_from_config() {
        let config = DeviceConfig {
            name: Some("SensorTag".to_string()),
            mac: "b0:b4:48:c9:4e:01".to_string(),
            adapter: Some("00:1A:7D:DA:71:13".to_string()),
            polling_time_ms: 2000,
            characteristics: vec![
                char_config("180f", "2a19", None),
                char_config(
                    "f000aa80-0451-4000-b000-000000000000",
                    "f000aa81-0451-4000-b000-000000000000",
                    Some(250),
                ),
            ],
        };

        let registration = DeviceRegistration::from_config(&config, driver()).unwrap();
        assert_eq!(registration.device(), mac());
        assert!(registration.adapter().is_some());
        assert_eq!(
            registration
                .service(BATTERY_SERVICE)
                .unwrap()
                .characteristic(BATTERY_LEVEL_CHAR)
                .unwrap()
                .max_interval(),
            Duration::from_millis(2000)
        );
        let movement = parse_uuid("f000aa80-0451-4000-b000-000000000000").unwrap();
        assert_eq!(
            registration.service(movement).unwrap().characteristics()[0].max_interval(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_from_config_rejects_malformed() {
        let mut config = DeviceConfig {
            name: None,
            mac: "not-a-mac".to_string(),
            adapter: None,
            polling_time_ms: 1000,
            characteristics: vec![char_config("180f", "2a19", None)],
        };
        assert!(matches!(
            DeviceRegistration::from_config(&config, driver()),
            Err(Error::InvalidAddress(_))
        ));

        config.mac = "B0:B4:48:C9:4E:01".to_string();
        config.characteristics = vec![char_config("180f", "bogus-uuid", None)];
        assert!(matches!(
            DeviceRegistration::from_config(&config, driver()),
            Err(Error::InvalidUuid(_))
        ));

        config.characteristics = vec![char_config("180f", "2a19", Some(0))];
        assert!(matches!(
            DeviceRegistration::from_config(&config, driver()),
            Err(Error::InvalidRegistration(_))
        ));
    }

    #[test]
    fn test_equality_follows_driver_identity() {
        let shared = driver();
        let a = DeviceRegistration::builder(mac(), shared.clone())
            .monitor(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, Duration::from_secs(1))
            .build()
            .unwrap();
        let b = DeviceRegistration::builder(mac(), shared)
            .monitor(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, Duration::from_secs(1))
            .build()
            .unwrap();
        let c = DeviceRegistration::builder(mac(), driver())
            .monitor(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, Duration::from_secs(1))
            .build()
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
