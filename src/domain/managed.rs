//! Managed Resource Tree
//!
//! One [`ManagedDevice`] exists per physical device referenced by at least
//! one registration. It owns its services, which own their
//! characteristics; registrations are stored on the device and
//! characteristics only remember *which* driver asked for them and at what
//! interval. Every node carries an effective interval (the tightest interval
//! requested at or below it, `None` when nothing asks for polling) and the
//! instant it was last polled. A parent's last poll is that of its stalest
//! child, so a parent is always due no later than any of its children.
//!
//! ```text
//! ManagedDevice ── registrations: DriverId -> DeviceRegistration
//!   └─ ManagedService (by service UUID)
//!        └─ ManagedCharacteristic (by characteristic UUID)
//!             └─ contributions: DriverId -> requested interval
//! ```

use crate::domain::driver::{DriverId, DriverRef};
use crate::domain::models::MacAddress;
use crate::domain::monitor::DeviceRegistration;
use crate::error::{Error, Result};
use crate::infrastructure::bluetooth::radio::{CharacteristicHandle, DeviceHandle, ServiceHandle};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Whether a node with the given schedule must be polled at `now`.
///
/// Nodes without an interval are never due; nodes never polled are due at once.
pub fn is_due(last_poll: Option<Instant>, interval: Option<Duration>, now: Instant) -> bool {
    match (interval, last_poll) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(interval), Some(last)) => now.saturating_duration_since(last) >= interval,
    }
}

/// Oldest of the given stamps; `None` if any of them was never polled.
fn stalest(polls: impl Iterator<Item = Option<Instant>>) -> Option<Instant> {
    let mut stalest: Option<Instant> = None;
    for poll in polls {
        let poll = poll?;
        stalest = Some(stalest.map_or(poll, |oldest| oldest.min(poll)));
    }
    stalest
}

/// Outcome of merging a registration into a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationChange {
    /// First registration of this driver on the device.
    Added,
    /// The driver re-declared different requirements; the old ones were withdrawn.
    Replaced,
    /// An equal registration was already active; nothing changed.
    Unchanged,
}

#[derive(Debug)]
pub struct ManagedCharacteristic {
    uuid: Uuid,
    interval: Option<Duration>,
    last_poll: Option<Instant>,
    contributions: BTreeMap<DriverId, Duration>,
    low_characteristic: Option<CharacteristicHandle>,
}

impl ManagedCharacteristic {
    fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            interval: None,
            last_poll: None,
            contributions: BTreeMap::new(),
            low_characteristic: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn last_poll(&self) -> Option<Instant> {
        self.last_poll
    }

    pub fn contributors(&self) -> impl Iterator<Item = DriverId> + '_ {
        self.contributions.keys().copied()
    }

    pub fn contribution(&self, driver: DriverId) -> Option<Duration> {
        self.contributions.get(&driver).copied()
    }

    pub fn low_characteristic(&self) -> Option<&CharacteristicHandle> {
        self.low_characteristic.as_ref()
    }

    fn contribute(&mut self, driver: DriverId, interval: Duration) {
        self.contributions.insert(driver, interval);
    }

    fn withdraw(&mut self, driver: DriverId) -> bool {
        self.contributions.remove(&driver).is_some()
    }

    fn refresh(&mut self) {
        self.interval = self.contributions.values().copied().min();
    }
}

#[derive(Debug)]
pub struct ManagedService {
    uuid: Uuid,
    interval: Option<Duration>,
    last_poll: Option<Instant>,
    characteristics: BTreeMap<Uuid, ManagedCharacteristic>,
    low_service: Option<ServiceHandle>,
}

impl ManagedService {
    fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            interval: None,
            last_poll: None,
            characteristics: BTreeMap::new(),
            low_service: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn last_poll(&self) -> Option<Instant> {
        self.last_poll
    }

    pub fn characteristics(&self) -> impl Iterator<Item = &ManagedCharacteristic> {
        self.characteristics.values()
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&ManagedCharacteristic> {
        self.characteristics.get(&uuid)
    }

    fn refresh(&mut self) {
        for characteristic in self.characteristics.values_mut() {
            characteristic.refresh();
        }
        self.interval = self
            .characteristics
            .values()
            .filter_map(ManagedCharacteristic::interval)
            .min();
        self.restamp();
    }

    fn restamp(&mut self) {
        self.last_poll = stalest(self.characteristics.values().map(ManagedCharacteristic::last_poll));
    }
}

#[derive(Debug)]
pub struct ManagedDevice {
    address: MacAddress,
    adapter: Option<MacAddress>,
    interval: Option<Duration>,
    last_poll: Option<Instant>,
    services: BTreeMap<Uuid, ManagedService>,
    registrations: BTreeMap<DriverId, DeviceRegistration>,
    low_device: Option<DeviceHandle>,
    retired: bool,
}

impl ManagedDevice {
    pub fn new(address: MacAddress, adapter: Option<MacAddress>) -> Self {
        Self {
            address,
            adapter,
            interval: None,
            last_poll: None,
            services: BTreeMap::new(),
            registrations: BTreeMap::new(),
            low_device: None,
            retired: false,
        }
    }

    pub fn address(&self) -> MacAddress {
        self.address
    }

    pub fn adapter(&self) -> Option<MacAddress> {
        self.adapter
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn last_poll(&self) -> Option<Instant> {
        self.last_poll
    }

    pub fn services(&self) -> impl Iterator<Item = &ManagedService> {
        self.services.values()
    }

    pub fn service(&self, uuid: Uuid) -> Option<&ManagedService> {
        self.services.get(&uuid)
    }

    pub fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<&ManagedCharacteristic> {
        self.services
            .get(&service)
            .and_then(|s| s.characteristics.get(&characteristic))
    }

    pub fn registrations(&self) -> impl Iterator<Item = &DeviceRegistration> {
        self.registrations.values()
    }

    pub fn has_registration(&self, driver: DriverId) -> bool {
        self.registrations.contains_key(&driver)
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    /// No registration references this device any more.
    pub fn is_unreferenced(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Merge a registration into the tree and re-derive intervals.
    pub fn add_registration(&mut self, registration: DeviceRegistration) -> Result<RegistrationChange> {
        if registration.device() != self.address {
            return Err(Error::InvalidRegistration(format!(
                "registration for {} cannot be merged into device {}",
                registration.device(),
                self.address
            )));
        }

        let driver = registration.driver_id();
        let change = match self.registrations.get(&driver) {
            Some(existing) if *existing == registration => return Ok(RegistrationChange::Unchanged),
            Some(_) => {
                self.withdraw(driver);
                RegistrationChange::Replaced
            }
            None => RegistrationChange::Added,
        };

        if self.adapter.is_none() {
            self.adapter = registration.adapter();
        }

        for service_spec in registration.services() {
            let service = self
                .services
                .entry(service_spec.service())
                .or_insert_with(|| ManagedService::new(service_spec.service()));

            for spec in service_spec.characteristics() {
                service
                    .characteristics
                    .entry(spec.characteristic())
                    .or_insert_with(|| ManagedCharacteristic::new(spec.characteristic()))
                    .contribute(driver, spec.max_interval());
            }
        }

        self.registrations.insert(driver, registration);
        self.refresh_intervals();
        Ok(change)
    }

    /// Withdraw the registration of `driver`, pruning nodes nobody asks for.
    pub fn remove_registration(&mut self, driver: DriverId) -> bool {
        if !self.registrations.contains_key(&driver) {
            return false;
        }
        self.withdraw(driver);
        self.refresh_intervals();
        true
    }

    fn withdraw(&mut self, driver: DriverId) {
        let Some(registration) = self.registrations.remove(&driver) else {
            return;
        };

        for service_spec in registration.services() {
            let Some(service) = self.services.get_mut(&service_spec.service()) else {
                continue;
            };

            for spec in service_spec.characteristics() {
                let uuid = spec.characteristic();
                let unreferenced = match service.characteristics.get_mut(&uuid) {
                    Some(characteristic) => {
                        characteristic.withdraw(driver);
                        characteristic.contributions.is_empty()
                    }
                    None => false,
                };
                if unreferenced {
                    service.characteristics.remove(&uuid);
                }
            }

            if service.characteristics.is_empty() {
                self.services.remove(&service_spec.service());
            }
        }
    }

    /// Recompute every effective interval bottom-up from the contributions.
    fn refresh_intervals(&mut self) {
        for service in self.services.values_mut() {
            service.refresh();
        }
        self.interval = self
            .services
            .values()
            .filter_map(ManagedService::interval)
            .min();
        self.restamp();
    }

    fn restamp(&mut self) {
        self.last_poll = stalest(self.services.values().map(ManagedService::last_poll));
    }

    /// Characteristics that must be read at `now`, as `(service, characteristic)` pairs.
    ///
    /// A level is only descended into when it is due itself. Parents carry
    /// their stalest child's stamp, so this never hides a due child.
    pub fn due_characteristics(&self, now: Instant) -> Vec<(Uuid, Uuid)> {
        if !is_due(self.last_poll, self.interval, now) {
            return Vec::new();
        }

        self.services
            .values()
            .filter(|service| is_due(service.last_poll, service.interval, now))
            .flat_map(|service| {
                service
                    .characteristics
                    .values()
                    .filter(move |c| is_due(c.last_poll, c.interval, now))
                    .map(move |c| (service.uuid, c.uuid))
            })
            .collect()
    }

    /// Stamp a successful read on the characteristic and re-derive the
    /// stamps of the levels above it.
    pub fn record_poll(&mut self, service: Uuid, characteristic: Uuid, now: Instant) {
        let Some(managed_service) = self.services.get_mut(&service) else {
            return;
        };
        let Some(managed_characteristic) = managed_service.characteristics.get_mut(&characteristic)
        else {
            return;
        };

        managed_characteristic.last_poll = Some(now);
        managed_service.restamp();
        self.restamp();
    }

    /// Drivers that asked for the characteristic, in driver order.
    pub fn delivery_targets(&self, service: Uuid, characteristic: Uuid) -> Vec<DriverRef> {
        let Some(managed) = self.characteristic(service, characteristic) else {
            return Vec::new();
        };
        managed
            .contributors()
            .filter_map(|driver| self.registrations.get(&driver))
            .map(|registration| registration.driver().clone())
            .collect()
    }

    pub fn low_device(&self) -> Option<&DeviceHandle> {
        self.low_device.as_ref()
    }

    /// A low-level handle is bound, i.e. the device has been discovered.
    pub fn is_attached(&self) -> bool {
        self.low_device.is_some()
    }

    /// Bind the low-level device; cached GATT handles are dropped if it changed.
    pub fn bind(&mut self, handle: DeviceHandle) {
        if self.low_device.as_ref() != Some(&handle) {
            for service in self.services.values_mut() {
                service.low_service = None;
                for characteristic in service.characteristics.values_mut() {
                    characteristic.low_characteristic = None;
                }
            }
        }
        self.low_device = Some(handle);
    }

    pub fn service_handle(&self, service: Uuid) -> Option<&ServiceHandle> {
        self.services.get(&service).and_then(|s| s.low_service.as_ref())
    }

    pub fn bind_service_handle(&mut self, service: Uuid, handle: ServiceHandle) {
        if let Some(managed) = self.services.get_mut(&service) {
            managed.low_service = Some(handle);
        }
    }

    pub fn characteristic_handle(&self, service: Uuid, characteristic: Uuid) -> Option<&CharacteristicHandle> {
        self.characteristic(service, characteristic)
            .and_then(|c| c.low_characteristic.as_ref())
    }

    pub fn bind_characteristic_handle(&mut self, service: Uuid, characteristic: Uuid, handle: CharacteristicHandle) {
        if let Some(managed) = self
            .services
            .get_mut(&service)
            .and_then(|s| s.characteristics.get_mut(&characteristic))
        {
            managed.low_characteristic = Some(handle);
        }
    }

    pub fn forget_characteristic_handle(&mut self, service: Uuid, characteristic: Uuid) {
        if let Some(managed) = self
            .services
            .get_mut(&service)
            .and_then(|s| s.characteristics.get_mut(&characteristic))
        {
            managed.low_characteristic = None;
        }
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    /// The device was removed from the registry while this lock was awaited.
    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            address: self.address,
            adapter: self.adapter,
            interval: self.interval,
            last_poll: self.last_poll,
            attached: self.is_attached(),
            registrations: self.registrations.keys().copied().collect(),
            services: self
                .services
                .values()
                .map(|service| ServiceSnapshot {
                    uuid: service.uuid,
                    interval: service.interval,
                    last_poll: service.last_poll,
                    characteristics: service
                        .characteristics
                        .values()
                        .map(|c| CharacteristicSnapshot {
                            uuid: c.uuid,
                            interval: c.interval,
                            last_poll: c.last_poll,
                            contributors: c.contributions.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Point-in-time copy of a managed device, detached from its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub address: MacAddress,
    pub adapter: Option<MacAddress>,
    pub interval: Option<Duration>,
    pub last_poll: Option<Instant>,
    pub attached: bool,
    pub registrations: Vec<DriverId>,
    pub services: Vec<ServiceSnapshot>,
}

impl DeviceSnapshot {
    pub fn service(&self, uuid: Uuid) -> Option<&ServiceSnapshot> {
        self.services.iter().find(|s| s.uuid == uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub uuid: Uuid,
    pub interval: Option<Duration>,
    pub last_poll: Option<Instant>,
    pub characteristics: Vec<CharacteristicSnapshot>,
}

impl ServiceSnapshot {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicSnapshot> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicSnapshot {
    pub uuid: Uuid,
    pub interval: Option<Duration>,
    pub last_poll: Option<Instant>,
    pub contributors: BTreeMap<DriverId, Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::driver::{BleDriver, CharacteristicValue};
    use std::sync::Arc;

    struct Nop;

    impl BleDriver for Nop {
        fn on_value(&self, _value: CharacteristicValue) {}
    }

    const S: Uuid = Uuid::from_u128(0x10);
    const S2: Uuid = Uuid::from_u128(0x20);
    const C: Uuid = Uuid::from_u128(0x11);
    const C2: Uuid = Uuid::from_u128(0x12);
    const C3: Uuid = Uuid::from_u128(0x21);

    fn mac() -> MacAddress {
        "00:11:22:33:44:55".parse().unwrap()
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn registration(driver: &DriverRef, specs: &[(Uuid, Uuid, u64)]) -> DeviceRegistration {
        specs
            .iter()
            .fold(DeviceRegistration::builder(mac(), driver.clone()), |b, (s, c, t)| {
                b.monitor(*s, *c, ms(*t))
            })
            .build()
            .unwrap()
    }

    fn handle() -> DeviceHandle {
        DeviceHandle {
            address: mac(),
            name: "dev".to_string(),
            rssi: -60,
        }
    }

    #[test]
    fn test_unbounded_until_contributed() {
        let device = ManagedDevice::new(mac(), None);
        assert_eq!(device.interval(), None);
        assert!(device.due_characteristics(Instant::now()).is_empty());
    }

    #[test]
    fn test_tightest_request_wins_and_loosens_on_removal() {
        let a = DriverRef::new(Arc::new(Nop));
        let b = DriverRef::new(Arc::new(Nop));
        let mut device = ManagedDevice::new(mac(), None);

        device.add_registration(registration(&a, &[(S, C, 2000)])).unwrap();
        assert_eq!(device.interval(), Some(ms(2000)));

        device.add_registration(registration(&b, &[(S, C, 500)])).unwrap();
        assert_eq!(device.characteristic(S, C).unwrap().interval(), Some(ms(500)));
        assert_eq!(device.service(S).unwrap().interval(), Some(ms(500)));
        assert_eq!(device.interval(), Some(ms(500)));

        assert!(device.remove_registration(b.id()));
        assert_eq!(device.characteristic(S, C).unwrap().interval(), Some(ms(2000)));
        assert_eq!(device.service(S).unwrap().interval(), Some(ms(2000)));
        assert_eq!(device.interval(), Some(ms(2000)));
    }

    #[test]
    fn test_intervals_are_minimum_at_every_level() {
        let a = DriverRef::new(Arc::new(Nop));
        let b = DriverRef::new(Arc::new(Nop));
        let mut device = ManagedDevice::new(mac(), None);

        device
            .add_registration(registration(&a, &[(S, C, 3000), (S, C2, 1200), (S2, C3, 9000)]))
            .unwrap();
        device
            .add_registration(registration(&b, &[(S, C, 1500), (S2, C3, 700)]))
            .unwrap();

        for service in device.services() {
            let expected = service.characteristics().filter_map(|c| c.interval()).min();
            assert_eq!(service.interval(), expected);
            for characteristic in service.characteristics() {
                let contributed = [a.id(), b.id()]
                    .iter()
                    .filter_map(|d| characteristic.contribution(*d))
                    .min();
                assert_eq!(characteristic.interval(), contributed);
            }
        }
        assert_eq!(device.service(S).unwrap().interval(), Some(ms(1200)));
        assert_eq!(device.service(S2).unwrap().interval(), Some(ms(700)));
        assert_eq!(device.interval(), Some(ms(700)));

        device.remove_registration(b.id());
        assert_eq!(device.characteristic(S, C).unwrap().interval(), Some(ms(3000)));
        assert_eq!(device.service(S2).unwrap().interval(), Some(ms(9000)));
        assert_eq!(device.interval(), Some(ms(1200)));
    }

    #[test]
    fn test_duplicate_registration_is_noop() {
        let a = DriverRef::new(Arc::new(Nop));
        let mut once = ManagedDevice::new(mac(), None);
        let mut twice = ManagedDevice::new(mac(), None);
        let reg = registration(&a, &[(S, C, 1000), (S2, C3, 4000)]);

        assert_eq!(once.add_registration(reg.clone()).unwrap(), RegistrationChange::Added);
        assert_eq!(twice.add_registration(reg.clone()).unwrap(), RegistrationChange::Added);
        assert_eq!(twice.add_registration(reg).unwrap(), RegistrationChange::Unchanged);

        assert_eq!(once.snapshot(), twice.snapshot());
        assert_eq!(twice.registration_count(), 1);
    }

    #[test]
    fn test_redeclaration_replaces_previous_specs() {
        let a = DriverRef::new(Arc::new(Nop));
        let mut device = ManagedDevice::new(mac(), None);

        device.add_registration(registration(&a, &[(S, C, 500)])).unwrap();
        let change = device
            .add_registration(registration(&a, &[(S2, C3, 3000)]))
            .unwrap();

        assert_eq!(change, RegistrationChange::Replaced);
        assert!(device.service(S).is_none());
        assert_eq!(device.interval(), Some(ms(3000)));
        assert_eq!(device.registration_count(), 1);
    }

    #[test]
    fn test_removal_prunes_unreferenced_nodes() {
        let a = DriverRef::new(Arc::new(Nop));
        let b = DriverRef::new(Arc::new(Nop));
        let mut device = ManagedDevice::new(mac(), None);

        device.add_registration(registration(&a, &[(S, C, 1000)])).unwrap();
        device
            .add_registration(registration(&b, &[(S, C, 1000), (S, C2, 1000), (S2, C3, 1000)]))
            .unwrap();
        device.remove_registration(b.id());

        assert!(device.characteristic(S, C).is_some());
        assert!(device.characteristic(S, C2).is_none());
        assert!(device.service(S2).is_none());
        assert!(!device.is_unreferenced());

        device.remove_registration(a.id());
        assert!(device.is_unreferenced());
        assert_eq!(device.services().count(), 0);
        assert_eq!(device.interval(), None);
        assert!(!device.remove_registration(a.id()));
    }

    #[test]
    fn test_foreign_registration_rejected() {
        let a = DriverRef::new(Arc::new(Nop));
        let other: MacAddress = "AA:AA:AA:AA:AA:AA".parse().unwrap();
        let mut device = ManagedDevice::new(other, None);
        assert!(device
            .add_registration(registration(&a, &[(S, C, 1000)]))
            .is_err());
        assert!(device.is_unreferenced());
    }

    #[test]
    fn test_due_characteristics_respect_every_level() {
        let a = DriverRef::new(Arc::new(Nop));
        let mut device = ManagedDevice::new(mac(), None);
        device
            .add_registration(registration(&a, &[(S, C, 1000), (S, C2, 5000)]))
            .unwrap();

        let start = Instant::now();
        let mut due = device.due_characteristics(start);
        due.sort();
        assert_eq!(due, vec![(S, C), (S, C2)]);

        device.record_poll(S, C, start);
        device.record_poll(S, C2, start);
        assert!(device.due_characteristics(start + ms(999)).is_empty());
        assert_eq!(device.due_characteristics(start + ms(1000)), vec![(S, C)]);
    }

    #[test]
    fn test_record_poll_stamps_parents_with_stalest_child() {
        let a = DriverRef::new(Arc::new(Nop));
        let mut device = ManagedDevice::new(mac(), None);
        device
            .add_registration(registration(&a, &[(S, C, 1000), (S, C2, 1000), (S2, C3, 1000)]))
            .unwrap();

        let start = Instant::now();
        device.record_poll(S, C, start);
        assert_eq!(device.characteristic(S, C).unwrap().last_poll(), Some(start));
        // C2 was never read
        assert_eq!(device.service(S).unwrap().last_poll(), None);
        assert_eq!(device.last_poll(), None);

        device.record_poll(S, C2, start + ms(10));
        assert_eq!(device.service(S).unwrap().last_poll(), Some(start));
        assert_eq!(device.last_poll(), None);

        device.record_poll(S2, C3, start + ms(20));
        assert_eq!(device.last_poll(), Some(start));

        device.record_poll(S, C, start + ms(30));
        assert_eq!(device.service(S).unwrap().last_poll(), Some(start + ms(10)));
        assert_eq!(device.last_poll(), Some(start + ms(10)));
    }

    #[test]
    fn test_sibling_with_non_multiple_interval_is_not_starved() {
        let a = DriverRef::new(Arc::new(Nop));
        let mut device = ManagedDevice::new(mac(), None);
        device
            .add_registration(registration(&a, &[(S, C, 1000), (S, C2, 1500)]))
            .unwrap();

        let start = Instant::now();
        device.record_poll(S, C, start);
        device.record_poll(S, C2, start);
        assert_eq!(device.due_characteristics(start + ms(1000)), vec![(S, C)]);
        device.record_poll(S, C, start + ms(1000));

        assert!(device.due_characteristics(start + ms(1499)).is_empty());
        assert_eq!(device.due_characteristics(start + ms(1500)), vec![(S, C2)]);
    }

    #[test]
    fn test_new_characteristic_is_due_under_polled_service() {
        let a = DriverRef::new(Arc::new(Nop));
        let b = DriverRef::new(Arc::new(Nop));
        let mut device = ManagedDevice::new(mac(), None);
        device.add_registration(registration(&a, &[(S, C, 1000)])).unwrap();

        let start = Instant::now();
        device.record_poll(S, C, start);
        device.add_registration(registration(&b, &[(S, C2, 5000)])).unwrap();

        assert_eq!(device.due_characteristics(start + ms(1)), vec![(S, C2)]);
    }

    #[test]
    fn test_delivery_targets() {
        let a = DriverRef::new(Arc::new(Nop));
        let b = DriverRef::new(Arc::new(Nop));
        let mut device = ManagedDevice::new(mac(), None);
        device.add_registration(registration(&a, &[(S, C, 1000)])).unwrap();
        device
            .add_registration(registration(&b, &[(S, C, 1000), (S, C2, 1000)]))
            .unwrap();

        assert_eq!(device.delivery_targets(S, C), vec![a.clone(), b.clone()]);
        assert_eq!(device.delivery_targets(S, C2), vec![b]);
        assert!(device.delivery_targets(S2, C3).is_empty());
    }

    #[test]
    fn test_rebinding_drops_cached_handles() {
        let a = DriverRef::new(Arc::new(Nop));
        let mut device = ManagedDevice::new(mac(), None);
        device.add_registration(registration(&a, &[(S, C, 1000)])).unwrap();

        device.bind(handle());
        device.bind_service_handle(
            S,
            ServiceHandle {
                device: mac(),
                uuid: S,
                handle: 1,
            },
        );
        device.bind_characteristic_handle(
            S,
            C,
            CharacteristicHandle {
                device: mac(),
                service: S,
                uuid: C,
                handle: 2,
            },
        );
        assert!(device.characteristic_handle(S, C).is_some());

        device.bind(handle());
        assert!(device.characteristic_handle(S, C).is_some());

        device.bind(DeviceHandle {
            rssi: -80,
            ..handle()
        });
        assert!(device.service_handle(S).is_none());
        assert!(device.characteristic_handle(S, C).is_none());
    }

    #[test]
    fn test_is_due() {
        let now = Instant::now();
        assert!(!is_due(None, None, now));
        assert!(is_due(None, Some(ms(10)), now));
        assert!(!is_due(Some(now), Some(ms(10)), now + ms(9)));
        assert!(is_due(Some(now), Some(ms(10)), now + ms(10)));
    }
}
