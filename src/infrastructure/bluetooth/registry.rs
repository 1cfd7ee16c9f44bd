//! Registration Registry
//!
//! Top-level map from MAC address to the managed device. The map lock is
//! held only to look up, insert or remove entries; everything done to a
//! device happens under that device's own lock. Each device's effective
//! interval is also published here, so scheduling never has to wait for a
//! device lock held by an in-flight poll.

use crate::domain::managed::ManagedDevice;
use crate::domain::models::MacAddress;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// A managed device behind its per-device lock.
pub type SharedDevice = Arc<tokio::sync::Mutex<ManagedDevice>>;

#[derive(Default)]
pub struct Registry {
    devices: RwLock<HashMap<MacAddress, SharedDevice>>,
    waiting: Mutex<HashSet<MacAddress>>,
    intervals: Mutex<HashMap<MacAddress, Duration>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<MacAddress, SharedDevice>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<MacAddress, SharedDevice>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn waiting_set(&self) -> MutexGuard<'_, HashSet<MacAddress>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn interval_map(&self) -> MutexGuard<'_, HashMap<MacAddress, Duration>> {
        self.intervals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn resolve(&self, address: MacAddress) -> Option<SharedDevice> {
        self.read().get(&address).cloned()
    }

    pub fn contains(&self, address: MacAddress) -> bool {
        self.read().contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the managed addresses, sorted.
    pub fn addresses(&self) -> Vec<MacAddress> {
        let mut addresses: Vec<MacAddress> = self.read().keys().copied().collect();
        addresses.sort();
        addresses
    }

    /// Copy of the entries, so callers can lock devices without the map lock.
    pub fn entries(&self) -> Vec<(MacAddress, SharedDevice)> {
        let mut entries: Vec<(MacAddress, SharedDevice)> = self
            .read()
            .iter()
            .map(|(address, device)| (*address, device.clone()))
            .collect();
        entries.sort_by_key(|(address, _)| *address);
        entries
    }

    /// Existing entry for `address`, or a fresh empty device.
    ///
    /// The entry may have been retired by the time its lock is acquired;
    /// callers check [`ManagedDevice::is_retired`] and retry.
    pub(crate) fn get_or_create(&self, address: MacAddress, adapter: Option<MacAddress>) -> SharedDevice {
        if let Some(device) = self.resolve(address) {
            return device;
        }
        self.write()
            .entry(address)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(ManagedDevice::new(address, adapter))))
            .clone()
    }

    /// Drop `address` from the map and the waiting set if it still maps to `device`.
    pub(crate) fn remove(&self, address: MacAddress, device: &SharedDevice) -> bool {
        let mut devices = self.write();
        let removed = match devices.get(&address) {
            Some(current) if Arc::ptr_eq(current, device) => devices.remove(&address).is_some(),
            _ => false,
        };
        drop(devices);

        if removed {
            self.waiting_set().remove(&address);
            self.interval_map().remove(&address);
        }
        removed
    }

    pub fn mark_waiting(&self, address: MacAddress) {
        self.waiting_set().insert(address);
    }

    /// Remove `address` from the waiting set, returning whether it was there.
    pub fn take_waiting(&self, address: MacAddress) -> bool {
        self.waiting_set().remove(&address)
    }

    pub fn is_waiting(&self, address: MacAddress) -> bool {
        self.waiting_set().contains(&address)
    }

    pub fn waiting(&self) -> Vec<MacAddress> {
        let mut waiting: Vec<MacAddress> = self.waiting_set().iter().copied().collect();
        waiting.sort();
        waiting
    }

    /// Record the effective interval of `address`; callers hold its device lock.
    pub(crate) fn publish_interval(&self, address: MacAddress, interval: Option<Duration>) {
        let mut intervals = self.interval_map();
        match interval {
            Some(interval) => intervals.insert(address, interval),
            None => intervals.remove(&address),
        };
    }

    /// Tightest published interval over all managed devices.
    pub fn minimum_required(&self) -> Option<Duration> {
        self.interval_map().values().copied().min()
    }
}
