//! In-memory radio
//!
//! Scripted peripherals with GATT tables held in memory. Used by the
//! dry-run binary and by the tests; visibility, connectability and read
//! failures can be toggled at any time.

use crate::domain::models::MacAddress;
use crate::domain::settings::DeviceConfig;
use crate::error::{RadioError, Result};
use crate::infrastructure::bluetooth::protocol::parse_uuid;
use crate::infrastructure::bluetooth::radio::{
    CharacteristicHandle, DeviceHandle, Radio, ServiceHandle,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub address: MacAddress,
    pub name: String,
    pub rssi: i16,
    services: BTreeMap<Uuid, BTreeMap<Uuid, Vec<u8>>>,
    /// Every read bumps the value as a little-endian counter.
    counting: bool,
}

impl SimulatedPeripheral {
    pub fn new(address: MacAddress, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            rssi: -60,
            services: BTreeMap::new(),
            counting: false,
        }
    }

    pub fn with_characteristic(mut self, service: Uuid, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.services
            .entry(service)
            .or_default()
            .insert(characteristic, value);
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn counting(mut self) -> Self {
        self.counting = true;
        self
    }

    fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            address: self.address,
            name: self.name.clone(),
            rssi: self.rssi,
        }
    }

    /// Services sit 0x100 handles apart; past the 16-bit range there is no handle.
    fn service_handle(&self, service: Uuid) -> Option<u16> {
        let index = self.services.keys().position(|uuid| *uuid == service)?;
        u16::try_from(index + 1).ok()?.checked_mul(0x100)
    }
}

#[derive(Debug)]
struct PeripheralState {
    peripheral: SimulatedPeripheral,
    visible: bool,
    connectable: bool,
    connected: bool,
}

#[derive(Debug, Default)]
struct State {
    peripherals: HashMap<MacAddress, PeripheralState>,
    discovery_enabled: bool,
    failing_reads: HashSet<(MacAddress, Uuid)>,
    read_delays: HashMap<MacAddress, Duration>,
    reads: HashMap<(MacAddress, Uuid), usize>,
    /// List every visible device twice per call.
    echo_sightings: bool,
}

#[derive(Debug, Default)]
pub struct SimulatedRadio {
    state: Mutex<State>,
    connects: AtomicUsize,
    discovery_switches: AtomicUsize,
}

impl SimulatedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// One visible, counting peripheral per configured device.
    pub fn from_device_configs(devices: &[DeviceConfig]) -> Result<Self> {
        let radio = Self::new();
        for config in devices {
            let address: MacAddress = config.mac.parse()?;
            let name = config
                .name
                .clone()
                .unwrap_or_else(|| format!("Simulated {}", address));
            let mut peripheral = SimulatedPeripheral::new(address, name).counting();
            for characteristic in &config.characteristics {
                peripheral = peripheral.with_characteristic(
                    parse_uuid(&characteristic.service_uuid)?,
                    parse_uuid(&characteristic.characteristic_uuid)?,
                    vec![0, 0],
                );
            }
            radio.add_peripheral(peripheral);
        }
        Ok(radio)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // a panicking test thread must not cascade into every later call
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a peripheral, visible and connectable.
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        self.state().peripherals.insert(
            peripheral.address,
            PeripheralState {
                peripheral,
                visible: true,
                connectable: true,
                connected: false,
            },
        );
    }

    /// Hiding a peripheral also drops its connection.
    pub fn set_visible(&self, address: MacAddress, visible: bool) {
        if let Some(p) = self.state().peripherals.get_mut(&address) {
            p.visible = visible;
            if !visible {
                p.connected = false;
            }
        }
    }

    pub fn set_connectable(&self, address: MacAddress, connectable: bool) {
        if let Some(p) = self.state().peripherals.get_mut(&address) {
            p.connectable = connectable;
            if !connectable {
                p.connected = false;
            }
        }
    }

    pub fn fail_reads(&self, address: MacAddress, characteristic: Uuid, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_reads.insert((address, characteristic));
        } else {
            state.failing_reads.remove(&(address, characteristic));
        }
    }

    /// Make every read on `address` take at least `delay`.
    pub fn set_read_delay(&self, address: MacAddress, delay: Duration) {
        self.state().read_delays.insert(address, delay);
    }

    /// Report each visible device twice per listing, as some adapters do
    /// when advertising and scan-response packets arrive separately.
    pub fn echo_sightings(&self, echo: bool) {
        self.state().echo_sightings = echo;
    }

    pub fn set_value(&self, address: MacAddress, service: Uuid, characteristic: Uuid, value: Vec<u8>) {
        if let Some(slot) = self
            .state()
            .peripherals
            .get_mut(&address)
            .and_then(|p| p.peripheral.services.get_mut(&service))
            .and_then(|s| s.get_mut(&characteristic))
        {
            *slot = value;
        }
    }

    pub fn value(&self, address: MacAddress, service: Uuid, characteristic: Uuid) -> Option<Vec<u8>> {
        self.state()
            .peripherals
            .get(&address)
            .and_then(|p| p.peripheral.services.get(&service))
            .and_then(|s| s.get(&characteristic))
            .cloned()
    }

    /// Read attempts on one characteristic, failed ones included.
    pub fn read_count(&self, address: MacAddress, characteristic: Uuid) -> usize {
        self.state()
            .reads
            .get(&(address, characteristic))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        self.state().reads.values().sum()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn discovery_enabled(&self) -> bool {
        self.state().discovery_enabled
    }

    /// Number of `set_discovery` calls received.
    pub fn discovery_switches(&self) -> usize {
        self.discovery_switches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Radio for SimulatedRadio {
    async fn set_discovery(&self, enabled: bool) -> std::result::Result<(), RadioError> {
        self.discovery_switches.fetch_add(1, Ordering::SeqCst);
        self.state().discovery_enabled = enabled;
        Ok(())
    }

    async fn visible_devices(&self) -> std::result::Result<Vec<DeviceHandle>, RadioError> {
        let state = self.state();
        if !state.discovery_enabled {
            return Ok(Vec::new());
        }
        let mut devices: Vec<DeviceHandle> = state
            .peripherals
            .values()
            .filter(|p| p.visible)
            .map(|p| p.peripheral.handle())
            .collect();
        devices.sort_by_key(|d| d.address);
        if state.echo_sightings {
            devices = devices
                .into_iter()
                .flat_map(|d| [d.clone(), d])
                .collect();
        }
        Ok(devices)
    }

    async fn connect(&self, device: &DeviceHandle) -> std::result::Result<bool, RadioError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        match state.peripherals.get_mut(&device.address) {
            Some(p) if p.visible && p.connectable => {
                p.connected = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_connected(&self, device: &DeviceHandle) -> std::result::Result<bool, RadioError> {
        Ok(self
            .state()
            .peripherals
            .get(&device.address)
            .is_some_and(|p| p.connected))
    }

    async fn resolve_device(
        &self,
        address: MacAddress,
        _timeout: Duration,
        _trials: u32,
    ) -> std::result::Result<Option<DeviceHandle>, RadioError> {
        Ok(self
            .state()
            .peripherals
            .get(&address)
            .filter(|p| p.visible)
            .map(|p| p.peripheral.handle()))
    }

    async fn resolve_service(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        _timeout: Duration,
        _trials: u32,
    ) -> std::result::Result<Option<ServiceHandle>, RadioError> {
        let state = self.state();
        let Some(p) = state.peripherals.get(&device.address) else {
            return Ok(None);
        };
        if !p.connected {
            return Err(RadioError::NotConnected(device.address));
        }
        Ok(p.peripheral.service_handle(service).map(|handle| ServiceHandle {
            device: device.address,
            uuid: service,
            handle,
        }))
    }

    async fn resolve_characteristic(
        &self,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> std::result::Result<Option<CharacteristicHandle>, RadioError> {
        let state = self.state();
        let handle = state
            .peripherals
            .get(&service.device)
            .and_then(|p| p.peripheral.services.get(&service.uuid))
            .and_then(|chars| chars.keys().position(|uuid| *uuid == characteristic))
            .and_then(|index| u16::try_from(index + 1).ok())
            .and_then(|offset| service.handle.checked_add(offset));
        Ok(handle.map(|handle| CharacteristicHandle {
            device: service.device,
            service: service.uuid,
            uuid: characteristic,
            handle,
        }))
    }

    async fn read(&self, characteristic: &CharacteristicHandle) -> std::result::Result<Vec<u8>, RadioError> {
        let key = (characteristic.device, characteristic.uuid);
        let delay = {
            let mut state = self.state();
            *state.reads.entry(key).or_default() += 1;
            state.read_delays.get(&characteristic.device).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();

        if state.failing_reads.contains(&key) {
            return Err(RadioError::Transport(format!(
                "read of {} on {} failed",
                characteristic.uuid, characteristic.device
            )));
        }

        let p = state
            .peripherals
            .get_mut(&characteristic.device)
            .filter(|p| p.connected)
            .ok_or(RadioError::NotConnected(characteristic.device))?;
        let counting = p.peripheral.counting;
        let slot = p
            .peripheral
            .services
            .get_mut(&characteristic.service)
            .and_then(|s| s.get_mut(&characteristic.uuid))
            .ok_or_else(|| RadioError::Transport(format!("no attribute {}", characteristic.handle)))?;

        if counting {
            bump(slot);
        }
        debug!(
            "Simulated read of {} on {}: {:02X?}",
            characteristic.uuid, characteristic.device, slot
        );
        Ok(slot.clone())
    }

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> std::result::Result<bool, RadioError> {
        let mut state = self.state();
        let p = state
            .peripherals
            .get_mut(&characteristic.device)
            .filter(|p| p.connected)
            .ok_or(RadioError::NotConnected(characteristic.device))?;
        match p
            .peripheral
            .services
            .get_mut(&characteristic.service)
            .and_then(|s| s.get_mut(&characteristic.uuid))
        {
            Some(slot) => {
                *slot = value.to_vec();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Increment a little-endian counter in place, wrapping.
fn bump(value: &mut [u8]) {
    for byte in value.iter_mut() {
        let (next, overflow) = byte.overflowing_add(1);
        *byte = next;
        if !overflow {
            break;
        }
    }
}
