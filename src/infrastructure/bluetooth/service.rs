//! Bluetooth Service Module
//!
//! [`BleNetwork`] is the public entry point: drivers register and
//! unregister through it, it owns the registry and the schedule, and it
//! starts and stops the polling, discovery and dispatch workers.

use crate::domain::driver::{DiscoveryListener, DriverId, ListenerId};
use crate::domain::managed::{DeviceSnapshot, ManagedDevice, RegistrationChange};
use crate::domain::models::MacAddress;
use crate::domain::monitor::DeviceRegistration;
use crate::domain::settings::NetworkSettings;
use crate::error::{Error, Result};
use crate::infrastructure::bluetooth::connection::{Connection, ConnectionConfig};
use crate::infrastructure::bluetooth::dispatch::{
    DiscoveryDispatcher, ValueDispatchWorker, ValueDispatcher,
};
use crate::infrastructure::bluetooth::polling::{PollingSchedule, PollingWorker};
use crate::infrastructure::bluetooth::radio::Radio;
use crate::infrastructure::bluetooth::registry::{Registry, SharedDevice};
use crate::infrastructure::bluetooth::scanner::{DiscoveryConfig, DiscoveryControl, DiscoveryWorker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

struct Workers {
    cancel: CancellationToken,
    polling: JoinHandle<()>,
    discovery: JoinHandle<()>,
    values: ValueDispatchWorker,
}

/// Main service coordinating all BLE operations
pub struct BleNetwork {
    settings: NetworkSettings,
    radio: Arc<dyn Radio>,
    registry: Arc<Registry>,
    connection: Connection,
    schedule: Arc<PollingSchedule>,
    listeners: Arc<DiscoveryDispatcher>,
    discovery: Arc<DiscoveryControl>,
    workers: Mutex<Option<Workers>>,
}

impl BleNetwork {
    /// Create a stopped network; settings are validated and frozen here.
    pub fn new(radio: Arc<dyn Radio>, settings: NetworkSettings) -> Result<Self> {
        settings.validate()?;
        let connection = Connection::new(radio.clone(), ConnectionConfig::from_settings(&settings));
        Ok(Self {
            schedule: Arc::new(PollingSchedule::new(&settings)),
            settings,
            radio,
            registry: Arc::new(Registry::new()),
            connection,
            listeners: Arc::new(DiscoveryDispatcher::new()),
            discovery: Arc::new(DiscoveryControl::new()),
            workers: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    /// Spawn the workers. Calling it on a running network does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            debug!("Network already running");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let (values, value_worker) = ValueDispatcher::start(self.settings.value_queue_capacity)?;

        let polling = PollingWorker::new(
            self.registry.clone(),
            self.connection.clone(),
            values,
            self.schedule.subscribe(),
            cancel.child_token(),
        );
        let discovery = DiscoveryWorker::new(
            self.radio.clone(),
            self.registry.clone(),
            self.listeners.clone(),
            self.discovery.clone(),
            DiscoveryConfig::from_settings(&self.settings),
            cancel.child_token(),
        );

        *workers = Some(Workers {
            cancel,
            polling: tokio::spawn(polling.run()),
            discovery: tokio::spawn(discovery.run()),
            values: value_worker,
        });
        info!(
            "BLE network started, sweeping every {:?}",
            self.schedule.current()
        );
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    /// Stop the workers and wait until every queued value has been delivered.
    pub async fn shutdown(&self) {
        let Some(workers) = self.workers.lock().await.take() else {
            return;
        };
        info!("Stopping BLE network...");
        workers.cancel.cancel();

        if let Err(e) = workers.polling.await {
            error!("Polling worker failed: {}", e);
        }
        if let Err(e) = workers.discovery.await {
            error!("Discovery worker failed: {}", e);
        }

        let values = workers.values;
        if let Err(e) = tokio::task::spawn_blocking(move || values.join()).await {
            error!("Value dispatch did not drain: {}", e);
        }
        info!("BLE network stopped");
    }

    /// Merge a registration into the managed tree.
    ///
    /// Registering an equal registration again is a no-op; a different one
    /// for the same driver and device replaces the previous one.
    pub async fn register(&self, registration: DeviceRegistration) -> Result<()> {
        registration.validate()?;
        let address = registration.device();
        let driver = registration.driver_id();

        let change = loop {
            let entry = self.registry.get_or_create(address, registration.adapter());
            let mut device = entry.lock().await;
            if device.is_retired() {
                continue;
            }

            let change = match device.add_registration(registration.clone()) {
                Ok(change) => change,
                Err(e) => {
                    self.prune(address, &entry, &mut device);
                    return Err(e);
                }
            };
            if change == RegistrationChange::Unchanged {
                debug!("{} is already registered on {}", driver, address);
                return Ok(());
            }
            self.registry.publish_interval(address, device.interval());

            if !device.is_attached() && !self.registry.is_waiting(address) {
                if self.connection.attach(&mut device).await {
                    self.registry.take_waiting(address);
                } else {
                    info!("Device {} is waiting for discovery", address);
                    self.registry.mark_waiting(address);
                }
            }
            break change;
        };

        info!("{:?} registration of {} on {}", change, driver, address);
        self.schedule.recompute(&self.registry);
        Ok(())
    }

    /// Withdraw every registration of `driver`. Returns how many devices it left.
    pub async fn unregister(&self, driver: DriverId) -> usize {
        let mut removed = 0;
        for (address, entry) in self.registry.entries() {
            let mut device = entry.lock().await;
            if device.is_retired() || !device.remove_registration(driver) {
                continue;
            }
            removed += 1;
            debug!("Removed registration of {} on {}", driver, address);
            self.registry.publish_interval(address, device.interval());
            self.prune(address, &entry, &mut device);
        }

        if removed > 0 {
            info!("Unregistered {} from {} device(s)", driver, removed);
            self.schedule.recompute(&self.registry);
        }
        removed
    }

    /// Drop a device nobody references; the caller holds its lock.
    fn prune(&self, address: MacAddress, entry: &SharedDevice, device: &mut ManagedDevice) {
        if device.is_unreferenced() {
            device.retire();
            self.registry.remove(address, entry);
            info!("Device {} is no longer managed", address);
        }
    }

    pub fn resolve(&self, address: MacAddress) -> Option<SharedDevice> {
        self.registry.resolve(address)
    }

    pub async fn device_snapshot(&self, address: MacAddress) -> Option<DeviceSnapshot> {
        let entry = self.registry.resolve(address)?;
        let device = entry.lock().await;
        if device.is_retired() {
            return None;
        }
        Some(device.snapshot())
    }

    pub fn managed_addresses(&self) -> Vec<MacAddress> {
        self.registry.addresses()
    }

    pub fn waiting_for_discovery(&self) -> Vec<MacAddress> {
        self.registry.waiting()
    }

    /// Pause the polling worker currently takes between sweeps.
    pub fn sweep_interval(&self) -> Duration {
        self.schedule.current()
    }

    fn managed(&self, address: MacAddress) -> Result<SharedDevice> {
        self.registry
            .resolve(address)
            .ok_or(Error::NotManaged(address))
    }

    /// Read a characteristic outside the polling schedule.
    pub async fn read_value(&self, address: MacAddress, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let entry = self.managed(address)?;
        let mut device = entry.lock().await;
        if device.is_retired() {
            return Err(Error::NotManaged(address));
        }
        self.connection.read(&mut device, service, characteristic).await
    }

    /// Write a characteristic, e.g. to enable a sensor. Returns whether the remote accepted it.
    pub async fn write_value(
        &self,
        address: MacAddress,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<bool> {
        let entry = self.managed(address)?;
        let mut device = entry.lock().await;
        if device.is_retired() {
            return Err(Error::NotManaged(address));
        }
        self.connection
            .write(&mut device, service, characteristic, value)
            .await
    }

    /// Start a discovery attempt now instead of waiting for the next cycle.
    pub fn start_discovery(&self) {
        self.discovery.resume();
    }

    /// End the current discovery cycle early.
    pub fn stop_discovery(&self) {
        self.discovery.halt();
    }

    pub fn add_discovery_listener(&self, listener: Arc<dyn DiscoveryListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_discovery_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

impl Drop for BleNetwork {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.get_mut().as_ref() {
            workers.cancel.cancel();
        }
    }
}
