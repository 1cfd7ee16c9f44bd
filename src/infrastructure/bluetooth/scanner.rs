//! BLE Scanner Module
//!
//! The discovery worker. Every discovery interval it runs one cycle of up
//! to `discovery_trials` attempts; each attempt switches adapter discovery
//! on, lists the visible devices, binds the ones waiting for discovery and
//! notifies the listeners.

use crate::domain::driver::DiscoveredDevice;
use crate::domain::settings::NetworkSettings;
use crate::infrastructure::bluetooth::dispatch::DiscoveryDispatcher;
use crate::infrastructure::bluetooth::radio::{DeviceHandle, Radio};
use crate::infrastructure::bluetooth::registry::Registry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timing of the discovery loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Attempts per cycle
    pub trials: u32,
    /// Pause between cycles
    pub interval: Duration,
    /// Pause between attempts of one cycle
    pub cycling_time: Duration,
}

impl DiscoveryConfig {
    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self {
            trials: settings.discovery_trials,
            interval: settings.discovery_interval(),
            cycling_time: settings.discovery_cycling_time(),
        }
    }
}

/// External control over a running discovery worker.
#[derive(Default)]
pub struct DiscoveryControl {
    resume: Notify,
    halt: Notify,
    halted: AtomicBool,
}

impl DiscoveryControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut the current pause short and run an attempt now.
    ///
    /// A request made while an attempt is in flight is remembered.
    pub fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
        self.resume.notify_one();
    }

    /// End the current cycle; the worker goes back to its inter-cycle pause.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.halt.notify_waiters();
    }

    fn take_halt(&self) -> bool {
        self.halted.swap(false, Ordering::SeqCst)
    }
}

/// BLE Scanner for binding devices waiting for discovery
pub struct DiscoveryWorker {
    radio: Arc<dyn Radio>,
    registry: Arc<Registry>,
    dispatcher: Arc<DiscoveryDispatcher>,
    control: Arc<DiscoveryControl>,
    config: DiscoveryConfig,
    cancel: CancellationToken,
    enabled: bool,
}

impl DiscoveryWorker {
    pub fn new(
        radio: Arc<dyn Radio>,
        registry: Arc<Registry>,
        dispatcher: Arc<DiscoveryDispatcher>,
        control: Arc<DiscoveryControl>,
        config: DiscoveryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            radio,
            registry,
            dispatcher,
            control,
            config,
            cancel,
            enabled: false,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Discovery worker started ({} attempts every {:?})",
            self.config.trials, self.config.interval
        );
        loop {
            self.cycle().await;
            self.set_enabled(false).await;
            if self.cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = self.control.resume.notified() => {
                    info!("Discovery resumed on request");
                }
            }
        }
        info!("Discovery worker stopped");
    }

    async fn cycle(&mut self) {
        // a halt requested between cycles only applies to the cycle it interrupted
        self.control.take_halt();

        for attempt in 1..=self.config.trials {
            if self.cancel.is_cancelled() {
                return;
            }
            debug!("Discovery attempt {}/{}", attempt, self.config.trials);
            self.attempt().await;

            if attempt == self.config.trials {
                break;
            }
            if self.control.take_halt() {
                info!("Discovery halted on request");
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.cycling_time) => {}
                _ = self.control.resume.notified() => {}
                _ = self.control.halt.notified() => {
                    self.control.take_halt();
                    info!("Discovery halted on request");
                    return;
                }
            }
        }
    }

    /// One discovery attempt. Returns the number of devices bound.
    pub async fn attempt(&mut self) -> usize {
        if let Err(e) = self.radio.set_discovery(true).await {
            warn!("Could not enable discovery: {}", e);
            return 0;
        }
        self.mark_enabled(true);

        let devices = match self.radio.visible_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Could not list visible devices: {}", e);
                return 0;
            }
        };

        let mut bound = 0;
        for handle in devices {
            if self.bind_if_waiting(&handle).await {
                bound += 1;
            }

            let managed = self.registry.contains(handle.address);
            let device = DiscoveredDevice {
                name: handle.name,
                address: handle.address,
                rssi: handle.rssi,
            };
            self.dispatcher.discovered(&device, managed);
        }
        bound
    }

    async fn bind_if_waiting(&self, handle: &DeviceHandle) -> bool {
        if !self.registry.take_waiting(handle.address) {
            return false;
        }
        let Some(entry) = self.registry.resolve(handle.address) else {
            return false;
        };

        let mut device = entry.lock().await;
        if device.is_retired() {
            return false;
        }
        info!(
            "Discovered waiting device {} ({}, RSSI {})",
            handle.address, handle.name, handle.rssi
        );
        device.bind(handle.clone());
        true
    }

    async fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        if let Err(e) = self.radio.set_discovery(enabled).await {
            warn!("Could not switch discovery {}: {}", if enabled { "on" } else { "off" }, e);
            return;
        }
        self.mark_enabled(enabled);
    }

    fn mark_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.dispatcher.discovery_enabled(enabled);
        }
    }
}
