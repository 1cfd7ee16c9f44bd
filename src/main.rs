use anyhow::Context;
use ble_network::domain::decoder::{decoder_by_name, DecoderTable, DecodingDriver};
use ble_network::domain::driver::{DiscoveredDevice, DiscoveryListener, DriverRef};
use ble_network::domain::monitor::DeviceRegistration;
use ble_network::domain::settings::{DeviceConfig, SettingsService};
use ble_network::infrastructure::bluetooth::protocol::parse_uuid;
use ble_network::infrastructure::bluetooth::simulated::SimulatedRadio;
use ble_network::infrastructure::bluetooth::BleNetwork;
use ble_network::infrastructure::logging::init_logger;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Logs every discovery event.
struct LoggingListener;

impl DiscoveryListener for LoggingListener {
    fn on_discovered(&self, device: &DiscoveredDevice, managed: bool) {
        info!(
            "Seen {} ({}, RSSI {}){}",
            device.address,
            device.name,
            device.rssi,
            if managed { " [managed]" } else { "" }
        );
    }

    fn on_discovery_enabled(&self, enabled: bool) {
        info!("Adapter is {}", if enabled { "discoverable" } else { "idle" });
    }
}

fn decoding_driver(config: &DeviceConfig) -> DecodingDriver {
    let mut table = DecoderTable::new();
    for characteristic in &config.characteristics {
        let Some(name) = &characteristic.decoder else {
            continue;
        };
        let Ok(uuid) = parse_uuid(&characteristic.characteristic_uuid) else {
            continue;
        };
        match decoder_by_name(name) {
            Some(decoder) => table.insert(uuid, decoder),
            None => warn!("Unknown decoder '{}' for {}, showing raw bytes", name, uuid),
        }
    }

    let label = config.name.clone().unwrap_or_else(|| config.mac.clone());
    DecodingDriver::new(table, move |value, reading| match reading {
        Ok(reading) => info!("[{}] {} = {}", label, value.characteristic, reading),
        Err(e) => warn!("[{}] Could not decode {}: {}", label, value.characteristic, e),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = match std::env::args().nth(1) {
        Some(path) => SettingsService::open(PathBuf::from(path)),
        None => SettingsService::new()?,
    };
    if !settings_service.path().exists() {
        settings_service
            .save()
            .context("Could not write default settings")?;
    }
    let settings = settings_service.get().clone();

    let _log_guard = init_logger(&settings.log_settings)?;
    info!(
        "Starting BLE network dry run with {}",
        settings_service.path().display()
    );

    let radio = Arc::new(SimulatedRadio::from_device_configs(&settings.devices)?);
    let network = BleNetwork::new(radio, settings.network.clone())?;
    network.add_discovery_listener(Arc::new(LoggingListener));

    let mut drivers = Vec::new();
    for config in &settings.devices {
        let driver = DriverRef::new(Arc::new(decoding_driver(config)));
        match DeviceRegistration::from_config(config, driver.clone()) {
            Ok(registration) => {
                network.register(registration).await?;
                drivers.push(driver);
            }
            Err(e) => warn!("Skipping device {}: {}", config.mac, e),
        }
    }
    if drivers.is_empty() {
        warn!(
            "No devices registered, add some to {}",
            settings_service.path().display()
        );
    }

    network.start().await?;
    info!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    for driver in &drivers {
        network.unregister(driver.id()).await;
    }
    network.shutdown().await;
    Ok(())
}
