//! Polling Worker
//!
//! A single task walks every attached device once per sweep, reads the
//! characteristics that are due and stamps the tree under the device lock,
//! then queues the values for their drivers once the lock is released.
//! Between sweeps it sleeps for the shared sweep interval published by
//! [`PollingSchedule`].

use crate::domain::driver::{CharacteristicValue, DriverRef};
use crate::domain::managed::ManagedDevice;
use crate::domain::schedule::{sweep_interval, SweepInterval};
use crate::domain::settings::NetworkSettings;
use crate::error::Error;
use crate::infrastructure::bluetooth::connection::Connection;
use crate::infrastructure::bluetooth::dispatch::ValueSender;
use crate::infrastructure::bluetooth::registry::Registry;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Publishes the sweep interval derived from the registry.
pub struct PollingSchedule {
    floor: Duration,
    jitter_percent: u8,
    sender: watch::Sender<Duration>,
    recompute_lock: Mutex<()>,
}

impl PollingSchedule {
    pub fn new(settings: &NetworkSettings) -> Self {
        let floor = settings.lowest_valid_polling_time();
        let initial = sweep_interval(None, floor, settings.jitter_percent);
        let (sender, _) = watch::channel(initial.interval);
        Self {
            floor,
            jitter_percent: settings.jitter_percent,
            sender,
            recompute_lock: Mutex::new(()),
        }
    }

    /// Re-derive the sweep interval from every managed device and publish it.
    pub fn recompute(&self, registry: &Registry) -> SweepInterval {
        // serialized so a stale result never overwrites a newer one
        let _guard = self.recompute_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let required = registry.minimum_required();
        let sweep = sweep_interval(required, self.floor, self.jitter_percent);
        if sweep.clamped {
            warn!(
                "Required polling interval {:?} is below the lowest valid polling time {:?}, it cannot be honoured",
                required.unwrap_or_default(),
                self.floor
            );
        }
        debug!("Sweep interval is now {:?}", sweep.interval);
        self.sender.send_replace(sweep.interval);
        sweep
    }

    pub fn current(&self) -> Duration {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Duration> {
        self.sender.subscribe()
    }
}

pub struct PollingWorker {
    registry: Arc<Registry>,
    connection: Connection,
    values: ValueSender,
    interval: watch::Receiver<Duration>,
    cancel: CancellationToken,
}

impl PollingWorker {
    pub fn new(
        registry: Arc<Registry>,
        connection: Connection,
        values: ValueSender,
        interval: watch::Receiver<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            connection,
            values,
            interval,
            cancel,
        }
    }

    /// Sweep until cancelled.
    ///
    /// A schedule change cuts the current pause short so newly registered
    /// devices get their first read promptly.
    pub async fn run(mut self) {
        info!("Polling worker started");
        loop {
            self.sweep().await;
            if self.cancel.is_cancelled() {
                break;
            }

            let pause = *self.interval.borrow_and_update();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
                changed = self.interval.changed() => {
                    if changed.is_err() {
                        debug!("Polling schedule dropped");
                        break;
                    }
                }
            }
        }
        info!("Polling worker stopped");
    }

    /// Poll every attached device once. Returns the number of successful reads.
    pub async fn sweep(&self) -> usize {
        let mut reads = 0;
        for address in self.registry.addresses() {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(entry) = self.registry.resolve(address) else {
                continue;
            };

            let deliveries = {
                let mut device = entry.lock().await;
                if device.is_retired() || !device.is_attached() {
                    continue;
                }
                let (polled, deliveries) = self.poll_device(&mut device).await;
                reads += polled;
                deliveries
            };

            // a full queue must not keep the device locked
            for (driver, value) in deliveries {
                let characteristic = value.characteristic;
                if let Err(e) = self.values.submit(driver, value).await {
                    error!("Dropping value of {} on {}: {}", characteristic, address, e);
                }
            }

            tokio::task::yield_now().await;
        }
        reads
    }

    /// Read and stamp what is due. Returns the successful reads and the
    /// values to deliver, in read order.
    async fn poll_device(&self, device: &mut ManagedDevice) -> (usize, Vec<(DriverRef, CharacteristicValue)>) {
        let now = Instant::now();
        let due = device.due_characteristics(now);
        let mut deliveries = Vec::new();
        if due.is_empty() {
            return (0, deliveries);
        }

        let address = device.address();
        let mut reads = 0;
        for (service, characteristic) in due {
            let value = match self.connection.read(device, service, characteristic).await {
                Ok(value) => value,
                Err(e @ Error::ConnectFailed(_)) => {
                    warn!("{}, skipping it this sweep", e);
                    break;
                }
                Err(e) => {
                    warn!(
                        "Failed to read characteristic {} of service {} on {}: {}",
                        characteristic, service, address, e
                    );
                    continue;
                }
            };

            debug!(
                "Read {} bytes from {} / {} on {}",
                value.len(),
                service,
                characteristic,
                address
            );
            for driver in device.delivery_targets(service, characteristic) {
                let unit = CharacteristicValue {
                    device: address,
                    service,
                    characteristic,
                    value: value.clone(),
                };
                deliveries.push((driver, unit));
            }
            device.record_poll(service, characteristic, now);
            reads += 1;
        }
        (reads, deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::driver::{BleDriver, DriverRef};
    use crate::domain::models::MacAddress;
    use crate::domain::monitor::DeviceRegistration;
    use crate::infrastructure::bluetooth::connection::ConnectionConfig;
    use crate::infrastructure::bluetooth::dispatch::{ValueDispatchWorker, ValueDispatcher};
    use crate::infrastructure::bluetooth::protocol::{
        BATTERY_LEVEL_CHAR, BATTERY_SERVICE, DEVICE_NAME_CHAR, GENERIC_ACCESS_SERVICE,
    };
    use crate::infrastructure::bluetooth::simulated::{SimulatedPeripheral, SimulatedRadio};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        values: StdMutex<Vec<CharacteristicValue>>,
    }

    impl BleDriver for Recorder {
        fn on_value(&self, value: CharacteristicValue) {
            self.values.lock().unwrap().push(value);
        }
    }

    fn mac() -> MacAddress {
        "C0:FF:EE:00:00:03".parse().unwrap()
    }

    struct Harness {
        radio: Arc<SimulatedRadio>,
        registry: Arc<Registry>,
        worker: PollingWorker,
        dispatch: ValueDispatchWorker,
        recorder: Arc<Recorder>,
        _schedule: PollingSchedule,
    }

    async fn harness(intervals: &[(uuid::Uuid, uuid::Uuid, u64)], attach: bool) -> Harness {
        let radio = Arc::new(SimulatedRadio::new());
        radio.add_peripheral(
            SimulatedPeripheral::new(mac(), "Tag")
                .with_characteristic(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, vec![77])
                .with_characteristic(GENERIC_ACCESS_SERVICE, DEVICE_NAME_CHAR, b"Tag".to_vec()),
        );
        let connection = Connection::new(radio.clone(), ConnectionConfig::default());
        let registry = Arc::new(Registry::new());
        let recorder = Arc::new(Recorder::default());
        let driver = DriverRef::new(recorder.clone());

        let registration = intervals
            .iter()
            .fold(DeviceRegistration::builder(mac(), driver.clone()), |b, (s, c, ms)| {
                b.monitor(*s, *c, Duration::from_millis(*ms))
            })
            .build()
            .unwrap();
        {
            let entry = registry.get_or_create(mac(), None);
            let mut device = entry.lock().await;
            device.add_registration(registration).unwrap();
            if attach {
                assert!(connection.attach(&mut device).await);
            }
        }

        let (values, dispatch) = ValueDispatcher::start(16).unwrap();
        let schedule = PollingSchedule::new(&NetworkSettings::default());
        let worker = PollingWorker::new(
            registry.clone(),
            connection,
            values,
            schedule.subscribe(),
            CancellationToken::new(),
        );
        Harness {
            radio,
            registry,
            worker,
            dispatch,
            recorder,
            _schedule: schedule,
        }
    }

    impl Harness {
        async fn finish(self) -> Vec<CharacteristicValue> {
            drop(self.worker);
            let dispatch = self.dispatch;
            tokio::task::spawn_blocking(move || dispatch.join()).await.unwrap();
            let values = self.recorder.values.lock().unwrap().clone();
            values
        }
    }

    #[tokio::test]
    async fn test_first_sweep_reads_everything() {
        let h = harness(
            &[
                (BATTERY_SERVICE, BATTERY_LEVEL_CHAR, 60_000),
                (GENERIC_ACCESS_SERVICE, DEVICE_NAME_CHAR, 60_000),
            ],
            true,
        )
        .await;

        assert_eq!(h.worker.sweep().await, 2);
        let values = h.finish().await;
        assert_eq!(values.len(), 2);
        assert!(values
            .iter()
            .any(|v| v.characteristic == BATTERY_LEVEL_CHAR && v.value == vec![77]));
    }

    #[tokio::test]
    async fn test_not_due_is_not_read() {
        let h = harness(&[(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, 60_000)], true).await;

        assert_eq!(h.worker.sweep().await, 1);
        let stamped = {
            let entry = h.registry.resolve(mac()).unwrap();
            let device = entry.lock().await;
            device.characteristic(BATTERY_SERVICE, BATTERY_LEVEL_CHAR).unwrap().last_poll()
        };

        assert_eq!(h.worker.sweep().await, 0);
        assert_eq!(h.radio.read_count(mac(), BATTERY_LEVEL_CHAR), 1);
        {
            let entry = h.registry.resolve(mac()).unwrap();
            let device = entry.lock().await;
            assert_eq!(
                device.characteristic(BATTERY_SERVICE, BATTERY_LEVEL_CHAR).unwrap().last_poll(),
                stamped
            );
        }
        h.finish().await;
    }

    #[tokio::test]
    async fn test_failed_read_is_retried_next_sweep() {
        let h = harness(&[(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, 60_000)], true).await;
        h.radio.fail_reads(mac(), BATTERY_LEVEL_CHAR, true);

        assert_eq!(h.worker.sweep().await, 0);
        {
            let entry = h.registry.resolve(mac()).unwrap();
            let device = entry.lock().await;
            assert_eq!(device.last_poll(), None);
            assert_eq!(
                device.characteristic(BATTERY_SERVICE, BATTERY_LEVEL_CHAR).unwrap().last_poll(),
                None
            );
        }

        h.radio.fail_reads(mac(), BATTERY_LEVEL_CHAR, false);
        assert_eq!(h.worker.sweep().await, 1);
        assert_eq!(h.radio.read_count(mac(), BATTERY_LEVEL_CHAR), 2);
        assert_eq!(h.finish().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_other_characteristics() {
        let h = harness(
            &[
                (BATTERY_SERVICE, BATTERY_LEVEL_CHAR, 60_000),
                (GENERIC_ACCESS_SERVICE, DEVICE_NAME_CHAR, 60_000),
            ],
            true,
        )
        .await;
        h.radio.fail_reads(mac(), BATTERY_LEVEL_CHAR, true);

        assert_eq!(h.worker.sweep().await, 1);
        let values = h.finish().await;
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].characteristic, DEVICE_NAME_CHAR);
    }

    #[tokio::test]
    async fn test_unattached_device_is_skipped() {
        let h = harness(&[(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, 10)], false).await;
        assert_eq!(h.worker.sweep().await, 0);
        assert_eq!(h.radio.total_reads(), 0);
        assert_eq!(h.radio.connect_count(), 0);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_values_reach_driver_in_read_order() {
        let h = harness(&[(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, 1)], true).await;
        for level in 1..=5u8 {
            h.radio.set_value(mac(), BATTERY_SERVICE, BATTERY_LEVEL_CHAR, vec![level]);
            tokio::time::sleep(Duration::from_millis(2)).await;
            assert_eq!(h.worker.sweep().await, 1);
        }
        let values = h.finish().await;
        let levels: Vec<u8> = values.iter().map(|v| v.value[0]).collect();
        assert_eq!(levels, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_schedule_recompute_clamps() {
        let registry = Registry::new();
        let schedule = PollingSchedule::new(&NetworkSettings::default());
        assert_eq!(schedule.current(), Duration::from_millis(500));

        let registration = DeviceRegistration::builder(mac(), DriverRef::new(Arc::new(Recorder::default())))
            .monitor(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, Duration::from_millis(200))
            .build()
            .unwrap();
        {
            let entry = registry.get_or_create(mac(), None);
            let mut device = entry.lock().await;
            device.add_registration(registration).unwrap();
            registry.publish_interval(mac(), device.interval());
        }

        let mut rx = schedule.subscribe();
        let sweep = schedule.recompute(&registry);
        assert!(sweep.clamped);
        assert_eq!(sweep.interval, Duration::from_millis(500));
        assert!(rx.has_changed().unwrap());
    }

    /// Blocks every delivery while the test holds `gate`.
    #[derive(Default)]
    struct GatedDriver {
        gate: StdMutex<()>,
        delivered: StdMutex<usize>,
    }

    impl BleDriver for GatedDriver {
        fn on_value(&self, _value: CharacteristicValue) {
            drop(self.gate.lock().unwrap_or_else(PoisonError::into_inner));
            *self.delivered.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn test_full_value_queue_does_not_hold_device_lock() {
        let radio = Arc::new(SimulatedRadio::new());
        radio.add_peripheral(
            SimulatedPeripheral::new(mac(), "Tag")
                .with_characteristic(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, vec![1])
                .with_characteristic(GENERIC_ACCESS_SERVICE, DEVICE_NAME_CHAR, vec![2]),
        );
        let connection = Connection::new(radio.clone(), ConnectionConfig::default());
        let registry = Arc::new(Registry::new());
        let driver = Arc::new(GatedDriver::default());
        let registration = DeviceRegistration::builder(mac(), DriverRef::new(driver.clone()))
            .monitor(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, Duration::from_millis(1))
            .monitor(GENERIC_ACCESS_SERVICE, DEVICE_NAME_CHAR, Duration::from_millis(1))
            .build()
            .unwrap();
        let entry = registry.get_or_create(mac(), None);
        {
            let mut device = entry.lock().await;
            device.add_registration(registration).unwrap();
            assert!(connection.attach(&mut device).await);
        }

        let (values, dispatch) = ValueDispatcher::start(1).unwrap();
        let schedule = PollingSchedule::new(&NetworkSettings::default());
        let worker = Arc::new(PollingWorker::new(
            registry.clone(),
            connection,
            values,
            schedule.subscribe(),
            CancellationToken::new(),
        ));

        let gate = driver.gate.lock().unwrap();
        // the dispatch thread parks on the first value, the second fills the queue
        assert_eq!(worker.sweep().await, 2);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let sweeping = worker.clone();
        let blocked = tokio::spawn(async move { sweeping.sweep().await });
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while radio.read_count(mac(), DEVICE_NAME_CHAR) < 2 || radio.read_count(mac(), BATTERY_LEVEL_CHAR) < 2 {
            assert!(std::time::Instant::now() < deadline, "second sweep never read");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let locked = tokio::time::timeout(Duration::from_millis(500), entry.lock()).await;
        assert!(locked.is_ok(), "device stayed locked while its values were queued");
        drop(locked);
        assert!(!blocked.is_finished());

        drop(gate);
        assert_eq!(blocked.await.unwrap(), 2);
        drop(worker);
        tokio::task::spawn_blocking(move || dispatch.join()).await.unwrap();
        assert_eq!(*driver.delivered.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness(&[(BATTERY_SERVICE, BATTERY_LEVEL_CHAR, 60_000)], true).await;
        let cancel = h.worker.cancel.clone();
        let Harness {
            worker,
            dispatch,
            radio,
            ..
        } = h;

        let task = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        tokio::task::spawn_blocking(move || dispatch.join()).await.unwrap();
        assert_eq!(radio.read_count(mac(), BATTERY_LEVEL_CHAR), 1);
    }
}
