//! Dispatch Module
//!
//! Two delivery paths leave the I/O tasks:
//!
//! - values go through a bounded queue drained by one dedicated thread, so
//!   every driver sees its values in read order;
//! - discovery notifications are handed to the blocking pool, one task per
//!   listener, with no ordering between listeners. Enabled/disabled status
//!   changes still reach each listener in the order they happened.

use crate::domain::driver::{
    CharacteristicValue, DiscoveredDevice, DiscoveryListener, DriverRef, ListenerId,
};
use crate::error::{Error, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// One value addressed to one driver.
struct ValueDispatch {
    driver: DriverRef,
    value: CharacteristicValue,
}

/// Producer side of the ordered value queue.
#[derive(Clone)]
pub struct ValueSender {
    tx: mpsc::Sender<ValueDispatch>,
}

impl ValueSender {
    /// Queue a value, waiting for room when the queue is full.
    pub async fn submit(&self, driver: DriverRef, value: CharacteristicValue) -> Result<()> {
        self.tx
            .send(ValueDispatch { driver, value })
            .await
            .map_err(|_| Error::DispatchClosed)
    }
}

/// Handle to the value dispatch thread.
///
/// The thread exits once every [`ValueSender`] is dropped and the queue is drained.
pub struct ValueDispatchWorker {
    handle: Option<thread::JoinHandle<()>>,
}

impl ValueDispatchWorker {
    /// Block until the queue is drained and the thread has exited.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Value dispatch thread panicked");
            }
        }
    }
}

pub struct ValueDispatcher;

impl ValueDispatcher {
    pub fn start(capacity: usize) -> Result<(ValueSender, ValueDispatchWorker)> {
        let (tx, mut rx) = mpsc::channel::<ValueDispatch>(capacity.max(1));

        let handle = thread::Builder::new()
            .name("ble-value-dispatch".to_string())
            .spawn(move || {
                debug!("Value dispatch thread started");
                while let Some(unit) = rx.blocking_recv() {
                    let driver = unit.driver.id();
                    let delivered =
                        panic::catch_unwind(AssertUnwindSafe(|| unit.driver.deliver(unit.value)));
                    if delivered.is_err() {
                        error!("Driver {} panicked while handling a value", driver);
                    }
                }
                debug!("Value dispatch thread drained");
            })?;

        Ok((
            ValueSender { tx },
            ValueDispatchWorker {
                handle: Some(handle),
            },
        ))
    }
}

/// Pending status changes of one listener and whether a task is draining them.
#[derive(Default)]
struct StatusLane {
    state: Mutex<(VecDeque<bool>, bool)>,
}

impl StatusLane {
    /// Queue `enabled`; returns `true` when the caller must start a drain.
    fn push(&self, enabled: bool) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.0.push_back(enabled);
        !std::mem::replace(&mut state.1, true)
    }

    fn next(&self) -> Option<bool> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let next = state.0.pop_front();
        if next.is_none() {
            state.1 = false;
        }
        next
    }

    fn drain(&self, listener: &dyn DiscoveryListener) {
        while let Some(enabled) = self.next() {
            let notified =
                panic::catch_unwind(AssertUnwindSafe(|| listener.on_discovery_enabled(enabled)));
            if notified.is_err() {
                error!("Discovery listener panicked on a status change");
            }
        }
    }
}

struct ListenerEntry {
    id: ListenerId,
    listener: Arc<dyn DiscoveryListener>,
    status: Arc<StatusLane>,
}

type ListenerSet = Vec<ListenerEntry>;

/// Fan-out of discovery events to registered listeners.
#[derive(Default)]
pub struct DiscoveryDispatcher {
    listeners: RwLock<ListenerSet>,
    next_id: AtomicU64,
}

impl DiscoveryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn DiscoveryListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ListenerEntry {
                id,
                listener,
                status: Arc::new(StatusLane::default()),
            });
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<(Arc<dyn DiscoveryListener>, Arc<StatusLane>)> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| (entry.listener.clone(), entry.status.clone()))
            .collect()
    }

    /// Notify every listener of a visible device.
    ///
    /// Must be called from within a tokio runtime.
    pub fn discovered(&self, device: &DiscoveredDevice, managed: bool) -> Vec<JoinHandle<()>> {
        self.snapshot()
            .into_iter()
            .map(|(listener, _)| {
                let device = device.clone();
                tokio::task::spawn_blocking(move || listener.on_discovered(&device, managed))
            })
            .collect()
    }

    /// Notify every listener that discovery was switched on or off.
    ///
    /// Returns the drain tasks started by this call; a listener whose
    /// previous changes are still being delivered gets this one from the
    /// running drain.
    pub fn discovery_enabled(&self, enabled: bool) -> Vec<JoinHandle<()>> {
        info!("Discovery {}", if enabled { "enabled" } else { "disabled" });
        self.snapshot()
            .into_iter()
            .filter(|(_, status)| status.push(enabled))
            .map(|(listener, status)| tokio::task::spawn_blocking(move || status.drain(listener.as_ref())))
            .collect()
    }
}
