//! Device discovery across every registered transport.
//!
//! A single scan task polls all transports and publishes full snapshots on
//! a watch channel. Each [`DiscoveryStream`] is an independent observer of
//! that channel: dropping one never stops the scan for the others. When the
//! last observer goes away the task idles out, and the next
//! [`DiscoveryService::listen`] starts a fresh one.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::device::{DeviceDescriptor, DeviceId};
use crate::events::{DmkEvent, DmkObserver};
use crate::sync::lock;
use crate::transport::{Transport, TransportError};

/// Full view of visible devices, deduplicated by id and ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceSnapshot {
    /// Build a snapshot; the first descriptor seen for an id wins.
    pub fn from_devices(devices: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        let mut by_id: BTreeMap<DeviceId, DeviceDescriptor> = BTreeMap::new();
        for device in devices {
            by_id.entry(device.id.clone()).or_insert(device);
        }
        Self {
            devices: by_id.into_values().collect(),
        }
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DeviceDescriptor> {
        self.devices
            .binary_search_by(|d| d.id.cmp(id))
            .ok()
            .map(|idx| &self.devices[idx])
    }

    /// Drop devices that already have a session.
    pub fn filter_unconnected(&self, connected: &HashSet<DeviceId>) -> DeviceSnapshot {
        Self {
            devices: self
                .devices
                .iter()
                .filter(|d| !connected.contains(&d.id))
                .cloned()
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl IntoIterator for DeviceSnapshot {
    type Item = DeviceDescriptor;
    type IntoIter = std::vec::IntoIter<DeviceDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.into_iter()
    }
}

type Feed = watch::Sender<Option<DeviceSnapshot>>;

/// Produces live snapshots of reachable devices.
pub struct DiscoveryService {
    transports: Vec<Arc<dyn Transport>>,
    observer: Arc<dyn DmkObserver>,
    poll_interval: Duration,
    feed: Arc<Mutex<Option<Arc<Feed>>>>,
}

impl DiscoveryService {
    pub fn new(
        transports: Vec<Arc<dyn Transport>>,
        observer: Arc<dyn DmkObserver>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transports,
            observer,
            poll_interval,
            feed: Arc::new(Mutex::new(None)),
        }
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    /// Subscribe to snapshots. Must be called from within a tokio runtime.
    ///
    /// The stream is unbounded; use [`DiscoveryStream::with_window`] or
    /// [`DiscoveryService::listen_for`] to time-box it.
    pub fn listen(&self) -> DiscoveryStream {
        let mut slot = lock(&self.feed);
        if let Some(feed) = slot.as_ref() {
            return DiscoveryStream::new(feed.subscribe());
        }

        let (tx, rx) = watch::channel(None);
        let feed = Arc::new(tx);
        *slot = Some(Arc::clone(&feed));
        debug!(transports = self.transports.len(), "Starting discovery scan");
        tokio::spawn(scan_loop(
            self.transports.clone(),
            Arc::clone(&self.observer),
            self.poll_interval,
            feed,
            Arc::clone(&self.feed),
        ));
        DiscoveryStream::new(rx)
    }

    /// Subscribe for a bounded observation window.
    pub fn listen_for(&self, window: Duration) -> DiscoveryStream {
        self.listen().with_window(window)
    }

    /// Enumerate every transport once.
    pub async fn scan_once(&self) -> DeviceSnapshot {
        scan(&self.transports).await
    }

    /// Find the transport that currently lists `device`.
    pub async fn locate(&self, device: &DeviceDescriptor) -> Result<Arc<dyn Transport>, TransportError> {
        let mut candidates = self
            .transports
            .iter()
            .filter(|t| t.kind() == device.transport)
            .peekable();
        if candidates.peek().is_none() {
            return Err(TransportError::Unsupported(device.transport));
        }
        let mut last_error = None;
        for transport in candidates {
            match transport.enumerate().await {
                Ok(devices) if devices.iter().any(|d| d.id == device.id) => return Ok(Arc::clone(transport)),
                Ok(_) => {}
                Err(e) => {
                    warn!(transport = %transport.kind(), error = %e, "Enumeration failed while locating {}", device.id);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| TransportError::DeviceNotFound(device.id.clone())))
    }

    /// Whether `device` is currently listed by its transport.
    pub async fn is_visible(&self, device: &DeviceDescriptor) -> bool {
        self.locate(device).await.is_ok()
    }
}

async fn scan(transports: &[Arc<dyn Transport>]) -> DeviceSnapshot {
    let mut found = Vec::new();
    for transport in transports {
        match transport.enumerate().await {
            Ok(devices) => found.extend(devices),
            Err(e) => warn!(transport = %transport.kind(), error = %e, "Enumeration failed"),
        }
    }
    DeviceSnapshot::from_devices(found)
}

async fn scan_loop(
    transports: Vec<Arc<dyn Transport>>,
    observer: Arc<dyn DmkObserver>,
    poll_interval: Duration,
    feed: Arc<Feed>,
    slot: Arc<Mutex<Option<Arc<Feed>>>>,
) {
    loop {
        let snapshot = scan(&transports).await;
        let count = snapshot.len();
        let changed = feed.send_if_modified(|current| {
            if current.as_ref() == Some(&snapshot) {
                false
            } else {
                *current = Some(snapshot);
                true
            }
        });
        if changed {
            observer.on_event(&DmkEvent::DevicesDiscovered { count });
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = feed.closed() => {
                let idle = {
                    let mut slot = lock(&slot);
                    // A new observer may have subscribed since the last one left.
                    let idle = feed.receiver_count() == 0;
                    if idle && slot.as_ref().is_some_and(|f| Arc::ptr_eq(f, &feed)) {
                        *slot = None;
                    }
                    idle
                };
                if idle {
                    debug!("Discovery scan stopped, no observers left");
                    return;
                }
            }
        }
    }
}

/// One observer of the discovery feed.
///
/// Yields full snapshots; ends when its observation window elapses.
pub struct DiscoveryStream {
    rx: watch::Receiver<Option<DeviceSnapshot>>,
    deadline: Option<Instant>,
    primed: bool,
}

impl DiscoveryStream {
    fn new(rx: watch::Receiver<Option<DeviceSnapshot>>) -> Self {
        Self {
            rx,
            deadline: None,
            primed: false,
        }
    }

    /// End the stream `window` from now.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.deadline = Some(Instant::now() + window);
        self
    }

    /// Next snapshot, or `None` once the window has elapsed.
    pub async fn next(&mut self) -> Option<DeviceSnapshot> {
        loop {
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                return None;
            }
            if !self.primed {
                self.primed = true;
                if let Some(snapshot) = self.rx.borrow_and_update().clone() {
                    return Some(snapshot);
                }
            }

            let changed = match self.deadline {
                Some(deadline) => match timeout_at(deadline, self.rx.changed()).await {
                    Ok(res) => res,
                    Err(_) => return None,
                },
                None => self.rx.changed().await,
            };
            if changed.is_err() {
                return None;
            }
            if let Some(snapshot) = self.rx.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }
    }

    /// Drain the stream and return the last snapshot seen.
    pub async fn last(mut self) -> Option<DeviceSnapshot> {
        let mut last = None;
        while let Some(snapshot) = self.next().await {
            last = Some(snapshot);
        }
        last
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::device::{DeviceModelId, TransportKind};
    use proptest::prelude::*;

    fn snapshot_of(ids: &[u8]) -> DeviceSnapshot {
        DeviceSnapshot::from_devices(ids.iter().map(|i| {
            DeviceDescriptor::new(format!("dev-{i}"), "Nano X", TransportKind::Simulated, DeviceModelId::NanoX)
        }))
    }

    proptest! {
        #[test]
        fn prop_filter_unconnected_is_idempotent(
            listed in prop::collection::vec(0u8..32, 0..24),
            connected in prop::collection::hash_set(0u8..32, 0..16),
        ) {
            let snapshot = snapshot_of(&listed);
            let connected: HashSet<DeviceId> =
                connected.iter().map(|i| DeviceId::new(format!("dev-{i}"))).collect();

            let once = snapshot.filter_unconnected(&connected);
            let twice = once.filter_unconnected(&connected);
            prop_assert_eq!(&once, &twice);
            prop_assert!(once.devices().iter().all(|d| !connected.contains(&d.id)));
            prop_assert!(once.devices().iter().all(|d| snapshot.contains(&d.id)));
            prop_assert_eq!(
                once.len(),
                snapshot.devices().iter().filter(|d| !connected.contains(&d.id)).count()
            );
        }
    }
}
