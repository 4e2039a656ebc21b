//! Shared daemon state

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify, RwLock};
use tracing::debug;

use castlink_core::protocol::{DeviceAction, Event};
use castlink_core::registry::{DeviceRegistry, RegistryEvent};
use castlink_core::signal::{BridgeEntry, HotplugSignal};
use castlink_core::DeviceRecord;

use crate::config::Config;
use crate::supervisor::MirrorSupervisor;

/// Shared daemon state: the registry, the mirror supervisor, and the event
/// fan-out all connection tasks subscribe to.
pub struct DaemonState {
    pub registry: RwLock<DeviceRegistry>,
    pub supervisor: MirrorSupervisor,
    pub events: broadcast::Sender<Event>,
    /// Kicked by hotplug activity to trigger an immediate bridge rescan.
    pub rescan: Notify,
    pub config: Config,
}

impl DaemonState {
    pub fn new(config: Config) -> Arc<Self> {
        let (events, _) = broadcast::channel(100);
        let supervisor = MirrorSupervisor::new(
            config.mirror.clone(),
            Duration::from_secs(config.daemon.stop_grace_secs),
            events.clone(),
        );
        Arc::new(Self {
            registry: RwLock::new(DeviceRegistry::new()),
            supervisor,
            events,
            rescan: Notify::new(),
            config,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<DeviceRecord> {
        self.registry.read().await.snapshot()
    }

    /// Apply one hotplug signal and broadcast the resulting delta, if any.
    /// Every signal kicks a bridge rescan, material or not: bridge
    /// visibility often lags or leads hotplug visibility.
    pub async fn apply_hotplug(&self, signal: &HotplugSignal) {
        let event = self.registry.write().await.apply_hotplug(signal);
        self.rescan.notify_one();
        let Some(event) = event else { return };
        let (action, record) = match &event {
            RegistryEvent::Added(record) => (DeviceAction::Add, record),
            RegistryEvent::Updated(record) => (DeviceAction::Update, record),
            RegistryEvent::Removed(record) => (DeviceAction::Remove, record),
        };
        self.broadcast(Event::Device {
            action,
            serial: record.serial.clone(),
            vendor_id: record.vendor_id.clone(),
            product_id: record.product_id.clone(),
        });
    }

    /// Reconcile a bridge scan. Any material change produces one `state`
    /// broadcast carrying the full snapshot.
    pub async fn apply_bridge_scan(&self, entries: &[BridgeEntry]) {
        let mut registry = self.registry.write().await;
        let events = registry.apply_bridge_scan(entries);
        if events.is_empty() {
            return;
        }
        let devices = registry.snapshot();
        drop(registry);
        debug!(changes = events.len(), "bridge scan changed the registry");
        self.broadcast(Event::State { devices });
    }

    fn broadcast(&self, event: Event) {
        // Send only fails when nobody is subscribed, which is fine.
        let _ = self.events.send(event);
    }
}
