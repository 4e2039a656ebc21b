//! Canonical device registry
//!
//! Single owner of device records. Both producers (hotplug watcher and bridge
//! scanner) feed normalized signals in; the registry decides what actually
//! changed and emits events only for material changes, so consumers never see
//! duplicate or timestamp-only churn.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::device::{DeviceRecord, TransportOrigin};
use crate::identity::IdentityKey;
use crate::signal::{BridgeEntry, HotplugAction, HotplugSignal};

/// A material registry change worth broadcasting.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Added(DeviceRecord),
    Updated(DeviceRecord),
    Removed(DeviceRecord),
}

/// In-memory device registry keyed by canonical identity.
///
/// Purely synchronous; callers wrap it in whatever locking their runtime
/// needs.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<IdentityKey, DeviceRecord>,
    /// Most recently added key, used to attribute anonymous removals.
    last_added: Option<IdentityKey>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&DeviceRecord> {
        self.devices.get(key)
    }

    /// All records sorted by key, for status replies and state broadcasts.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<_> = self.devices.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Apply one hotplug sighting. Returns the resulting event, if the
    /// sighting materially changed the registry.
    pub fn apply_hotplug(&mut self, signal: &HotplugSignal) -> Option<RegistryEvent> {
        let key = IdentityKey::derive(
            signal.serial.as_deref(),
            signal.vendor_id.as_deref(),
            signal.product_id.as_deref(),
        );
        match signal.action {
            HotplugAction::Add => {
                let key = key?;
                match self.devices.get_mut(&key) {
                    Some(existing) => {
                        let before = existing.clone();
                        existing.absorb_hotplug(signal);
                        if existing.materially_differs(&before) {
                            Some(RegistryEvent::Updated(existing.clone()))
                        } else {
                            None
                        }
                    }
                    None => {
                        let record = DeviceRecord::from_hotplug(key.clone(), signal);
                        self.devices.insert(key.clone(), record.clone());
                        self.last_added = Some(key);
                        Some(RegistryEvent::Added(record))
                    }
                }
            }
            HotplugAction::Present => {
                // Enumeration results at startup: populate silently.
                let key = key?;
                match self.devices.get_mut(&key) {
                    Some(existing) => {
                        existing.absorb_hotplug(signal);
                    }
                    None => {
                        let record = DeviceRecord::from_hotplug(key.clone(), signal);
                        self.devices.insert(key, record);
                    }
                }
                None
            }
            HotplugAction::Remove => {
                let key = match key {
                    Some(key) => key,
                    // Anonymous removal: USB stacks often strip identifiers
                    // from remove events, so fall back to the most recent
                    // addition.
                    None => {
                        let key = self.last_added.take()?;
                        debug!(key = %key, "attributing anonymous removal to last added device");
                        key
                    }
                };
                self.remove(&key)
            }
        }
    }

    /// Remove a record by key. Returns the removal event only when a record
    /// was actually present.
    pub fn remove(&mut self, key: &IdentityKey) -> Option<RegistryEvent> {
        let record = self.devices.remove(key)?;
        if self.last_added.as_ref() == Some(key) {
            self.last_added = None;
        }
        Some(RegistryEvent::Removed(record))
    }

    /// Reconcile a full bridge enumeration against the registry.
    ///
    /// Entries in the scan are upserted; bridge-origin records absent from
    /// the scan are removed. Hotplug-origin records are left alone since the
    /// bridge only sees devices with an authorized channel. An empty return
    /// means the scan changed nothing.
    pub fn apply_bridge_scan(&mut self, entries: &[BridgeEntry]) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        let mut seen: HashSet<IdentityKey> = HashSet::new();

        for entry in entries {
            let Some(key) = IdentityKey::from_serial(&entry.serial) else {
                continue;
            };
            seen.insert(key.clone());
            match self.devices.get_mut(&key) {
                Some(existing) => {
                    let before = existing.clone();
                    existing.absorb_bridge(entry);
                    if existing.materially_differs(&before) {
                        events.push(RegistryEvent::Updated(existing.clone()));
                    }
                }
                None => {
                    let record = DeviceRecord::from_bridge(key.clone(), entry);
                    self.devices.insert(key, record.clone());
                    events.push(RegistryEvent::Added(record));
                }
            }
        }

        let stale: Vec<IdentityKey> = self
            .devices
            .iter()
            .filter(|(key, record)| {
                record.origin == TransportOrigin::Bridge && !seen.contains(key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(event) = self.remove(&key) {
                events.push(event);
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_signal(serial: &str) -> HotplugSignal {
        let mut signal = HotplugSignal::new(HotplugAction::Add);
        signal.serial = Some(serial.to_string());
        signal
    }

    fn remove_signal(serial: Option<&str>) -> HotplugSignal {
        let mut signal = HotplugSignal::new(HotplugAction::Remove);
        signal.serial = serial.map(str::to_string);
        signal
    }

    fn entry(serial: &str) -> BridgeEntry {
        BridgeEntry {
            serial: serial.to_string(),
            properties: Default::default(),
        }
    }

    #[test]
    fn add_then_duplicate_add_emits_once() {
        let mut registry = DeviceRegistry::new();
        let first = registry.apply_hotplug(&add_signal("TEST1234"));
        assert!(matches!(first, Some(RegistryEvent::Added(_))));

        // Same sighting again: no material change, no event.
        let second = registry.apply_hotplug(&add_signal("TEST1234"));
        assert!(second.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn cosmetic_serial_variants_collapse_to_one_record() {
        let mut registry = DeviceRegistry::new();
        registry.apply_hotplug(&add_signal("R5CR12ABCDE"));
        registry.apply_hotplug(&add_signal("r5cr-12-abcde"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn add_with_new_metadata_emits_update() {
        let mut registry = DeviceRegistry::new();
        registry.apply_hotplug(&add_signal("TEST1234"));

        let mut richer = add_signal("TEST1234");
        richer.vendor_id = Some("18d1".to_string());
        richer.product_id = Some("4ee7".to_string());
        let event = registry.apply_hotplug(&richer);
        match event {
            Some(RegistryEvent::Updated(record)) => {
                assert_eq!(record.vendor_id.as_deref(), Some("18d1"));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn remove_known_device() {
        let mut registry = DeviceRegistry::new();
        registry.apply_hotplug(&add_signal("TEST1234"));
        let event = registry.apply_hotplug(&remove_signal(Some("TEST1234")));
        assert!(matches!(event, Some(RegistryEvent::Removed(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_unknown_device_is_silent() {
        let mut registry = DeviceRegistry::new();
        registry.apply_hotplug(&add_signal("TEST1234"));
        let event = registry.apply_hotplug(&remove_signal(Some("OTHER9999")));
        assert!(event.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn anonymous_remove_falls_back_to_last_added() {
        let mut registry = DeviceRegistry::new();
        registry.apply_hotplug(&add_signal("FIRST111"));
        registry.apply_hotplug(&add_signal("SECOND222"));

        let event = registry.apply_hotplug(&remove_signal(None));
        match event {
            Some(RegistryEvent::Removed(record)) => {
                assert_eq!(record.serial.as_deref(), Some("SECOND222"));
            }
            other => panic!("expected removal, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);

        // The heuristic is one shot: a second anonymous removal has no
        // candidate and is dropped.
        assert!(registry.apply_hotplug(&remove_signal(None)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn present_sighting_populates_silently() {
        let mut registry = DeviceRegistry::new();
        let mut signal = add_signal("TEST1234");
        signal.action = HotplugAction::Present;
        assert!(registry.apply_hotplug(&signal).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn bridge_scan_adds_and_removes() {
        let mut registry = DeviceRegistry::new();

        let events = registry.apply_bridge_scan(&[entry("TEST1234"), entry("TEST5678")]);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, RegistryEvent::Added(_))));

        // Unchanged rescan is quiet.
        let events = registry.apply_bridge_scan(&[entry("TEST1234"), entry("TEST5678")]);
        assert!(events.is_empty());

        // One device dropped off the bridge.
        let events = registry.apply_bridge_scan(&[entry("TEST1234")]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RegistryEvent::Removed(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn bridge_scan_spares_hotplug_only_records() {
        let mut registry = DeviceRegistry::new();
        registry.apply_hotplug(&add_signal("HOTPLUG1"));

        // Empty scan must not evict a device the bridge never claimed.
        let events = registry.apply_bridge_scan(&[]);
        assert!(events.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn bridge_confirmation_upgrades_hotplug_record() {
        let mut registry = DeviceRegistry::new();
        let mut signal = add_signal("TEST1234");
        signal.vendor_id = Some("04e8".to_string());
        signal.product_id = Some("6860".to_string());
        registry.apply_hotplug(&signal);

        let mut bridge = entry("TEST1234");
        bridge
            .properties
            .insert("model".to_string(), "SM_G991B".to_string());
        let events = registry.apply_bridge_scan(&[bridge]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            RegistryEvent::Updated(record) => {
                assert_eq!(record.origin, TransportOrigin::Bridge);
                assert_eq!(record.vendor_id.as_deref(), Some("04e8"));
                assert_eq!(record.display_name, "SM G991B");
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);

        // A later hotplug sighting must not downgrade the bridge origin.
        registry.apply_hotplug(&add_signal("TEST1234"));
        let key = IdentityKey::from_serial("TEST1234").unwrap();
        assert_eq!(registry.get(&key).unwrap().origin, TransportOrigin::Bridge);
    }
}
