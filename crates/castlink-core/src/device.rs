//! Device record types for the canonical registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::identity::IdentityKey;
use crate::signal::{BridgeEntry, HotplugSignal};

/// Which producer most recently authoritatively updated a record.
///
/// `Bridge` entries are authoritative for the presence of a usable
/// communication channel and are never downgraded by a later hotplug-only
/// sighting of the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportOrigin {
    Hotplug,
    Bridge,
}

/// Canonical view of one physical device.
///
/// Created on first sighting by either producer and updated in place on
/// subsequent sightings that resolve to the same identity key. Owned
/// exclusively by the registry; producers only propose add/remove signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Canonical dedup key, unique within the registry.
    pub key: IdentityKey,
    pub origin: TransportOrigin,
    /// Raw serial as last reported, kept unnormalized for command use.
    pub serial: Option<String>,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    /// Opaque vendor/protocol metadata from either producer.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Best-effort human label.
    pub display_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl DeviceRecord {
    /// Build a record from a hotplug sighting.
    pub fn from_hotplug(key: IdentityKey, signal: &HotplugSignal) -> Self {
        let now = Utc::now();
        let mut record = Self {
            key,
            origin: TransportOrigin::Hotplug,
            serial: signal.serial.clone(),
            vendor_id: signal.vendor_id.clone(),
            product_id: signal.product_id.clone(),
            properties: signal.properties.clone(),
            display_name: String::new(),
            first_seen: now,
            last_seen: now,
        };
        record.refresh_display_name();
        record
    }

    /// Build a record from a bridge enumeration entry.
    pub fn from_bridge(key: IdentityKey, entry: &BridgeEntry) -> Self {
        let now = Utc::now();
        let mut record = Self {
            key,
            origin: TransportOrigin::Bridge,
            serial: Some(entry.serial.clone()),
            vendor_id: None,
            product_id: None,
            properties: entry.properties.clone(),
            display_name: String::new(),
            first_seen: now,
            last_seen: now,
        };
        record.refresh_display_name();
        record
    }

    /// Update the last seen timestamp.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Fold a hotplug sighting into this record. Fields present on the
    /// record but missing from the sighting are kept; an existing bridge
    /// origin is preserved.
    pub fn absorb_hotplug(&mut self, signal: &HotplugSignal) {
        if self.serial.is_none() {
            self.serial = signal.serial.clone();
        }
        if self.vendor_id.is_none() {
            self.vendor_id = signal.vendor_id.clone();
        }
        if self.product_id.is_none() {
            self.product_id = signal.product_id.clone();
        }
        for (k, v) in &signal.properties {
            self.properties.insert(k.clone(), v.clone());
        }
        self.refresh_display_name();
        self.touch();
    }

    /// Fold a bridge entry into this record and mark it bridge-confirmed.
    pub fn absorb_bridge(&mut self, entry: &BridgeEntry) {
        self.origin = TransportOrigin::Bridge;
        if self.serial.is_none() {
            self.serial = Some(entry.serial.clone());
        }
        for (k, v) in &entry.properties {
            self.properties.insert(k.clone(), v.clone());
        }
        self.refresh_display_name();
        self.touch();
    }

    /// Recompute the human label from the richest metadata available.
    pub fn refresh_display_name(&mut self) {
        self.display_name = self.derive_display_name();
    }

    fn derive_display_name(&self) -> String {
        // adb `model:` / `device:` columns first, then udev model strings.
        for prop in ["model", "device", "ID_MODEL", "ID_MODEL_FROM_DATABASE"] {
            if let Some(value) = self.properties.get(prop) {
                if !value.is_empty() {
                    return value.replace('_', " ");
                }
            }
        }
        if let Some(serial) = &self.serial {
            if !serial.is_empty() {
                return serial.clone();
            }
        }
        if let (Some(v), Some(p)) = (&self.vendor_id, &self.product_id) {
            return format!("USB device {v}:{p}");
        }
        "Unknown device".to_string()
    }

    /// Whether anything besides the sighting timestamps differs. Used to
    /// suppress broadcasts for timestamp-only updates.
    pub fn materially_differs(&self, other: &Self) -> bool {
        self.key != other.key
            || self.origin != other.origin
            || self.serial != other.serial
            || self.vendor_id != other.vendor_id
            || self.product_id != other.product_id
            || self.properties != other.properties
            || self.display_name != other.display_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::HotplugAction;

    fn signal_with_serial(serial: &str) -> HotplugSignal {
        let mut signal = HotplugSignal::new(HotplugAction::Add);
        signal.serial = Some(serial.to_string());
        signal
    }

    #[test]
    fn display_name_prefers_model_property() {
        let mut signal = signal_with_serial("R5CR12ABCDE");
        signal
            .properties
            .insert("model".to_string(), "SM_G991B".to_string());
        let key = IdentityKey::from_serial("R5CR12ABCDE").unwrap();
        let record = DeviceRecord::from_hotplug(key, &signal);
        assert_eq!(record.display_name, "SM G991B");
    }

    #[test]
    fn display_name_falls_back_to_serial_then_ids() {
        let key = IdentityKey::from_serial("R5CR12ABCDE").unwrap();
        let record = DeviceRecord::from_hotplug(key, &signal_with_serial("R5CR12ABCDE"));
        assert_eq!(record.display_name, "R5CR12ABCDE");

        let mut signal = HotplugSignal::new(HotplugAction::Add);
        signal.vendor_id = Some("18d1".to_string());
        signal.product_id = Some("4ee7".to_string());
        let key = IdentityKey::derive(None, Some("18d1"), Some("4ee7")).unwrap();
        let record = DeviceRecord::from_hotplug(key, &signal);
        assert_eq!(record.display_name, "USB device 18d1:4ee7");
    }

    #[test]
    fn absorb_bridge_upgrades_origin_and_keeps_fields() {
        let mut signal = signal_with_serial("R5CR12ABCDE");
        signal.vendor_id = Some("04e8".to_string());
        let key = IdentityKey::from_serial("R5CR12ABCDE").unwrap();
        let mut record = DeviceRecord::from_hotplug(key, &signal);

        let entry = BridgeEntry {
            serial: "r5cr12abcde".to_string(),
            properties: BTreeMap::from([("model".to_string(), "SM_G991B".to_string())]),
        };
        record.absorb_bridge(&entry);

        assert_eq!(record.origin, TransportOrigin::Bridge);
        assert_eq!(record.vendor_id.as_deref(), Some("04e8"));
        // Raw serial from the first sighting is kept.
        assert_eq!(record.serial.as_deref(), Some("R5CR12ABCDE"));
        assert_eq!(record.display_name, "SM G991B");
    }

    #[test]
    fn timestamp_only_update_is_not_material() {
        let key = IdentityKey::from_serial("R5CR12ABCDE").unwrap();
        let mut record = DeviceRecord::from_hotplug(key, &signal_with_serial("R5CR12ABCDE"));
        let before = record.clone();
        record.touch();
        assert!(!record.materially_differs(&before));
    }
}
