//! Normalized producer signals fed to the registry

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Normalized hotplug action classification.
///
/// Kernel `bind`/`unbind` events are folded into add/remove; every other
/// action spelling (`change`, `move`, enumeration results) is treated as a
/// neutral "present" sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HotplugAction {
    Add,
    Remove,
    Present,
}

impl HotplugAction {
    /// Normalize a raw udev action string.
    pub fn from_udev(action: &str) -> Self {
        match action {
            "add" | "bind" => Self::Add,
            "remove" | "unbind" => Self::Remove,
            _ => Self::Present,
        }
    }
}

/// One normalized sighting from the hotplug watcher.
///
/// All fields besides the action are best effort; USB topology frequently
/// yields remove notifications with no identifier at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotplugSignal {
    pub action: HotplugAction,
    pub serial: Option<String>,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl HotplugSignal {
    pub fn new(action: HotplugAction) -> Self {
        Self {
            action,
            serial: None,
            vendor_id: None,
            product_id: None,
            properties: BTreeMap::new(),
        }
    }
}

/// One authorized entry from a bridge enumeration.
///
/// The scanner filters out unauthorized/offline entries before they reach the
/// registry, so an entry's presence means the device has a usable
/// communication channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEntry {
    pub serial: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}
