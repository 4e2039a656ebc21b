//! Castlink Discovery - Device sighting producers
//!
//! This crate provides the two producers that feed the registry:
//! - A udev monitor thread translating kernel USB hotplug events
//! - A debug-bridge scanner shelling out to `adb devices -l`

pub mod bridge;
pub mod hotplug;

pub use bridge::{parse_device_list, BridgeScanner};
pub use hotplug::{enumerate_present, spawn_watcher};
