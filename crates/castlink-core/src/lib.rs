//! Castlink Core - Shared types, wire protocol, and device registry
//!
//! This crate provides the foundational types for the castlink system:
//! - Canonical identity keys for deduplicating device sightings
//! - Normalized producer signals (hotplug events, bridge enumerations)
//! - The device registry with its diff-based reconciliation
//! - The newline-delimited JSON request/reply/event protocol

pub mod device;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod signal;

pub use device::{DeviceRecord, TransportOrigin};
pub use identity::IdentityKey;
pub use protocol::{
    DeviceAction, ErrorToken, Event, MirrorOptions, ProcessAction, ProcessInfo, ProtocolError,
    Reply, ReplyPayload, Request, RequestError, ServerMessage,
};
pub use registry::{DeviceRegistry, RegistryEvent};
pub use signal::{BridgeEntry, HotplugAction, HotplugSignal};
