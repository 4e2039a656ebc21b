//! Canonical device identity keys

use serde::{Deserialize, Serialize};

/// Canonical deduplication key for a physical device.
///
/// The same device is reported with cosmetically different serial renderings
/// depending on the producer (punctuation, underscores, case), so the key is
/// the serial lowercased with every non-alphanumeric character stripped.
/// Devices without a usable serial fall back to a vendor/product composite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Build a key from a raw serial string. Returns `None` when nothing
    /// alphanumeric survives normalization.
    pub fn from_serial(serial: &str) -> Option<Self> {
        let normalized: String = serial
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if normalized.is_empty() {
            None
        } else {
            Some(Self(normalized))
        }
    }

    /// Composite fallback key for devices that expose vendor/product ids but
    /// no serial.
    pub fn from_vendor_product(vendor_id: &str, product_id: &str) -> Self {
        Self(format!(
            "usb:{}:{}",
            vendor_id.trim().to_ascii_lowercase(),
            product_id.trim().to_ascii_lowercase()
        ))
    }

    /// Derive the best available key from a sighting: serial first, then the
    /// vendor/product composite, then nothing (anonymous sighting).
    pub fn derive(
        serial: Option<&str>,
        vendor_id: Option<&str>,
        product_id: Option<&str>,
    ) -> Option<Self> {
        if let Some(key) = serial.and_then(Self::from_serial) {
            return Some(key);
        }
        match (vendor_id, product_id) {
            (Some(v), Some(p)) if !v.trim().is_empty() && !p.trim().is_empty() => {
                Some(Self::from_vendor_product(v, p))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
