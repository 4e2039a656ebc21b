//! Debug-bridge scanner
//!
//! Shells out to the bridge CLI (`adb devices -l`) and parses its listing
//! into authorized entries. Only lines in the `device` state count; offline
//! and unauthorized entries never reach the registry.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use castlink_core::signal::BridgeEntry;

/// Runs bridge enumerations on demand.
#[derive(Debug, Clone)]
pub struct BridgeScanner {
    adb_path: String,
    scan_timeout: Duration,
}

impl BridgeScanner {
    pub fn new(adb_path: impl Into<String>, scan_timeout: Duration) -> Self {
        Self {
            adb_path: adb_path.into(),
            scan_timeout,
        }
    }

    /// Run one enumeration. Failures are returned rather than swallowed so
    /// the caller can keep the previous registry state on a bad scan.
    pub async fn scan(&self) -> Result<Vec<BridgeEntry>> {
        let output = timeout(
            self.scan_timeout,
            Command::new(&self.adb_path)
                .args(["devices", "-l"])
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .with_context(|| format!("{} devices -l timed out", self.adb_path))?
        .with_context(|| format!("running {} devices -l", self.adb_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} devices -l exited with {}: {}",
                self.adb_path,
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let entries = parse_device_list(&stdout);
        debug!(count = entries.len(), "bridge scan complete");
        Ok(entries)
    }
}

/// Parse `adb devices -l` output into authorized entries.
pub fn parse_device_list(output: &str) -> Vec<BridgeEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices") || line.starts_with('*') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let (Some(serial), Some(state)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        if state != "device" {
            debug!(serial, state, "skipping non-ready bridge entry");
            continue;
        }
        let mut properties = BTreeMap::new();
        for token in tokens {
            match token.split_once(':') {
                Some((key, value)) if !key.is_empty() => {
                    properties.insert(key.to_string(), value.to_string());
                }
                _ => warn!(serial, token, "unparseable bridge property token"),
            }
        }
        entries.push(BridgeEntry {
            serial: serial.to_string(),
            properties,
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ready_devices_with_properties() {
        let output = "List of devices attached\n\
                      R5CR12ABCDE            device usb:1-2 product:o1q model:SM_G991B device:o1s transport_id:3\n\
                      emulator-5554          device product:sdk_gphone64 model:sdk_gphone64_x86_64 device:emu64x transport_id:1\n";
        let entries = parse_device_list(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].serial, "R5CR12ABCDE");
        assert_eq!(entries[0].properties["model"], "SM_G991B");
        assert_eq!(entries[0].properties["transport_id"], "3");
        assert_eq!(entries[1].serial, "emulator-5554");
    }

    #[test]
    fn filters_unauthorized_and_offline_entries() {
        let output = "List of devices attached\n\
                      R5CR12ABCDE            unauthorized usb:1-2 transport_id:3\n\
                      0123456789ABCDEF       offline\n\
                      TEST1234               device\n";
        let entries = parse_device_list(output);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].serial, "TEST1234");
        assert!(entries[0].properties.is_empty());
    }

    #[test]
    fn tolerates_daemon_startup_banner() {
        let output = "* daemon not running; starting now at tcp:5037\n\
                      * daemon started successfully\n\
                      List of devices attached\n\
                      TEST1234               device\n";
        let entries = parse_device_list(output);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn empty_listing_yields_no_entries() {
        assert!(parse_device_list("List of devices attached\n\n").is_empty());
        assert!(parse_device_list("").is_empty());
    }
}
