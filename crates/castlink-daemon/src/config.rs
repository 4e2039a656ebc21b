//! Configuration loading and validation

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub adb: AdbConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Socket file name under the user's runtime directory
    #[serde(default = "default_socket_name")]
    pub socket_name: String,
    /// Periodic bridge rescan interval in seconds (0 disables the timer;
    /// hotplug events still trigger rescans)
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,
    /// How long to wait after SIGTERM before escalating to SIGKILL
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_name: default_socket_name(),
            rescan_interval_secs: default_rescan_interval(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

fn default_socket_name() -> String {
    "castlink.sock".to_string()
}

fn default_rescan_interval() -> u64 {
    30
}

fn default_stop_grace() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdbConfig {
    /// Bridge CLI binary
    #[serde(default = "default_adb_path")]
    pub path: String,
    /// Per-scan timeout in seconds
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            path: default_adb_path(),
            scan_timeout_secs: default_scan_timeout(),
        }
    }
}

fn default_adb_path() -> String {
    "adb".to_string()
}

fn default_scan_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Mirror binary launched per device
    #[serde(default = "default_mirror_path")]
    pub path: String,
    /// Arguments appended to every launch, before per-request arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            path: default_mirror_path(),
            extra_args: Vec::new(),
        }
    }
}

fn default_mirror_path() -> String {
    "scrcpy".to_string()
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
