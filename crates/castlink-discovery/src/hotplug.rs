//! USB hotplug watcher
//!
//! Runs a dedicated OS thread around a udev netlink monitor and forwards
//! normalized signals into the async side over a bounded channel. udev
//! sockets are not async-friendly, so the thread polls the monitor fd and
//! drains pending events on readiness.

use std::os::unix::io::AsRawFd;
use std::thread;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use castlink_core::signal::{HotplugAction, HotplugSignal};

/// Kernel device type for whole USB devices, as opposed to their interfaces.
const USB_DEVICE_DEVTYPE: &str = "usb_device";

/// Spawn the watcher thread. Signals arrive on `tx`; the thread exits when
/// the receiving side is dropped.
pub fn spawn_watcher(tx: mpsc::Sender<HotplugSignal>) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("hotplug-watcher".to_string())
        .spawn(move || {
            if let Err(err) = watch_loop(tx) {
                error!(error = %err, "hotplug watcher stopped");
            }
        })
}

fn watch_loop(tx: mpsc::Sender<HotplugSignal>) -> Result<()> {
    let socket = udev::MonitorBuilder::new()
        .context("creating udev monitor")?
        .match_subsystem("usb")
        .context("adding usb subsystem match")?
        .listen()
        .context("binding udev monitor socket")?;

    let fd = socket.as_raw_fd();
    loop {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // Wake periodically so a dropped receiver is noticed even when the
        // bus is idle.
        let ready = unsafe { libc::poll(&mut pollfd, 1, 1000) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context("polling udev monitor socket");
        }
        if tx.is_closed() {
            debug!("hotplug signal channel closed, stopping watcher");
            return Ok(());
        }
        if ready == 0 {
            continue;
        }
        for event in socket.iter() {
            if event.devtype().and_then(|s| s.to_str()) != Some(USB_DEVICE_DEVTYPE) {
                continue;
            }
            let action = event
                .action()
                .and_then(|a| a.to_str())
                .map(HotplugAction::from_udev)
                .unwrap_or(HotplugAction::Present);
            let signal = signal_from_device(action, event.device());
            debug!(?signal.action, serial = ?signal.serial, "hotplug event");
            if tx.blocking_send(signal).is_err() {
                return Ok(());
            }
        }
    }
}

/// Enumerate USB devices already attached at startup, as `Present` signals.
pub fn enumerate_present() -> Result<Vec<HotplugSignal>> {
    let mut enumerator = udev::Enumerator::new().context("creating udev enumerator")?;
    enumerator
        .match_subsystem("usb")
        .context("adding usb subsystem match")?;
    let mut signals = Vec::new();
    for device in enumerator
        .scan_devices()
        .context("scanning attached usb devices")?
    {
        if device.devtype().and_then(|s| s.to_str()) != Some(USB_DEVICE_DEVTYPE) {
            continue;
        }
        signals.push(signal_from_device(HotplugAction::Present, device));
    }
    Ok(signals)
}

fn signal_from_device(action: HotplugAction, device: udev::Device) -> HotplugSignal {
    let mut signal = HotplugSignal::new(action);
    signal.serial = property(&device, "ID_SERIAL_SHORT").or_else(|| property(&device, "ID_SERIAL"));
    signal.vendor_id = property(&device, "ID_VENDOR_ID");
    signal.product_id = property(&device, "ID_MODEL_ID");
    for entry in device.properties() {
        let Some(name) = entry.name().to_str() else {
            warn!("skipping non-utf8 udev property name");
            continue;
        };
        if !name.starts_with("ID_") {
            continue;
        }
        if let Some(value) = entry.value().to_str() {
            signal.properties.insert(name.to_string(), value.to_string());
        }
    }
    signal
}

fn property(device: &udev::Device, name: &str) -> Option<String> {
    device
        .property_value(name)
        .and_then(|v| v.to_str())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
