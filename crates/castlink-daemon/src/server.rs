//! Unix socket server
//!
//! One listener under the user's runtime directory, one task per connection.
//! Connections speak the line protocol; subscribing switches the connection
//! task into a select loop that interleaves broadcast events with further
//! request handling.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use castlink_core::protocol::{encode_line, parse_request, Event, Request};
use castlink_core::signal::HotplugSignal;
use castlink_discovery::BridgeScanner;

use crate::router::{handle_request, reply_for_parse_error};
use crate::state::DaemonState;

/// Resolve the socket path under the user's runtime directory. A missing
/// XDG_RUNTIME_DIR means there is no per-user place to serve from, which is
/// fatal at startup.
pub fn socket_path(socket_name: &str) -> Result<PathBuf> {
    let runtime_dir =
        std::env::var("XDG_RUNTIME_DIR").context("XDG_RUNTIME_DIR is not set; refusing to guess a socket location")?;
    Ok(Path::new(&runtime_dir).join(socket_name))
}

/// Bind the listener, replacing any stale socket file from a previous run,
/// and restrict it to the owning user.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("binding unix socket {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("restricting socket permissions on {}", path.display()))?;
    Ok(listener)
}

/// Serve forever: pump hotplug signals into the registry, run the bridge
/// rescan loop, and accept client connections.
pub async fn run(
    state: Arc<DaemonState>,
    listener: UnixListener,
    mut hotplug_rx: mpsc::Receiver<HotplugSignal>,
) -> Result<()> {
    let pump_state = state.clone();
    tokio::spawn(async move {
        while let Some(signal) = hotplug_rx.recv().await {
            pump_state.apply_hotplug(&signal).await;
        }
        debug!("hotplug signal channel closed");
    });

    let rescan_state = state.clone();
    tokio::spawn(async move {
        rescan_loop(rescan_state).await;
    });

    loop {
        let (stream, _addr) = listener.accept().await.context("accepting connection")?;
        let state = state.clone();
        tokio::spawn(async move {
            handle_connection(state, stream).await;
        });
    }
}

/// Scan immediately at startup, then on every hotplug kick and, when
/// configured, on a periodic timer. Failed scans keep the previous registry
/// state.
async fn rescan_loop(state: Arc<DaemonState>) {
    let scanner = BridgeScanner::new(
        state.config.adb.path.clone(),
        Duration::from_secs(state.config.adb.scan_timeout_secs),
    );
    let interval = state.config.daemon.rescan_interval_secs;
    loop {
        match scanner.scan().await {
            Ok(entries) => state.apply_bridge_scan(&entries).await,
            Err(err) => warn!(error = %err, "bridge scan failed, keeping previous state"),
        }
        if interval > 0 {
            tokio::select! {
                _ = state.rescan.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
            }
        } else {
            state.rescan.notified().await;
        }
    }
}

async fn handle_connection(state: Arc<DaemonState>, stream: UnixStream) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line: Vec<u8> = Vec::new();
    let mut events: Option<broadcast::Receiver<Event>> = None;

    loop {
        tokio::select! {
            result = reader.read_until(b'\n', &mut line) => {
                match result {
                    Ok(0) => break,
                    Ok(_) => {
                        if !handle_line(&state, &line, &mut events, &mut writer).await {
                            break;
                        }
                        // Cleared only after a completed read: a cancelled
                        // read_until leaves a partial request in the buffer
                        // and the next poll continues appending to it.
                        line.clear();
                    }
                    Err(err) => {
                        debug!(error = %err, "connection read failed");
                        break;
                    }
                }
            }
            event = next_event(&mut events) => {
                match event {
                    Ok(event) => {
                        if write_message(&mut writer, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "subscriber lagged behind the event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    debug!("connection closed");
}

async fn handle_line(
    state: &Arc<DaemonState>,
    line: &[u8],
    events: &mut Option<broadcast::Receiver<Event>>,
    writer: &mut OwnedWriteHalf,
) -> bool {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return true;
    }
    let reply = match parse_request(text) {
        Ok(request) => {
            // Subscribe before snapshotting so no event can fall into the
            // gap between the acknowledgement and the stream.
            if matches!(request, Request::Subscribe { .. }) && events.is_none() {
                *events = Some(state.subscribe());
            }
            handle_request(state, &request).await
        }
        Err(err) => reply_for_parse_error(err),
    };
    write_message(writer, &reply).await.is_ok()
}

/// Pending forever while unsubscribed, so the select loop only reads.
async fn next_event(
    events: &mut Option<broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_message<T: serde::Serialize>(
    writer: &mut OwnedWriteHalf,
    message: &T,
) -> std::io::Result<()> {
    let line = encode_line(message).map_err(std::io::Error::other)?;
    writer.write_all(line.as_bytes()).await
}
