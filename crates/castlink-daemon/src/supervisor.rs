//! Mirror process supervision
//!
//! One mirror process per serial. Every spawn gets a wait task that owns the
//! child handle; the task clears the tracking entry and broadcasts the exit,
//! whether the process died on its own or was stopped on request.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use castlink_core::protocol::{Event, MirrorOptions, ProcessAction, ProcessInfo};

use crate::config::MirrorConfig;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("mirror already running for {0}")]
    AlreadyRunning(String),
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("no mirror running for {0}")]
    NotRunning(String),
    #[error("mirror for {0} survived SIGKILL")]
    Unkillable(String),
}

pub struct MirrorSupervisor {
    mirror: MirrorConfig,
    stop_grace: Duration,
    procs: Arc<RwLock<HashMap<String, u32>>>,
    events: broadcast::Sender<Event>,
}

impl MirrorSupervisor {
    pub fn new(
        mirror: MirrorConfig,
        stop_grace: Duration,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            mirror,
            stop_grace,
            procs: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Running mirrors keyed by serial, sorted for status replies.
    pub async fn processes(&self) -> BTreeMap<String, ProcessInfo> {
        self.procs
            .read()
            .await
            .iter()
            .map(|(serial, pid)| (serial.clone(), ProcessInfo { pid: *pid }))
            .collect()
    }

    /// Launch a mirror for `serial`. The tracking entry is inserted under the
    /// write lock so concurrent starts for the same serial cannot both spawn.
    pub async fn start(&self, serial: &str, options: &MirrorOptions) -> Result<u32, StartError> {
        let mut procs = self.procs.write().await;
        if procs.contains_key(serial) {
            return Err(StartError::AlreadyRunning(serial.to_string()));
        }

        let binary = options
            .mirror_cmd
            .as_deref()
            .unwrap_or(&self.mirror.path)
            .to_string();
        let mut command = Command::new(&binary);
        command
            .arg("-s")
            .arg(serial)
            .args(&self.mirror.extra_args)
            .args(options.args.as_deref().unwrap_or_default())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(|source| StartError::Spawn {
            command: binary.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| StartError::Spawn {
            command: binary.clone(),
            source: std::io::Error::other("child exited before pid was available"),
        })?;
        procs.insert(serial.to_string(), pid);
        drop(procs);
        info!(serial, pid, command = %binary, "mirror started");

        let serial = serial.to_string();
        let procs = self.procs.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let returncode = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(serial, error = %err, "waiting on mirror process failed");
                    None
                }
            };
            procs.write().await.remove(&serial);
            debug!(serial, ?returncode, "mirror exited");
            let _ = events.send(Event::Process {
                action: ProcessAction::Exit,
                serial,
                returncode,
            });
        });

        Ok(pid)
    }

    /// Stop the mirror for `serial`: SIGTERM, a grace period, then SIGKILL.
    /// Returns once the wait task has reaped the process.
    pub async fn stop(&self, serial: &str) -> Result<(), StopError> {
        let pid = match self.procs.read().await.get(serial) {
            Some(pid) => *pid,
            None => return Err(StopError::NotRunning(serial.to_string())),
        };

        // Subscribe before signaling so the exit broadcast cannot be missed.
        let events = self.events.subscribe();
        signal(pid, libc::SIGTERM);
        debug!(serial, pid, "sent SIGTERM to mirror");

        if self
            .await_exit(serial, events, self.stop_grace)
            .await
            .is_ok()
        {
            return Ok(());
        }

        warn!(serial, pid, "mirror ignored SIGTERM, escalating to SIGKILL");
        let events = self.events.subscribe();
        signal(pid, libc::SIGKILL);
        self.await_exit(serial, events, Duration::from_secs(2))
            .await
            .map_err(|_| StopError::Unkillable(serial.to_string()))
    }

    async fn await_exit(
        &self,
        serial: &str,
        mut events: broadcast::Receiver<Event>,
        grace: Duration,
    ) -> Result<(), ()> {
        // The exit may have landed before this receiver subscribed.
        if !self.procs.read().await.contains_key(serial) {
            return Ok(());
        }
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(Event::Process {
                        serial: exited, ..
                    }) if exited == serial => return,
                    Ok(_) => continue,
                    // Lagged or closed: fall back to polling the table.
                    Err(_) => {
                        while self.procs.read().await.contains_key(serial) {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        return;
                    }
                }
            }
        };
        timeout(grace, wait).await.map_err(|_| ())
    }
}

fn signal(pid: u32, sig: libc::c_int) {
    // ESRCH just means the process beat us to exiting.
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, sig, error = %err, "kill failed");
        }
    }
}
