//! Castlink Client - Talk to the castlink daemon
//!
//! Two access styles:
//! - One-shot requests (`ping`, `status`, `start_mirror`, `stop_mirror`)
//!   over short-lived connections, correlated by request id
//! - A long-lived [`Subscription`] that delivers broadcast events and
//!   reconnects with backoff when the daemon goes away

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use castlink_core::protocol::{
    decode_line, encode_line, ErrorToken, Event, MirrorOptions, ProcessInfo, ProtocolError, Reply,
    ReplyPayload, ServerMessage,
};
use castlink_core::DeviceRecord;

pub const DEFAULT_SOCKET_NAME: &str = "castlink.sock";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(8);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("XDG_RUNTIME_DIR is not set; cannot locate the daemon socket")]
    RuntimeDirUnset,
    #[error("daemon unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("request timed out")]
    Timeout,
    #[error("connection closed before a reply arrived")]
    ClosedBeforeReply,
    #[error("daemon refused the request: {error:?}{}", detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    Refused {
        error: ErrorToken,
        detail: Option<String>,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default socket path under the user's runtime directory.
pub fn socket_path() -> Result<PathBuf, ClientError> {
    let runtime_dir =
        std::env::var("XDG_RUNTIME_DIR").map_err(|_| ClientError::RuntimeDirUnset)?;
    Ok(Path::new(&runtime_dir).join(DEFAULT_SOCKET_NAME))
}

#[derive(Debug, Clone)]
pub struct Client {
    socket: PathBuf,
    request_timeout: Duration,
}

impl Client {
    /// Client for the default per-user socket.
    pub fn new() -> Result<Self, ClientError> {
        Ok(Self::with_socket(socket_path()?))
    }

    pub fn with_socket(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(serde_json::json!({"cmd": "ping"})).await?;
        Ok(())
    }

    pub async fn status(
        &self,
    ) -> Result<(Vec<DeviceRecord>, BTreeMap<String, ProcessInfo>), ClientError> {
        let reply = self.request(serde_json::json!({"cmd": "status"})).await?;
        match reply.payload {
            ReplyPayload::Status { devices, processes } => Ok((devices, processes)),
            other => Err(unexpected_payload(other)),
        }
    }

    /// Start mirroring a device. Returns the mirror process pid.
    pub async fn start_mirror(
        &self,
        serial: &str,
        options: &MirrorOptions,
    ) -> Result<u32, ClientError> {
        let reply = self
            .request(serde_json::json!({
                "cmd": "start_mirror",
                "serial": serial,
                "options": options,
            }))
            .await?;
        match reply.payload {
            ReplyPayload::Started { pid } => Ok(pid),
            other => Err(unexpected_payload(other)),
        }
    }

    pub async fn stop_mirror(&self, serial: &str) -> Result<(), ClientError> {
        self.request(serde_json::json!({"cmd": "stop_mirror", "serial": serial}))
            .await?;
        Ok(())
    }

    /// Open a subscription that survives daemon restarts. Dropping the
    /// returned handle tears down the background task.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(64);
        let socket = self.socket.clone();
        tokio::spawn(subscription_loop(socket, tx));
        Subscription { events: rx }
    }

    /// Send one request over a fresh connection and wait for the matching
    /// reply, skipping any interleaved broadcasts.
    async fn request(
        &self,
        mut body: serde_json::Value,
    ) -> Result<castlink_core::protocol::OkReply, ClientError> {
        let id = Uuid::new_v4().to_string();
        body["id"] = serde_json::Value::String(id.clone());

        let run = async {
            let stream = UnixStream::connect(&self.socket)
                .await
                .map_err(|source| ClientError::Unavailable {
                    path: self.socket.clone(),
                    source,
                })?;
            let (read_half, mut writer) = stream.into_split();
            let mut line = encode_line(&body)?;
            writer.write_all(line.as_bytes()).await?;

            let mut reader = BufReader::new(read_half);
            loop {
                line.clear();
                let n = reader.read_line(&mut line).await?;
                if n == 0 {
                    return Err(ClientError::ClosedBeforeReply);
                }
                if line.trim().is_empty() {
                    continue;
                }
                match decode_line(&line)? {
                    ServerMessage::Reply(Reply::Ok(reply)) if reply.id.as_deref() == Some(&id) => {
                        return Ok(reply);
                    }
                    ServerMessage::Reply(Reply::Error(reply))
                        if reply.id.as_deref() == Some(&id) || reply.id.is_none() =>
                    {
                        return Err(ClientError::Refused {
                            error: reply.error,
                            detail: reply.detail,
                        });
                    }
                    other => debug!(?other, "skipping unrelated message"),
                }
            }
        };
        timeout(self.request_timeout, run)
            .await
            .map_err(|_| ClientError::Timeout)?
    }
}

fn unexpected_payload(payload: ReplyPayload) -> ClientError {
    ClientError::Protocol(ProtocolError::Decode(serde::de::Error::custom(format!(
        "unexpected reply payload: {payload:?}"
    ))))
}

/// Live event stream from the daemon. The initial registry snapshot arrives
/// as a `state` event, so consumers handle catch-up and deltas uniformly.
pub struct Subscription {
    events: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Next event, or `None` once the subscription task has stopped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }
}

async fn subscription_loop(socket: PathBuf, tx: mpsc::Sender<Event>) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        match UnixStream::connect(&socket).await {
            Ok(stream) => {
                // A fresh connection resets the escalation; the next drop
                // retries quickly again.
                backoff = BACKOFF_INITIAL;
                match subscription_session(stream, &tx).await {
                    Ok(()) => return,
                    Err(err) => {
                        if tx.is_closed() {
                            return;
                        }
                        warn!(error = %err, delay = ?backoff, "subscription dropped, reconnecting");
                    }
                }
            }
            Err(err) => {
                if tx.is_closed() {
                    return;
                }
                debug!(error = %err, delay = ?backoff, "daemon unavailable, retrying");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = tx.closed() => return,
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// One connected session. Returns `Ok` only when the consumer went away;
/// any transport problem is an error so the caller reconnects.
async fn subscription_session(
    stream: UnixStream,
    tx: &mpsc::Sender<Event>,
) -> Result<(), ClientError> {
    let (read_half, mut writer) = stream.into_split();
    let mut line = encode_line(&serde_json::json!({"cmd": "subscribe"}))?;
    writer.write_all(line.as_bytes()).await?;

    let mut reader = BufReader::new(read_half);
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ClientError::ClosedBeforeReply);
        }
        if line.trim().is_empty() {
            continue;
        }
        let event = match decode_line(&line)? {
            ServerMessage::Event(event) => event,
            // The subscribe acknowledgement carries the initial snapshot.
            ServerMessage::Reply(Reply::Ok(reply)) => match reply.payload {
                ReplyPayload::Snapshot { devices, .. } => Event::State { devices },
                other => {
                    debug!(?other, "ignoring non-snapshot reply on subscription");
                    continue;
                }
            },
            ServerMessage::Reply(Reply::Error(reply)) => {
                return Err(ClientError::Refused {
                    error: reply.error,
                    detail: reply.detail,
                });
            }
        };
        if tx.send(event).await.is_err() {
            return Ok(());
        }
    }
}
