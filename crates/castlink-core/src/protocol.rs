//! Newline-delimited JSON wire protocol
//!
//! Every message is one JSON object per line. Clients send requests; the
//! server answers each request with exactly one reply and, for subscribed
//! connections, interleaves broadcast events. Replies carry `code` 0 (ok) or
//! 1 (error); events carry a `type` tag instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::device::DeviceRecord;

/// Mirror launch overrides accepted by `start_mirror`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorOptions {
    /// Replacement mirror binary for this launch only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_cmd: Option<String>,
    /// Extra arguments appended after the configured ones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

/// A fully classified client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping {
        id: Option<String>,
    },
    Status {
        id: Option<String>,
    },
    Subscribe {
        id: Option<String>,
    },
    StartMirror {
        id: Option<String>,
        serial: String,
        options: MirrorOptions,
    },
    StopMirror {
        id: Option<String>,
        serial: String,
    },
}

impl Request {
    pub fn id(&self) -> Option<&str> {
        match self {
            Request::Ping { id }
            | Request::Status { id }
            | Request::Subscribe { id }
            | Request::StartMirror { id, .. }
            | Request::StopMirror { id, .. } => id.as_deref(),
        }
    }
}

/// Why a request line could not be classified. The embedded id, when one was
/// recoverable, lets the caller correlate the error reply.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestError {
    InvalidJson,
    UnknownRequest { id: Option<String> },
    UnknownCmd { id: Option<String>, cmd: String },
    MissingSerial { id: Option<String> },
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    cmd: Option<String>,
    id: Option<String>,
    serial: Option<String>,
    #[serde(default)]
    options: Option<MirrorOptions>,
}

/// Parse one request line into a classified request or a protocol-level
/// error. Every error except bare invalid JSON keeps the request id so the
/// reply can be correlated.
pub fn parse_request(line: &str) -> Result<Request, RequestError> {
    let raw: RawRequest = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(_) => return Err(RequestError::InvalidJson),
    };
    let id = raw.id;
    let cmd = match raw.cmd {
        Some(cmd) => cmd,
        None => return Err(RequestError::UnknownRequest { id }),
    };
    match cmd.as_str() {
        "ping" => Ok(Request::Ping { id }),
        "status" => Ok(Request::Status { id }),
        "subscribe" => Ok(Request::Subscribe { id }),
        "start_mirror" => match raw.serial {
            Some(serial) if !serial.is_empty() => Ok(Request::StartMirror {
                id,
                serial,
                options: raw.options.unwrap_or_default(),
            }),
            _ => Err(RequestError::MissingSerial { id }),
        },
        "stop_mirror" => match raw.serial {
            Some(serial) if !serial.is_empty() => Ok(Request::StopMirror { id, serial }),
            _ => Err(RequestError::MissingSerial { id }),
        },
        _ => Err(RequestError::UnknownCmd { id, cmd }),
    }
}

/// Closed set of machine-readable error tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorToken {
    MissingSerial,
    AlreadyRunning,
    NotRunning,
    StartFailed,
    StopFailed,
    InvalidJson,
    UnknownRequest,
    UnknownCmd,
}

/// A running mirror process as reported in status replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
}

/// One reply to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Error(ErrorReply),
    Ok(OkReply),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub error: ErrorToken,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OkReply {
    pub code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub payload: ReplyPayload,
}

/// Extra fields flattened into an ok reply. Variant order matters for
/// untagged deserialization: richer shapes first, `Empty` last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyPayload {
    Status {
        devices: Vec<DeviceRecord>,
        processes: BTreeMap<String, ProcessInfo>,
    },
    Snapshot {
        #[serde(rename = "type")]
        kind: SnapshotTag,
        devices: Vec<DeviceRecord>,
    },
    Started {
        pid: u32,
    },
    Pong {
        pong: bool,
    },
    Empty {},
}

/// The subscribe acknowledgement doubles as a state event so subscribers can
/// treat it uniformly with later broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotTag {
    State,
}

impl Reply {
    pub fn ok(id: Option<String>, payload: ReplyPayload) -> Self {
        Reply::Ok(OkReply {
            code: 0,
            id,
            payload,
        })
    }

    pub fn pong(id: Option<String>) -> Self {
        Self::ok(id, ReplyPayload::Pong { pong: true })
    }

    pub fn error(id: Option<String>, error: ErrorToken) -> Self {
        Reply::Error(ErrorReply {
            code: 1,
            id,
            error,
            detail: None,
        })
    }

    pub fn error_with_detail(id: Option<String>, error: ErrorToken, detail: String) -> Self {
        Reply::Error(ErrorReply {
            code: 1,
            id,
            error,
            detail: Some(detail),
        })
    }
}

/// A broadcast pushed to every subscribed connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    /// Single-device delta from the hotplug path.
    Device {
        action: DeviceAction,
        #[serde(skip_serializing_if = "Option::is_none")]
        serial: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        vendor_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        product_id: Option<String>,
    },
    /// Full registry snapshot after a bridge reconciliation changed it.
    State { devices: Vec<DeviceRecord> },
    /// Mirror process lifecycle notification.
    Process {
        action: ProcessAction,
        serial: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        returncode: Option<i32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAction {
    Add,
    Remove,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessAction {
    Exit,
}

/// Anything the server can write on a connection. `Reply` is tried first
/// because the subscribe acknowledgement carries both `code` and `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Reply(Reply),
    Event(Event),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Serialize a message as one line, trailing newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message).map_err(ProtocolError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line into a server message.
pub fn decode_line(line: &str) -> Result<ServerMessage, ProtocolError> {
    serde_json::from_str(line.trim_end()).map_err(ProtocolError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_commands() {
        assert_eq!(
            parse_request(r#"{"cmd":"ping","id":"abc"}"#),
            Ok(Request::Ping {
                id: Some("abc".to_string())
            })
        );
        assert_eq!(parse_request(r#"{"cmd":"status"}"#), Ok(Request::Status { id: None }));
        assert_eq!(
            parse_request(r#"{"cmd":"subscribe"}"#),
            Ok(Request::Subscribe { id: None })
        );
    }

    #[test]
    fn parse_start_mirror_with_options() {
        let request = parse_request(
            r#"{"cmd":"start_mirror","serial":"TEST1234","options":{"args":["--no-audio"]}}"#,
        )
        .unwrap();
        match request {
            Request::StartMirror {
                serial, options, ..
            } => {
                assert_eq!(serial, "TEST1234");
                assert_eq!(options.args.as_deref(), Some(&["--no-audio".to_string()][..]));
                assert!(options.mirror_cmd.is_none());
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn parse_errors_keep_the_request_id() {
        assert_eq!(parse_request("not json"), Err(RequestError::InvalidJson));
        assert_eq!(
            parse_request(r#"{"id":"x"}"#),
            Err(RequestError::UnknownRequest {
                id: Some("x".to_string())
            })
        );
        assert_eq!(
            parse_request(r#"{"cmd":"reboot","id":"x"}"#),
            Err(RequestError::UnknownCmd {
                id: Some("x".to_string()),
                cmd: "reboot".to_string()
            })
        );
        assert_eq!(
            parse_request(r#"{"cmd":"start_mirror","id":"x"}"#),
            Err(RequestError::MissingSerial {
                id: Some("x".to_string())
            })
        );
        assert_eq!(
            parse_request(r#"{"cmd":"stop_mirror","serial":"","id":"x"}"#),
            Err(RequestError::MissingSerial {
                id: Some("x".to_string())
            })
        );
    }

    #[test]
    fn reply_wire_shapes() {
        let line = encode_line(&Reply::pong(Some("1".to_string()))).unwrap();
        assert_eq!(line, "{\"code\":0,\"id\":\"1\",\"pong\":true}\n");

        let line = encode_line(&Reply::error(None, ErrorToken::MissingSerial)).unwrap();
        assert_eq!(line, "{\"code\":1,\"error\":\"missing_serial\"}\n");

        let line = encode_line(&Reply::error_with_detail(
            Some("2".to_string()),
            ErrorToken::StartFailed,
            "no such binary".to_string(),
        ))
        .unwrap();
        assert_eq!(
            line,
            "{\"code\":1,\"id\":\"2\",\"error\":\"start_failed\",\"detail\":\"no such binary\"}\n"
        );
    }

    #[test]
    fn event_wire_shapes() {
        let line = encode_line(&Event::Device {
            action: DeviceAction::Add,
            serial: Some("TEST1234".to_string()),
            vendor_id: Some("18d1".to_string()),
            product_id: None,
        })
        .unwrap();
        assert_eq!(
            line,
            "{\"type\":\"device\",\"action\":\"add\",\"serial\":\"TEST1234\",\"vendor_id\":\"18d1\"}\n"
        );

        let line = encode_line(&Event::Process {
            action: ProcessAction::Exit,
            serial: "TEST1234".to_string(),
            returncode: Some(0),
        })
        .unwrap();
        assert_eq!(
            line,
            "{\"type\":\"process\",\"action\":\"exit\",\"serial\":\"TEST1234\",\"returncode\":0}\n"
        );
    }

    #[test]
    fn decode_classifies_replies_before_events() {
        // Subscribe acknowledgement has both code and type; it must decode
        // as a reply, not a state event.
        let message = decode_line("{\"code\":0,\"type\":\"state\",\"devices\":[]}\n").unwrap();
        match message {
            ServerMessage::Reply(Reply::Ok(reply)) => match reply.payload {
                ReplyPayload::Snapshot { devices, .. } => assert!(devices.is_empty()),
                other => panic!("unexpected payload {other:?}"),
            },
            other => panic!("unexpected message {other:?}"),
        }

        let message = decode_line("{\"type\":\"state\",\"devices\":[]}\n").unwrap();
        assert!(matches!(message, ServerMessage::Event(Event::State { .. })));
    }

    #[test]
    fn decode_status_reply() {
        let message = decode_line(
            "{\"code\":0,\"id\":\"9\",\"devices\":[],\"processes\":{\"TEST1234\":{\"pid\":4242}}}",
        )
        .unwrap();
        match message {
            ServerMessage::Reply(Reply::Ok(reply)) => {
                assert_eq!(reply.id.as_deref(), Some("9"));
                match reply.payload {
                    ReplyPayload::Status { processes, .. } => {
                        assert_eq!(processes["TEST1234"].pid, 4242);
                    }
                    other => panic!("unexpected payload {other:?}"),
                }
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
