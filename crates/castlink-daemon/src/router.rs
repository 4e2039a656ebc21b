//! Request dispatch

use std::sync::Arc;

use tracing::warn;

use castlink_core::protocol::{
    ErrorToken, Reply, ReplyPayload, Request, RequestError, SnapshotTag,
};

use crate::state::DaemonState;
use crate::supervisor::{StartError, StopError};

/// Answer one classified request. Subscription bookkeeping lives in the
/// connection handler; this only produces the reply line.
pub async fn handle_request(state: &Arc<DaemonState>, request: &Request) -> Reply {
    match request {
        Request::Ping { id } => Reply::pong(id.clone()),
        Request::Status { id } => {
            let devices = state.snapshot().await;
            let processes = state.supervisor.processes().await;
            Reply::ok(id.clone(), ReplyPayload::Status { devices, processes })
        }
        Request::Subscribe { id } => {
            // Acknowledged with a snapshot shaped like a state event, so
            // subscribers handle it and later broadcasts uniformly.
            let devices = state.snapshot().await;
            Reply::ok(
                id.clone(),
                ReplyPayload::Snapshot {
                    kind: SnapshotTag::State,
                    devices,
                },
            )
        }
        Request::StartMirror {
            id,
            serial,
            options,
        } => match state.supervisor.start(serial, options).await {
            Ok(pid) => Reply::ok(id.clone(), ReplyPayload::Started { pid }),
            Err(StartError::AlreadyRunning(_)) => {
                Reply::error(id.clone(), ErrorToken::AlreadyRunning)
            }
            Err(err @ StartError::Spawn { .. }) => {
                warn!(serial, error = %err, "mirror start failed");
                Reply::error_with_detail(id.clone(), ErrorToken::StartFailed, err.to_string())
            }
        },
        Request::StopMirror { id, serial } => match state.supervisor.stop(serial).await {
            Ok(()) => Reply::ok(id.clone(), ReplyPayload::Empty {}),
            Err(StopError::NotRunning(_)) => Reply::error(id.clone(), ErrorToken::NotRunning),
            Err(err @ StopError::Unkillable(_)) => {
                warn!(serial, error = %err, "mirror stop failed");
                Reply::error_with_detail(id.clone(), ErrorToken::StopFailed, err.to_string())
            }
        },
    }
}

/// Map a parse failure to its error reply.
pub fn reply_for_parse_error(error: RequestError) -> Reply {
    match error {
        RequestError::InvalidJson => Reply::error(None, ErrorToken::InvalidJson),
        RequestError::UnknownRequest { id } => Reply::error(id, ErrorToken::UnknownRequest),
        RequestError::MissingSerial { id } => Reply::error(id, ErrorToken::MissingSerial),
        RequestError::UnknownCmd { id, cmd } => {
            Reply::error_with_detail(id, ErrorToken::UnknownCmd, cmd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use castlink_core::protocol::parse_request;
    use castlink_core::signal::{HotplugAction, HotplugSignal};

    #[tokio::test]
    async fn ping_answers_pong_with_id() {
        let state = DaemonState::new(Config::default());
        let reply = handle_request(
            &state,
            &Request::Ping {
                id: Some("7".to_string()),
            },
        )
        .await;
        let line = castlink_core::protocol::encode_line(&reply).unwrap();
        assert_eq!(line, "{\"code\":0,\"id\":\"7\",\"pong\":true}\n");
    }

    #[tokio::test]
    async fn status_reports_devices_and_processes() {
        let state = DaemonState::new(Config::default());
        let mut signal = HotplugSignal::new(HotplugAction::Add);
        signal.serial = Some("TEST1234".to_string());
        state.apply_hotplug(&signal).await;

        let reply = handle_request(&state, &Request::Status { id: None }).await;
        match reply {
            Reply::Ok(ok) => match ok.payload {
                ReplyPayload::Status { devices, processes } => {
                    assert_eq!(devices.len(), 1);
                    assert!(processes.is_empty());
                }
                other => panic!("unexpected payload {other:?}"),
            },
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_without_mirror_maps_to_not_running() {
        let state = DaemonState::new(Config::default());
        let reply = handle_request(
            &state,
            &Request::StopMirror {
                id: None,
                serial: "TEST1234".to_string(),
            },
        )
        .await;
        let line = castlink_core::protocol::encode_line(&reply).unwrap();
        assert_eq!(line, "{\"code\":1,\"error\":\"not_running\"}\n");
    }

    #[test]
    fn parse_errors_map_to_tokens() {
        let reply = reply_for_parse_error(parse_request("garbage").unwrap_err());
        let line = castlink_core::protocol::encode_line(&reply).unwrap();
        assert_eq!(line, "{\"code\":1,\"error\":\"invalid_json\"}\n");

        let reply =
            reply_for_parse_error(parse_request(r#"{"cmd":"frobnicate","id":"3"}"#).unwrap_err());
        let line = castlink_core::protocol::encode_line(&reply).unwrap();
        assert_eq!(
            line,
            "{\"code\":1,\"id\":\"3\",\"error\":\"unknown_cmd\",\"detail\":\"frobnicate\"}\n"
        );
    }
}
