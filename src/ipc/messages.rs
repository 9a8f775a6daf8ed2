//! Message shapes exchanged with the UI: request bodies, reply payloads and
//! push notifications.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::supervisor::error::SupervisorError;
use crate::supervisor::{ServerState, SupervisorEvent};

/// Push channel carrying `{status, launchTime?}`
pub const CASPAR_CONNECTION: &str = "caspar-connection";
/// Push channel carrying `{message}`
pub const SERVER_LOG: &str = "server-log";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub should_connect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

/// One notification for the UI, named by its channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    pub channel: &'static str,
    pub payload: Value,
}

impl Push {
    pub fn from_event(event: &SupervisorEvent) -> Self {
        match event {
            SupervisorEvent::StatusChanged { is_running, launch_time } => Self {
                channel: CASPAR_CONNECTION,
                payload: status_payload(*is_running, launch_time.as_ref()),
            },
            SupervisorEvent::Log(line) => Self {
                channel: SERVER_LOG,
                payload: json!({ "message": line.content }),
            },
        }
    }
}

fn status_payload(is_running: bool, launch_time: Option<&chrono::DateTime<chrono::Utc>>) -> Value {
    let mut payload = json!({ "status": is_running });
    if let Some(time) = launch_time {
        payload["launchTime"] = json!(time);
    }
    payload
}

/// `{status, launchTime?}`, the same shape as the `caspar-connection` push.
pub fn status_reply(state: &ServerState) -> Value {
    status_payload(state.is_running, state.launch_time.as_ref())
}

/// Failed connection/status replies: `{status: null, error, code}`.
pub fn status_error(err: &SupervisorError) -> Value {
    json!({
        "status": null,
        "error": err.to_string(),
        "code": err.error_code(),
    })
}

/// 잘못된 요청 본문 (`{error: true, message, code: "INVALID_REQUEST"}`)
pub fn invalid_request(message: &str) -> Value {
    json!({
        "error": true,
        "message": message,
        "code": "INVALID_REQUEST",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::console::{LogLevel, LogLine, LogSource};
    use crate::supervisor::state_machine::State;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_status_push_shape() {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let push = Push::from_event(&SupervisorEvent::StatusChanged {
            is_running: true,
            launch_time: Some(time),
        });
        assert_eq!(push.channel, CASPAR_CONNECTION);
        assert_eq!(push.payload["status"], true);
        assert_eq!(push.payload["launchTime"], "2024-05-01T12:00:00Z");

        let stopped = Push::from_event(&SupervisorEvent::StatusChanged {
            is_running: false,
            launch_time: None,
        });
        assert_eq!(stopped.payload, json!({ "status": false }));
    }

    #[test]
    fn test_status_reply_matches_push() {
        let state = ServerState {
            is_running: false,
            launch_time: None,
            install_dir: None,
            state: State::Stopped,
            pid: None,
        };
        let push = Push::from_event(&SupervisorEvent::StatusChanged {
            is_running: false,
            launch_time: None,
        });
        assert_eq!(status_reply(&state), push.payload);
    }

    #[test]
    fn test_log_push() {
        let line = LogLine {
            id: 1,
            timestamp: Utc::now(),
            source: LogSource::Stdout,
            content: "[info] Initialized".to_string(),
            level: LogLevel::Info,
        };
        let push = Push::from_event(&SupervisorEvent::Log(line));
        assert_eq!(push.channel, SERVER_LOG);
        assert_eq!(push.payload, json!({ "message": "[info] Initialized" }));
    }

    #[test]
    fn test_status_error_shape() {
        let body = status_error(&SupervisorError::UnmanagedInstance { pid: 42 });
        assert!(body["status"].is_null());
        assert_eq!(body["code"], "UNMANAGED_INSTANCE");
        assert!(body["error"].as_str().unwrap().contains("42"));
    }

    #[test]
    fn test_connection_request_camel_case() {
        let req: ConnectionRequest = serde_json::from_value(json!({ "shouldConnect": true })).unwrap();
        assert!(req.should_connect);
    }
}
