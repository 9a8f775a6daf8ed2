//! Transport-independent request handling.
//!
//! Each operation maps to one supervisor call and produces a [`Reply`] whose
//! body already has the shape the UI expects. Push notifications come from
//! the supervisor's event bus, not from these replies.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::messages::{status_error, status_reply, CommandRequest, ConnectionRequest};
use crate::path_detector::find_configuration_files;
use crate::supervisor::error::SupervisorError;
use crate::supervisor::{Supervisor, SupervisorEvent};

#[derive(Debug)]
pub enum Reply {
    Ok(Value),
    Failed { error: SupervisorError, body: Value },
}

impl Reply {
    fn failed(error: SupervisorError) -> Self {
        let body = error.to_json();
        Self::Failed { error, body }
    }

    fn status_failed(error: SupervisorError) -> Self {
        let body = status_error(&error);
        Self::Failed { error, body }
    }

    pub fn body(&self) -> &Value {
        match self {
            Self::Ok(body) | Self::Failed { body, .. } => body,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Ok(body) => (StatusCode::OK, Json(body)).into_response(),
            Self::Failed { error, body } => (error.status_code(), Json(body)).into_response(),
        }
    }
}

pub struct RequestBridge {
    supervisor: Arc<Supervisor>,
}

impl RequestBridge {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.supervisor.subscribe()
    }

    /// Connection toggle: launch or terminate.
    pub async fn connection(&self, req: ConnectionRequest) -> Reply {
        let result = if req.should_connect {
            self.supervisor.launch().await
        } else {
            self.supervisor.terminate().await
        };
        match result {
            Ok(state) => Reply::Ok(status_reply(&state)),
            Err(e) => {
                tracing::warn!("Connection toggle (connect={}) failed: {}", req.should_connect, e);
                Reply::status_failed(e)
            }
        }
    }

    pub async fn status(&self) -> Reply {
        match self.supervisor.check_status().await {
            Ok(state) => Reply::Ok(status_reply(&state)),
            Err(e) => Reply::status_failed(e),
        }
    }

    /// Replies as soon as the line is queued for the server's stdin.
    pub async fn command(&self, req: CommandRequest) -> Reply {
        match self.supervisor.send_command(&req.command).await {
            Ok(()) => Reply::Ok(json!({ "result": true })),
            Err(e) => Reply::failed(e),
        }
    }

    pub async fn info(&self) -> Reply {
        match self.supervisor.version().await {
            Ok(version) => Reply::Ok(json!({ "version": version })),
            Err(e) => Reply::failed(e),
        }
    }

    pub async fn restart(&self) -> Reply {
        match self.supervisor.restart().await {
            Ok(state) => Reply::Ok(status_reply(&state)),
            Err(e) => Reply::status_failed(e),
        }
    }

    pub fn console(&self, since: Option<u64>, count: Option<usize>) -> Reply {
        let lines = self.supervisor.console(since, count);
        Reply::Ok(json!({ "lines": lines }))
    }

    /// `*.config` files in the install directory.
    pub async fn server_configs(&self) -> Reply {
        let dir = match self.supervisor.install_dir().await {
            Ok(dir) => dir,
            Err(e) => return Reply::failed(e),
        };
        let configs = tokio::task::spawn_blocking({
            let dir = dir.clone();
            move || find_configuration_files(&dir)
        })
        .await
        .unwrap_or_default();
        Reply::Ok(json!({
            "path": dir.display().to_string(),
            "configs": configs,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_detector::ProcessLocator;
    use crate::process_monitor::StaticProcessTable;
    use crate::supervisor::SupervisorSettings;
    use std::time::Duration;

    fn bridge(running: &[&str], install_dir: Option<&str>) -> RequestBridge {
        let locator = ProcessLocator::new(
            "app.exe",
            Arc::new(StaticProcessTable::with_names(running)),
            Duration::from_secs(1),
        );
        let settings = SupervisorSettings {
            install_dir: install_dir.map(String::from),
            ..Default::default()
        };
        RequestBridge::new(Arc::new(Supervisor::new(locator, settings)))
    }

    #[tokio::test]
    async fn test_status_while_stopped() {
        let reply = bridge(&[], None).status().await;
        assert!(reply.is_ok());
        assert_eq!(reply.body(), &json!({ "status": false }));
    }

    #[tokio::test]
    async fn test_status_with_unmanaged_instance() {
        let reply = bridge(&["app.exe"], None).status().await;
        assert!(!reply.is_ok());
        assert!(reply.body()["status"].is_null());
        assert_eq!(reply.body()["code"], "UNMANAGED_INSTANCE");
    }

    #[tokio::test]
    async fn test_disconnect_while_stopped() {
        let reply = bridge(&[], None)
            .connection(ConnectionRequest { should_connect: false })
            .await;
        assert!(reply.body()["status"].is_null());
        assert_eq!(reply.body()["code"], "NOT_RUNNING");
    }

    #[tokio::test]
    async fn test_command_while_stopped() {
        let reply = bridge(&[], None)
            .command(CommandRequest { command: "INFO".to_string() })
            .await;
        assert_eq!(reply.body()["error"], true);
        assert_eq!(reply.body()["code"], "NOT_RUNNING");

        let response = reply.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_info_while_stopped() {
        let reply = bridge(&[], None).info().await;
        assert_eq!(reply.body()["code"], "NOT_RUNNING");
    }

    #[tokio::test]
    async fn test_server_configs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("casparcg.config"), b"<configuration/>").unwrap();
        let reply = bridge(&[], dir.path().to_str()).server_configs().await;
        assert!(reply.is_ok());
        assert_eq!(reply.body()["configs"], json!(["casparcg.config"]));
    }

    #[tokio::test]
    async fn test_console_starts_empty() {
        let reply = bridge(&[], None).console(None, None);
        assert_eq!(reply.body(), &json!({ "lines": [] }));
    }
}
