pub mod bridge;
pub mod messages;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use bridge::RequestBridge;
use messages::{invalid_request, CommandRequest, ConnectionRequest, Push};

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub bridge: Arc<RequestBridge>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(bridge: Arc<RequestBridge>, listen_addr: &str) -> Self {
        Self {
            bridge,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/connection", post(connection_handler))
            .route("/api/status", get(status_handler))
            .route("/api/command", post(command_handler))
            .route("/api/info", get(info_handler))
            .route("/api/restart", post(restart_handler))
            .route("/api/console", get(console_handler))
            .route("/api/server/configs", get(configs_handler))
            .route("/api/events", get(events_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);
        let router = self.router();

        // TCP 리스너
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

/// POST /api/connection — `{shouldConnect}` launches or terminates the server
async fn connection_handler(
    State(state): State<IPCServer>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let req: ConnectionRequest = match serde_json::from_value(payload) {
        Ok(req) => req,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(invalid_request("Missing 'shouldConnect' field")),
            )
                .into_response()
        }
    };
    state.bridge.connection(req).await.into_response()
}

/// GET /api/status
async fn status_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    state.bridge.status().await
}

/// POST /api/command — write one line to the server's stdin
async fn command_handler(
    State(state): State<IPCServer>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let command = match payload.get("command").and_then(|v| v.as_str()) {
        Some(cmd) => cmd.to_string(),
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(invalid_request("Missing 'command' field")),
            )
                .into_response()
        }
    };
    state.bridge.command(CommandRequest { command }).await.into_response()
}

/// GET /api/info — server version, read back from stdout
async fn info_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    state.bridge.info().await
}

/// POST /api/restart
async fn restart_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    state.bridge.restart().await
}

/// GET /api/console?since=0&count=100
async fn console_handler(
    State(state): State<IPCServer>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let since = params.get("since").and_then(|s| s.parse::<u64>().ok());
    let count = params.get("count").and_then(|c| c.parse::<usize>().ok());
    state.bridge.console(since, count)
}

/// GET /api/server/configs
async fn configs_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    state.bridge.server_configs().await
}

/// GET /api/events — SSE stream; the event name is the push channel
async fn events_handler(
    State(state): State<IPCServer>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bridge.subscribe();
    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let push = Push::from_event(&event);
                    let sse = Event::default()
                        .event(push.channel)
                        .data(push.payload.to_string());
                    return Some((Ok(sse), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event subscriber lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
