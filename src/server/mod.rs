//! Network surface for sigbridge.
//!
//! Serves:
//! - WebSocket protocol at `/ws` (capture control, watches, live updates)
//! - REST device listing at `/api/v0/devices`
//! - Service info at `/` and `/version`
//!
//! Handlers never touch capture state directly; everything goes through the
//! engine's message channel.

pub mod engine;
pub mod error;
pub mod session;

use crate::config::Config;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{Json, Response},
    routing::get,
    Router,
};
use engine::EngineMsg;
use error::ApiError;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tower::ServiceBuilder;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ServerState {
    engine_tx: mpsc::Sender<EngineMsg>,
}

pub struct ApiServer {
    bind: String,
    port: u16,
    state: ServerState,
}

impl ApiServer {
    pub fn new(engine_tx: mpsc::Sender<EngineMsg>, config: &Config) -> Self {
        Self {
            bind: config.server.bind.clone(),
            port: config.server.port,
            state: ServerState { engine_tx },
        }
    }

    pub async fn start(self) -> Result<()> {
        let app = Router::new()
            .route("/", get(service_info))
            .route("/version", get(version))
            .route("/ws", get(ws_upgrade))
            .route("/api/v0/devices", get(devices))
            .fallback(not_found)
            .with_state(self.state)
            .layer(ServiceBuilder::new());

        let listener = tokio::net::TcpListener::bind(format!("{}:{}", self.bind, self.port)).await?;

        info!("server listening on http://{}:{}", self.bind, self.port);
        info!("Endpoints:");
        info!("  GET /                - Service info");
        info!("  GET /version         - Version info");
        info!("  GET /ws              - WebSocket protocol");
        info!("  GET /api/v0/devices  - Attached device listing");

        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn service_info() -> Json<Value> {
    Json(json!({
        "service": "sigbridge",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "name": "sigbridge"
    }))
}

/// Same device array as the `devices` push message.
async fn devices(State(state): State<ServerState>) -> Result<Json<Value>, ApiError> {
    let (reply, response) = oneshot::channel();
    state
        .engine_tx
        .send(EngineMsg::DeviceList { reply })
        .await
        .map_err(|_| ApiError::internal("engine unavailable"))?;
    let devices = response
        .await
        .map_err(|_| ApiError::internal("engine unavailable"))?;
    Ok(Json(json!(devices)))
}

/// Unknown paths and unsupported API versions land here.
async fn not_found() -> ApiError {
    ApiError::not_found("not found")
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Pumps one WebSocket connection: outbound pushes come from the engine via
/// an unbounded per-client queue, inbound text is forwarded as-is. Parsing
/// and dispatch happen on the engine thread.
async fn handle_socket(socket: WebSocket, state: ServerState) {
    let id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    if state
        .engine_tx
        .send(EngineMsg::ClientConnected { id, out: out_tx })
        .await
        .is_err()
    {
        warn!(client = %id, "engine unavailable, dropping connection");
        return;
    }
    info!(client = %id, "WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if state
                    .engine_tx
                    .send(EngineMsg::ClientMessage { id, text })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                debug!(client = %id, "close frame received");
                break;
            }
            Ok(_) => {} // ping/pong handled by axum, binary ignored
            Err(e) => {
                debug!(client = %id, "WebSocket error: {e}");
                break;
            }
        }
    }

    let _ = state
        .engine_tx
        .send(EngineMsg::ClientDisconnected { id })
        .await;
    writer.abort();
    info!(client = %id, "WebSocket connection closed");
}
