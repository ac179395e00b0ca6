//! WebSocket handler: heartbeats, leaves, and presence snapshot forwarding per room.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use validator::Validate;

use crate::error::AppError;
use crate::handlers::http::{snapshot_changed, AppState};
use crate::models::event::{ClientMessage, HeartbeatPayload};

const MAX_USER_ID_LEN: usize = 128;

/// Identity supplied at connect time. Authentication happens upstream.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ConnectParams {
    pub user_id: String,
    #[validate(length(min = 1, max = 255))]
    #[serde(default)]
    pub name: Option<String>,
    #[validate(url)]
    #[serde(default)]
    pub avatar: Option<String>,
}

impl ConnectParams {
    fn check(&self) -> Result<(), AppError> {
        validate_user_id(&self.user_id)?;
        self.validate()?;
        Ok(())
    }
}

/// Upgrade HTTP to WebSocket once the connecting identity looks sane.
///
/// The upgrade is extracted as optional so identity errors surface as 400 before
/// the upgrade check runs.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, AppError> {
    params.check()?;
    let ws = ws.ok_or(AppError::UpgradeRequired)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, params)))
}

pub(crate) fn validate_user_id(user_id: &str) -> Result<(), AppError> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_USER_ID_LEN {
        return Err(AppError::Validation(format!(
            "user_id must be 1..={} characters",
            MAX_USER_ID_LEN
        )));
    }
    Ok(())
}

/// Per-room state of one connection.
struct Joined {
    forward: JoinHandle<()>,
}

impl Joined {
    /// Abort the forwarder and wait, so its receiver is gone before `release`.
    async fn stop(self) {
        self.forward.abort();
        let _ = self.forward.await;
    }
}

async fn handle_socket(state: AppState, socket: WebSocket, params: ConnectParams) {
    let connection_id = Uuid::new_v4();
    let user_id = params.user_id.trim().to_string();
    let default_name = params.name.clone().unwrap_or_else(|| user_id.clone());
    info!(connection_id = %connection_id, user_id = %user_id, "ws connected");

    let (mut sender, mut receiver) = socket.split();
    let mut joined: HashMap<String, Joined> = HashMap::new();

    let config = state.presence().config();
    let conn_msg = json!({
        "event": "connection_established",
        "data": {
            "connection_id": connection_id,
            "heartbeat_interval_secs": config.heartbeat_interval.as_secs(),
            "ttl_secs": config.ttl.as_secs(),
        }
    });
    if sender.send(Message::Text(conn_msg.to_string())).await.is_err() {
        return;
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Heartbeat { data }) => {
                    if let Err(e) = data.validate() {
                        debug!(connection_id = %connection_id, error = %e, "invalid heartbeat");
                        let _ = tx.send(error_event(&format!("Invalid heartbeat: {}", e)));
                        continue;
                    }
                    on_heartbeat(&state, &tx, &mut joined, &user_id, &default_name, &params, data)
                        .await;
                }
                Ok(ClientMessage::Leave { data }) => {
                    state.presence().leave(&data.room, &user_id).await;
                    if let Some(j) = joined.remove(&data.room) {
                        j.stop().await;
                    }
                    state.rooms().release(&data.room).await;
                    state.announce(&data.room).await;
                    debug!(connection_id = %connection_id, room = %data.room, "left");
                }
                Ok(ClientMessage::Ping) => {
                    let pong = json!({ "event": "pong", "data": {} });
                    let _ = tx.send(pong.to_string());
                }
                Err(e) => {
                    debug!(connection_id = %connection_id, error = %e, "bad client message");
                    let _ = tx.send(error_event(&format!("Invalid message: {}", e)));
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    let rooms = state.presence().leave_all(&user_id).await;
    for (room, j) in joined.drain() {
        j.stop().await;
        state.rooms().release(&room).await;
    }
    for room in &rooms {
        state.announce(room).await;
    }

    send_task.abort();
    info!(connection_id = %connection_id, user_id = %user_id, rooms = rooms.len(), "ws disconnected");
}

fn error_event(message: &str) -> String {
    json!({ "event": "error", "data": { "message": message } }).to_string()
}

async fn on_heartbeat(
    state: &AppState,
    tx: &tokio::sync::mpsc::UnboundedSender<String>,
    joined: &mut HashMap<String, Joined>,
    user_id: &str,
    default_name: &str,
    params: &ConnectParams,
    data: HeartbeatPayload,
) {
    let name = data.name.as_deref().unwrap_or(default_name);
    let avatar = data.avatar.as_deref().or(params.avatar.as_deref());
    let previous = state.presence().member(&data.room, user_id).await;
    state
        .presence()
        .heartbeat(&data.room, user_id, name, avatar, data.idle)
        .await;

    if !joined.contains_key(&data.room) {
        let mut room_rx = state.rooms().subscribe(&data.room).await;
        let tx_fwd = tx.clone();
        let forward = tokio::spawn(async move {
            loop {
                match room_rx.recv().await {
                    Ok(payload) => {
                        if tx_fwd.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "room listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        joined.insert(data.room.clone(), Joined { forward });
        // This connection just subscribed and has not seen the room yet.
        state.announce(&data.room).await;
    } else if snapshot_changed(previous.map(|m| m.idle), data.idle) {
        state.announce(&data.room).await;
    }
}
