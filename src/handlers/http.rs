//! HTTP handlers: presence queries and mutations, stats, health.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use tracing::warn;
use validator::Validate;

use crate::error::AppError;
use crate::models::event::MAX_ROOM_LEN;
use crate::models::presence::{HeartbeatRequest, PresenceStats, PresenceUser};
use crate::services::{PresenceStore, RoomHub};

/// Shared application state for HTTP and WS handlers.
#[derive(Clone)]
pub struct AppState {
    pub presence: PresenceStore,
    pub rooms: RoomHub,
}

impl AppState {
    pub fn new(presence: PresenceStore) -> Self {
        Self {
            presence,
            rooms: RoomHub::new(),
        }
    }

    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    pub fn rooms(&self) -> &RoomHub {
        &self.rooms
    }

    /// Best-effort snapshot push; a failure here never fails the caller's request.
    pub(crate) async fn announce(&self, room: &str) {
        if let Err(e) = self.rooms.announce(&self.presence, room).await {
            warn!(room = %room, error = %e, "announce failed");
        }
    }
}

/// A heartbeat changes the room snapshot when the user was not visible before
/// (`previous_idle` is `None`) or flipped idle. Plain refreshes are not announced.
pub(crate) fn snapshot_changed(previous_idle: Option<bool>, idle: bool) -> bool {
    previous_idle != Some(idle)
}

pub(crate) fn validate_room(room: &str) -> Result<(), AppError> {
    if room.is_empty() || room.len() > MAX_ROOM_LEN {
        return Err(AppError::Validation(format!(
            "room must be 1..={} characters",
            MAX_ROOM_LEN
        )));
    }
    Ok(())
}

/// GET /rooms/:room/presence
pub async fn room_presence(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> Json<Vec<PresenceUser>> {
    Json(state.presence().get_presence(&room).await)
}

/// POST /rooms/:room/heartbeat: record a heartbeat and return the room snapshot.
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Json(body): Json<HeartbeatRequest>,
) -> Result<Json<Vec<PresenceUser>>, AppError> {
    validate_room(&room)?;
    body.validate()?;
    let previous = state.presence().member(&room, &body.user_id).await;
    state
        .presence()
        .heartbeat(&room, &body.user_id, &body.name, body.avatar.as_deref(), body.idle)
        .await;
    if snapshot_changed(previous.map(|m| m.idle), body.idle) {
        state.announce(&room).await;
    }
    Ok(Json(state.presence().get_presence(&room).await))
}

/// GET /rooms/:room/users/:user
pub async fn user_in_room(
    State(state): State<AppState>,
    Path((room, user)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    let present = state.presence().is_present(&room, &user).await;
    Json(json!({ "room": room, "user": user, "present": present }))
}

/// DELETE /rooms/:room/users/:user
pub async fn leave_room(
    State(state): State<AppState>,
    Path((room, user)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    state.presence().leave(&room, &user).await;
    state.announce(&room).await;
    Json(json!({ "ok": true, "room": room, "user": user }))
}

/// GET /users/:user/rooms
pub async fn user_rooms(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Json<serde_json::Value> {
    let rooms = state.presence().get_user_rooms(&user).await;
    Json(json!({ "user": user, "rooms": rooms }))
}

/// DELETE /users/:user: remove the user everywhere; returns the rooms left.
pub async fn leave_all(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Json<serde_json::Value> {
    let rooms = state.presence().leave_all(&user).await;
    for room in &rooms {
        state.announce(room).await;
    }
    Json(json!({ "user": user, "rooms": rooms }))
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Json<PresenceStats> {
    Json(state.presence().get_stats().await)
}

/// GET /health: liveness probe.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let sweeper = if state.presence().is_running().await {
        "running"
    } else {
        "stopped"
    };
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "presence-hub", "sweeper": sweeper })),
    )
}
