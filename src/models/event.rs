//! Event and message models for the WebSocket transport.

use serde::{Deserialize, Serialize};
use validator::Validate;

pub const MAX_ROOM_LEN: usize = 128;
// `validator` length bounds are u64.
const MAX_ROOM_LEN_U64: u64 = MAX_ROOM_LEN as u64;

/// Event sent over WebSocket to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    pub event: String,
    pub room: String,
    pub data: serde_json::Value,
}

/// WebSocket client message: heartbeat / leave / ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientMessage {
    Heartbeat { data: HeartbeatPayload },
    Leave { data: LeavePayload },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HeartbeatPayload {
    #[validate(length(min = 1, max = MAX_ROOM_LEN_U64))]
    pub room: String,
    #[serde(default)]
    pub idle: bool,
    /// Overrides the display name given at connect time.
    #[validate(length(min = 1, max = 255))]
    #[serde(default)]
    pub name: Option<String>,
    #[validate(url)]
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeavePayload {
    pub room: String,
}
