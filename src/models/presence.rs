//! Presence snapshot and stats shapes exposed to the transport layer.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// One present user in a room snapshot. Field names are part of the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub id: String,
    pub name: String,
    /// Serialized as `null` when the user has no avatar.
    pub avatar: Option<String>,
    pub idle: bool,
}

/// Store introspection for dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceStats {
    pub total_users: usize,
    pub total_rooms: usize,
    pub total_entries: usize,
    /// Fixed per-entry estimate times entry count; not a measurement.
    pub approx_memory_bytes: usize,
}

/// HTTP body for `POST /rooms/:room/heartbeat`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct HeartbeatRequest {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(url)]
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub idle: bool,
}
