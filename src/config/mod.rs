//! Application configuration loaded from environment.

use std::net::SocketAddr;
use std::time::Duration;

use crate::services::presence::{
    PresenceConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PRESENCE_TTL,
};

/// Application configuration loaded from `.env` and environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g. `0.0.0.0:3000`).
    pub server_addr: SocketAddr,
    /// Log level: `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
    /// Heartbeat interval and TTL. Read once at startup.
    pub presence: PresenceConfig,
}

impl Config {
    /// Load configuration from environment. Call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let server_addr = std::env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let server_addr: SocketAddr = server_addr
            .parse()
            .map_err(|_| ConfigLoadError::InvalidServerAddr)?;

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let heartbeat_interval = duration_var("PRESENCE_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_INTERVAL)?;
        let ttl = duration_var("PRESENCE_TTL_SECS", DEFAULT_PRESENCE_TTL)?;
        let presence = PresenceConfig {
            heartbeat_interval,
            ttl,
        };
        presence.validate()?;

        Ok(Self {
            server_addr,
            log_level,
            presence,
        })
    }
}

fn duration_var(name: &'static str, default: Duration) -> Result<Duration, ConfigLoadError> {
    match std::env::var(name) {
        Ok(raw) => parse_secs(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_secs(name: &'static str, raw: &str) -> Result<Duration, ConfigLoadError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigLoadError::InvalidNumber(name))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Invalid SERVER_ADDR")]
    InvalidServerAddr,

    #[error("Invalid {0}: expected whole seconds")]
    InvalidNumber(&'static str),

    #[error("Heartbeat interval must be non-zero")]
    ZeroHeartbeatInterval,

    #[error("Presence TTL ({ttl:?}) must be greater than the heartbeat interval ({interval:?})")]
    TtlNotAboveInterval { ttl: Duration, interval: Duration },
}
