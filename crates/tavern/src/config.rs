//! Server configuration.
//!
//! Defaults are compiled in; [`ServerConfig::from_env`] overrides them
//! from `TAVERN_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tavern_room::RoomConfig;

pub const ENV_BIND: &str = "TAVERN_BIND";
pub const ENV_HANDSHAKE_TIMEOUT: &str = "TAVERN_HANDSHAKE_TIMEOUT_SECS";
pub const ENV_HEARTBEAT_TIMEOUT: &str = "TAVERN_HEARTBEAT_TIMEOUT_SECS";
pub const ENV_REAP_INTERVAL: &str = "TAVERN_REAP_INTERVAL_SECS";
pub const ENV_IDLE_TIMEOUT: &str = "TAVERN_IDLE_TIMEOUT_SECS";

/// Errors found while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A duration variable wasn't a whole number of seconds.
    #[error("{key} must be a whole number of seconds, got '{value}'")]
    InvalidSeconds { key: &'static str, value: String },

    /// A value parsed but can't be used.
    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Everything a [`TavernServer`](crate::TavernServer) needs to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,

    /// How long a new connection has to send its handshake.
    pub handshake_timeout: Duration,

    /// A connection that sends nothing (not even a heartbeat) for this
    /// long is closed.
    pub heartbeat_timeout: Duration,

    /// How often the reaper looks for idle rooms.
    pub reap_interval: Duration,

    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            reap_interval: Duration::from_secs(60),
            room: RoomConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by whichever `TAVERN_*` variables are set.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a variable is set but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through
    /// `lookup` instead of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_BIND) {
            let addr = addr.trim();
            if addr.is_empty() {
                return Err(ConfigError::Invalid {
                    key: ENV_BIND,
                    reason: "bind address is empty".into(),
                });
            }
            config.bind_addr = addr.to_string();
        }
        if let Some(value) = lookup(ENV_HANDSHAKE_TIMEOUT) {
            config.handshake_timeout = parse_secs(ENV_HANDSHAKE_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_HEARTBEAT_TIMEOUT) {
            config.heartbeat_timeout = parse_secs(ENV_HEARTBEAT_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_REAP_INTERVAL) {
            config.reap_interval = parse_secs(ENV_REAP_INTERVAL, &value)?;
            if config.reap_interval.is_zero() {
                return Err(ConfigError::Invalid {
                    key: ENV_REAP_INTERVAL,
                    reason: "reap interval must be positive".into(),
                });
            }
        }
        if let Some(value) = lookup(ENV_IDLE_TIMEOUT) {
            config.room.idle_timeout = parse_secs(ENV_IDLE_TIMEOUT, &value)?;
        }

        Ok(config)
    }
}

fn parse_secs(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::InvalidSeconds {
            key,
            value: value.to_string(),
        })
}
