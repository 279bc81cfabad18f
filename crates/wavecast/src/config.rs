//! Broker configuration.
//!
//! Heartbeat and deadline values are related: a connection must be able to
//! complete at least one ping/pong round-trip before its read deadline can
//! lapse, so `write_timeout < heartbeat_interval < read_timeout` is enforced
//! by [`SocketConfig::validate`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Per-connection transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Seconds without any inbound frame before a connection is considered dead.
    pub read_timeout_secs: u64,
    /// Seconds between outbound ping frames.
    pub heartbeat_interval_secs: u64,
    /// Seconds allowed for a single outbound frame write.
    pub write_timeout_secs: u64,
    /// Maximum inbound payload size in bytes; larger frames kill the connection.
    pub max_frame_bytes: usize,
    /// Capacity of each connection's bounded outbound queue.
    pub send_queue_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 60,
            heartbeat_interval_secs: 54,
            write_timeout_secs: 10,
            max_frame_bytes: 64 * 1024, // 64KB
            send_queue_size: 512,
        }
    }
}

impl SocketConfig {
    /// Load configuration from `WAVECAST_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            read_timeout_secs: parse_env("WAVECAST_READ_TIMEOUT", "read_timeout_secs", 60)?,
            heartbeat_interval_secs: parse_env(
                "WAVECAST_HEARTBEAT_INTERVAL",
                "heartbeat_interval_secs",
                54,
            )?,
            write_timeout_secs: parse_env("WAVECAST_WRITE_TIMEOUT", "write_timeout_secs", 10)?,
            max_frame_bytes: parse_env("WAVECAST_MAX_FRAME_BYTES", "max_frame_bytes", 64 * 1024)?,
            send_queue_size: parse_env("WAVECAST_SEND_QUEUE_SIZE", "send_queue_size", 512)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed {
                field: "read_timeout_secs",
                reason: "read timeout must be greater than 0".to_string(),
            });
        }

        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed {
                field: "heartbeat_interval_secs",
                reason: "heartbeat interval must be greater than 0".to_string(),
            });
        }

        if self.heartbeat_interval_secs >= self.read_timeout_secs {
            return Err(ConfigError::ValidationFailed {
                field: "heartbeat_interval_secs",
                reason: format!(
                    "heartbeat interval ({}s) must be shorter than the read timeout ({}s)",
                    self.heartbeat_interval_secs, self.read_timeout_secs
                ),
            });
        }

        if self.write_timeout_secs == 0 || self.write_timeout_secs >= self.heartbeat_interval_secs {
            return Err(ConfigError::ValidationFailed {
                field: "write_timeout_secs",
                reason: format!(
                    "write timeout ({}s) must be non-zero and shorter than the heartbeat interval ({}s)",
                    self.write_timeout_secs, self.heartbeat_interval_secs
                ),
            });
        }

        if self.max_frame_bytes == 0 {
            return Err(ConfigError::ValidationFailed {
                field: "max_frame_bytes",
                reason: "maximum frame size must be greater than 0".to_string(),
            });
        }

        if self.send_queue_size == 0 {
            return Err(ConfigError::ValidationFailed {
                field: "send_queue_size",
                reason: "send queue size must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Read deadline as a `Duration`.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Heartbeat period as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Write deadline as a `Duration`.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(
    key: &'static str,
    field: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            field,
            value: raw,
            expected: "a positive integer",
        }),
        Err(_) => Ok(default),
    }
}
