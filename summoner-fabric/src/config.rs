//! Store connection settings
//!
//! Environment-driven configuration for reaching the Redis-compatible
//! store, with the defaults the rest of the fabric assumes.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Default session/descriptor TTL in seconds (one hour)
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Connection settings for the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store host name
    pub host: String,
    /// Store port
    pub port: u16,
    /// Read deadline for command replies, seconds
    pub socket_timeout_secs: u64,
    /// Connect deadline, seconds
    pub connect_timeout_secs: u64,
    /// Default TTL applied to session keys, seconds
    pub default_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "redis".to_string(),
            port: 6379,
            socket_timeout_secs: 10,
            connect_timeout_secs: 10,
            default_ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

impl StoreConfig {
    /// Load settings from the environment.
    ///
    /// Recognized variables: `REDIS_HOST`, `REDIS_PORT`, `REDIS_TIMEOUT`
    /// (seconds, applied to both connect and read), `REDIS_TTL`. Unset or
    /// unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let timeout = env::var("REDIS_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.socket_timeout_secs);

        Self {
            host: env::var("REDIS_HOST").unwrap_or(defaults.host),
            port: env::var("REDIS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            socket_timeout_secs: timeout,
            connect_timeout_secs: timeout,
            default_ttl_secs: env::var("REDIS_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_ttl_secs),
        }
    }

    /// Settings pointing at an explicit host/port, defaults elsewhere
    pub fn with_addr(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Address string suitable for `TcpStream::connect`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Read deadline for command replies
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    /// Connect deadline
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
