//! Server limits and setup parameters
//!
//! `ServerConfig` holds the limits fixed when a server is created (slot
//! count, buffer sizes). It can be loaded from a TOML file:
//!
//! ```toml
//! capacity = 8
//! buffer_size = 4096
//! write_queue_depth = 64
//! reconnect_backoff_ms = 100
//! write_stall_timeout_ms = 5000
//! ```
//!
//! `SetupParams` carries the per-server arguments of the `setup` verb.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BroadcastError, Result};
use crate::transport::Endpoint;

/// Default number of connection slots
pub const DEFAULT_CAPACITY: usize = 8;
/// Default size of each slot's read buffer
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
/// Default depth of each slot's outbound queue
pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 64;
/// Default time a client may leave a write unfinished before its output is cut
pub const DEFAULT_WRITE_STALL_TIMEOUT_MS: u64 = 5000;
/// Default delay before a slot retries a failed accept
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 100;
/// Default idle timeout in seconds
pub const DEFAULT_IDLE_TIMEOUT_SECS: f64 = 1.0;
/// Shortest idle timeout; smaller values are raised to this so the loop never spins
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_millis(10);

/// Limits fixed at server creation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Number of connection slots (maximum concurrent clients)
    pub capacity: usize,
    /// Bytes read per message
    pub buffer_size: usize,
    /// Outbound messages buffered per slot before writes are dropped
    pub write_queue_depth: usize,
    /// Delay before a slot retries after a failed accept
    pub reconnect_backoff_ms: u64,
    /// A client that does not take a write within this time stops receiving,
    /// and its connection is closed
    pub write_stall_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            write_stall_timeout_ms: DEFAULT_WRITE_STALL_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    /// Parse a config from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| BroadcastError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Set the slot count
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn write_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.write_stall_timeout_ms)
    }

    /// Reject limits the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(BroadcastError::Config {
                message: "capacity must be at least 1".to_string(),
            });
        }
        if self.buffer_size == 0 {
            return Err(BroadcastError::Config {
                message: "buffer_size must be at least 1".to_string(),
            });
        }
        if self.write_queue_depth == 0 {
            return Err(BroadcastError::Config {
                message: "write_queue_depth must be at least 1".to_string(),
            });
        }
        if self.write_stall_timeout_ms == 0 {
            return Err(BroadcastError::Config {
                message: "write_stall_timeout_ms must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Maximum client silence before keepalive writes are issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTimeout {
    /// Never time out
    Forever,
    /// Time out after the given duration
    After(Duration),
}

impl IdleTimeout {
    /// Convert a seconds value; negative means forever
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs < 0.0 || !secs.is_finite() {
            Self::Forever
        } else {
            Self::After(Duration::from_millis((secs * 1000.0) as u64).max(MIN_IDLE_TIMEOUT))
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Forever => None,
            Self::After(d) => Some(*d),
        }
    }
}

impl Default for IdleTimeout {
    fn default() -> Self {
        Self::from_secs_f64(DEFAULT_IDLE_TIMEOUT_SECS)
    }
}

/// Arguments of a server setup
#[derive(Debug, Clone, PartialEq)]
pub struct SetupParams {
    /// Endpoint to listen on
    pub endpoint: Endpoint,
    /// Echo client messages to the other connected clients
    pub echo: bool,
    /// Keepalive interval
    pub idle_timeout: IdleTimeout,
}

impl SetupParams {
    /// Setup with echo off and the default timeout
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            echo: false,
            idle_timeout: IdleTimeout::default(),
        }
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: IdleTimeout) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}
