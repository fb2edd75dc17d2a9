//! Session configuration.
//!
//! Defaults mirror the channel sizing the protocol engine was designed around:
//! small bounded queues so a slow writer throttles the reader instead of
//! buffering without limit.
//!
//! # Example
//!
//! ```
//! use jt808_gateway::config::SessionConfig;
//!
//! let config = SessionConfig::from_json(r#"{ "default_active_timeout_ms": 8000 }"#).unwrap();
//! assert_eq!(config.default_active_timeout_ms, 8000);
//! assert_eq!(config.inbound_capacity, 10);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::protocol::{ReassemblyMode, MAX_FRAME_SIZE};

/// Default capacity of the inbound (reader → writer) queue.
pub const DEFAULT_INBOUND_CAPACITY: usize = 10;

/// Default capacity of the active command submission queue.
pub const DEFAULT_ACTIVE_CAPACITY: usize = 3;

/// Default capacity of the sub-package reissue queue.
pub const DEFAULT_REISSUE_CAPACITY: usize = 3;

/// Default time an active command waits for its terminal response.
pub const DEFAULT_ACTIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default socket read buffer, large enough for one fully escaped frame.
pub const DEFAULT_READ_BUFFER_SIZE: usize = MAX_FRAME_SIZE;

/// Configuration for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the inbound message queue.
    pub inbound_capacity: usize,
    /// Capacity of the active command queue.
    pub active_capacity: usize,
    /// Capacity of the reissue request queue.
    pub reissue_capacity: usize,
    /// Active command timeout when the command carries no override.
    pub default_active_timeout_ms: u64,
    /// Size of the socket read buffer.
    pub read_buffer_size: usize,
    /// Sub-package handling.
    pub reassembly_mode: ReassemblyMode,
    /// Skip read/write events for incomplete sub-package parts.
    pub filter_incomplete_events: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            active_capacity: DEFAULT_ACTIVE_CAPACITY,
            reissue_capacity: DEFAULT_REISSUE_CAPACITY,
            default_active_timeout_ms: DEFAULT_ACTIVE_TIMEOUT.as_millis() as u64,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            reassembly_mode: ReassemblyMode::default(),
            filter_incomplete_events: false,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON configuration. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Active command timeout as a `Duration`.
    #[inline]
    pub fn default_active_timeout(&self) -> Duration {
        Duration::from_millis(self.default_active_timeout_ms)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("inbound_capacity", self.inbound_capacity),
            ("active_capacity", self.active_capacity),
            ("reissue_capacity", self.reissue_capacity),
            ("read_buffer_size", self.read_buffer_size),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(GatewayError::Config(format!("{} must be positive", name)));
            }
        }
        if self.default_active_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "default_active_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
