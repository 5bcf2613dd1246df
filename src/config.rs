//! Configuration for the replica engine.
//!
//! Configuration is passed to [`TableReplica::new()`](crate::TableReplica::new)
//! or [`SharedSet::new()`](crate::SharedSet::new) and can be constructed
//! programmatically or deserialized from JSON/YAML.
//!
//! # Quick Start
//!
//! ```rust
//! use realtime_replica::config::ReplicaConfig;
//!
//! let config = ReplicaConfig {
//!     table: "todos".into(),
//!     write_interval_ms: 500,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.broadcast_channel_name(), "todos-broadcast-changes");
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicaConfig
//! ├── table: String             # Backing table name
//! ├── index_name: String        # Identifier column (default "id")
//! ├── write_interval_ms: i64    # Debounce window, 0 = write through
//! └── send_retry: SendRetryConfig
//!     ├── max_attempts: u32     # default 10
//!     └── backoff_ms: u64       # default 100 (fixed, not exponential)
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "table": "messages",
//!   "index_name": "id",
//!   "write_interval_ms": 1000
//! }
//! ```

use crate::error::{ReplicaError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicaConfig: one replicated table
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration of a replicated table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Name of the backing table. Channel names are derived from it.
    pub table: String,

    /// Name of the identifier column.
    /// If you change this, rows you add should omit that column instead of `id`.
    #[serde(default = "default_index_name")]
    pub index_name: String,

    /// Debounce window for `mutate()` in milliseconds.
    ///
    /// `0` disables buffering: every mutation writes through. Signed so a
    /// negative value from a config file is rejected with a clear error
    /// rather than a deserialization failure.
    #[serde(default)]
    pub write_interval_ms: i64,

    /// Broadcast send retry policy.
    #[serde(default)]
    pub send_retry: SendRetryConfig,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            table: "entries".to_string(),
            index_name: default_index_name(),
            write_interval_ms: 0,
            send_retry: SendRetryConfig::default(),
        }
    }
}

fn default_index_name() -> String {
    "id".to_string()
}

impl ReplicaConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(ReplicaError::Config("table name cannot be empty".to_string()));
        }
        if self.index_name.is_empty() {
            return Err(ReplicaError::Config("index_name cannot be empty".to_string()));
        }
        if self.write_interval_ms < 0 {
            return Err(ReplicaError::Config(format!(
                "write_interval_ms cannot be negative (got {})",
                self.write_interval_ms
            )));
        }
        self.send_retry.validate()
    }

    /// The debounce window. Zero when buffering is disabled.
    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms.max(0) as u64)
    }

    /// Name of the durable change-feed channel.
    pub fn change_channel_name(&self) -> String {
        format!("{}-table-changes", self.table)
    }

    /// Name of the ephemeral broadcast channel.
    pub fn broadcast_channel_name(&self) -> String {
        format!("{}-broadcast-changes", self.table)
    }

    /// Event name of buffered mutations on the broadcast channel.
    pub fn broadcast_event(&self) -> String {
        format!("{}-mutate", self.table)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SharedSetConfig: one ephemeral broadcast-only collection
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration of an ephemeral shared set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedSetConfig {
    /// Logical name; channel and event names are derived from it.
    pub name: String,

    /// Identifier field name in initial rows (default `uuid`).
    #[serde(default = "default_set_index_name")]
    pub index_name: String,

    #[serde(default)]
    pub send_retry: SendRetryConfig,
}

fn default_set_index_name() -> String {
    "uuid".to_string()
}

impl SharedSetConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index_name: default_set_index_name(),
            send_retry: SendRetryConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ReplicaError::Config("set name cannot be empty".to_string()));
        }
        if self.index_name.is_empty() {
            return Err(ReplicaError::Config("index_name cannot be empty".to_string()));
        }
        self.send_retry.validate()
    }

    pub fn channel_name(&self) -> String {
        format!("{}-broadcast-changes", self.name)
    }

    pub fn event(&self) -> String {
        format!("{}-broadcast", self.name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SendRetryConfig: broadcast delivery
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounded, fixed-backoff retry for broadcast sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRetryConfig {
    /// Maximum send attempts (including the first).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause after each failed attempt, in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_backoff_ms() -> u64 {
    100
}

impl Default for SendRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_ms: 100,
        }
    }
}

impl SendRetryConfig {
    /// Fast retries for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1,
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ReplicaError::Config(
                "send_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
