// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replica engine.
//!
//! Errors are categorized by where they surface. Stream-level anomalies
//! (missing identifiers, updates for unknown rows) are never errors: they
//! are logged and reported to the observer, and processing continues.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Durable read/write/delete failed at the backend |
//! | `Delivery` | Yes | Broadcast not acknowledged after the retry budget |
//! | `NotJoined` | Yes | Broadcast channel not joined yet |
//! | `Handshake` | Yes | Channel join or leave rejected by the transport |
//! | `Config` | No | Configuration invalid (e.g. negative write interval) |
//! | `Unflushed` | Yes | Release could not persist buffered writes |
//!
//! # Retry Behavior
//!
//! Use [`ReplicaError::is_retryable()`] to decide whether the caller may
//! retry the same mutation. The engine itself never retries a failed durable
//! write except through a later flush of the pending set.

use crate::backend::{BackendError, ChannelStatus};
use crate::entry::EntryId;
use thiserror::Error;

/// Result type alias for replica operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Errors returned to callers of the replica engine.
#[derive(Error, Debug, Clone)]
pub enum ReplicaError {
    /// The durable store rejected or failed an operation.
    ///
    /// Returned to the caller of add/remove/mutate/load so it can retry
    /// or display the failure.
    #[error("Transport error ({operation}): {source}")]
    Transport {
        operation: String,
        #[source]
        source: BackendError,
    },

    /// A broadcast was not acknowledged within the retry budget.
    ///
    /// The local replica may already reflect the change; peers may not.
    #[error("Delivery failed on {channel} after {attempts} attempts: {status}")]
    Delivery {
        channel: String,
        attempts: u32,
        status: ChannelStatus,
    },

    /// An operation needs a joined broadcast channel.
    #[error("Channel {channel} is not joined")]
    NotJoined { channel: String },

    /// The transport rejected a join or leave handshake.
    #[error("Channel {channel} {operation} failed: {status}")]
    Handshake {
        channel: String,
        operation: &'static str,
        status: ChannelStatus,
    },

    /// Invalid configuration, rejected at construction.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The last release could not persist buffered writes.
    ///
    /// The channels stay joined and the subscription is kept, so a later
    /// `release()` flushes again.
    #[error("{} pending writes to {table} were not persisted", .pending.len())]
    Unflushed { table: String, pending: Vec<EntryId> },
}

impl ReplicaError {
    /// Wrap a backend failure for the named operation.
    pub fn transport(operation: impl Into<String>, source: BackendError) -> Self {
        Self::Transport {
            operation: operation.into(),
            source,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Delivery { .. } => true,
            Self::NotJoined { .. } => true, // join may still be in flight
            Self::Handshake { .. } => true,
            Self::Config(_) => false,
            Self::Unflushed { .. } => true,
        }
    }
}
