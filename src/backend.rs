// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend integration traits.
//!
//! Defines what the engine needs from the outside world: a durable table
//! store and a realtime transport. Everything network-shaped (HTTP client,
//! websocket, auth) lives behind these traits.
//!
//! # Example
//!
//! ```rust,no_run
//! use realtime_replica::backend::{
//!     BackendResult, BoxFuture, BroadcastHandler, ChangeHandler, RealtimeChannel,
//!     RealtimeTransport, TableBackend,
//! };
//! use realtime_replica::entry::{EntryId, Row};
//! use std::sync::Arc;
//!
//! struct MyClient { /* ... */ }
//!
//! impl RealtimeTransport for MyClient {
//!     fn subscribe_changes(&self, channel: &str, table: &str, handler: ChangeHandler)
//!         -> Arc<dyn RealtimeChannel> { unimplemented!() }
//!     fn broadcast_channel(&self, channel: &str, self_echo: bool, handler: BroadcastHandler)
//!         -> Arc<dyn RealtimeChannel> { unimplemented!() }
//! }
//!
//! impl TableBackend for MyClient {
//!     fn query_all(&self, _table: &str) -> BoxFuture<'_, Vec<Row>> {
//!         Box::pin(async move { Ok(Vec::new()) })
//!     }
//!     fn insert(&self, _table: &str, _row: Row) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!     fn update(&self, _table: &str, _index: &str, _id: &EntryId, _patch: Row) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!     fn delete_by_key(&self, _table: &str, _index: &str, _id: &EntryId) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

use crate::entry::{row_id, EntryId, Row};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Type alias for boxed async backend futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + Send + 'a>>;

/// Boxed future for channel handshakes and sends.
pub type ChannelFuture<'a> = Pin<Box<dyn Future<Output = ChannelStatus> + Send + 'a>>;

/// Callback the transport invokes for each durable change notification.
pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Callback the transport invokes for each broadcast message.
pub type BroadcastHandler = Arc<dyn Fn(BroadcastMessage) + Send + Sync>;

/// Simplified error for backend operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BackendError {}

/// Transport-side state of a realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Closed,
    Joining,
    Joined,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Closed => write!(f, "closed"),
            ChannelState::Joining => write!(f, "joining"),
            ChannelState::Joined => write!(f, "joined"),
        }
    }
}

/// Outcome of a join, leave or send on a realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Ok,
    TimedOut,
    Error(String),
}

impl ChannelStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ChannelStatus::Ok)
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Ok => write!(f, "ok"),
            ChannelStatus::TimedOut => write!(f, "timed out"),
            ChannelStatus::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Kind of durable change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A durable change notification for one row.
///
/// `before` is the old row (updates/deletes), `after` the new one
/// (inserts/updates). Transports may send either partially populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    #[serde(default)]
    pub before: Option<Row>,
    #[serde(default)]
    pub after: Option<Row>,
}

impl ChangeEvent {
    pub fn insert(after: Row) -> Self {
        Self {
            kind: ChangeKind::Insert,
            before: None,
            after: Some(after),
        }
    }

    pub fn update(before: Option<Row>, after: Row) -> Self {
        Self {
            kind: ChangeKind::Update,
            before,
            after: Some(after),
        }
    }

    pub fn delete(before: Row) -> Self {
        Self {
            kind: ChangeKind::Delete,
            before: Some(before),
            after: None,
        }
    }

    /// Identifier from the new row, falling back to the old one.
    pub fn id(&self, index_name: &str) -> Option<EntryId> {
        self.after
            .as_ref()
            .and_then(|r| row_id(r, index_name))
            .or_else(|| self.before.as_ref().and_then(|r| row_id(r, index_name)))
    }
}

/// Discriminant of a broadcast message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastKind {
    Add,
    Remove,
    Mutate,
}

impl std::fmt::Display for BroadcastKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastKind::Add => write!(f, "add"),
            BroadcastKind::Remove => write!(f, "remove"),
            BroadcastKind::Mutate => write!(f, "mutate"),
        }
    }
}

/// A message on an ephemeral broadcast channel.
///
/// `payload` never contains the identifier; it travels in `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Event name the receivers filter on (e.g. `todos-mutate`).
    pub event: String,
    pub kind: BroadcastKind,
    pub id: EntryId,
    #[serde(default)]
    pub payload: Row,
}

/// A realtime channel handle (change feed or broadcast).
///
/// Handles are created once and joined/left many times.
pub trait RealtimeChannel: Send + Sync + 'static {
    /// Channel name (for logging).
    fn name(&self) -> &str;

    /// Current transport state.
    fn state(&self) -> ChannelState;

    /// Join handshake. Resolves once the server confirms or rejects.
    fn join(&self) -> ChannelFuture<'_>;

    /// Leave handshake.
    fn leave(&self) -> ChannelFuture<'_>;

    /// Send a broadcast message.
    ///
    /// Change-feed channels don't carry outbound traffic; the default
    /// rejects the send.
    fn send(&self, _message: BroadcastMessage) -> ChannelFuture<'_> {
        Box::pin(async { ChannelStatus::Error("channel does not accept broadcasts".to_string()) })
    }
}

/// Factory for realtime channels.
pub trait RealtimeTransport: Send + Sync + 'static {
    /// Create a channel carrying durable change notifications for `table`.
    fn subscribe_changes(
        &self,
        channel: &str,
        table: &str,
        handler: ChangeHandler,
    ) -> Arc<dyn RealtimeChannel>;

    /// Create an ephemeral broadcast channel.
    ///
    /// With `self_echo`, messages we send are delivered to our own handler too.
    fn broadcast_channel(
        &self,
        channel: &str,
        self_echo: bool,
        handler: BroadcastHandler,
    ) -> Arc<dyn RealtimeChannel>;
}

/// Trait defining what we need from the durable store.
///
/// This trait allows testing with in-memory backends and decouples the
/// engine from any particular database client.
pub trait TableBackend: RealtimeTransport {
    /// Read every row of the table (initial load).
    fn query_all(&self, table: &str) -> BoxFuture<'_, Vec<Row>>;

    /// Insert a new row; the store assigns the identifier.
    fn insert(&self, table: &str, row: Row) -> BoxFuture<'_, ()>;

    /// Overwrite the given fields of the row whose `index_field` equals `id`.
    fn update(&self, table: &str, index_field: &str, id: &EntryId, patch: Row)
        -> BoxFuture<'_, ()>;

    /// Delete the row whose `index_field` equals `id`.
    fn delete_by_key(&self, table: &str, index_field: &str, id: &EntryId) -> BoxFuture<'_, ()>;
}
