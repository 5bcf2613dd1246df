// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory backend for tests and local development.
//!
//! Implements [`TableBackend`] without a network: tables are vectors of rows
//! with an auto-increment primary key, durable writes notify joined change
//! channels of the table, and broadcast sends are delivered to every joined
//! broadcast channel with the same name. Several engines sharing one backend
//! behave like several clients of one server.
//!
//! Every operation is appended to a journal so tests can assert on ordering
//! (e.g. the flush's update happens before the broadcast leave). Faults can
//! be injected per backend: failing writes/queries, a number of failing
//! sends, failing leaves, and artificial latency.
//!
//! # Example
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use realtime_replica::backend::TableBackend;
//! use realtime_replica::memory::MemoryBackend;
//! use serde_json::json;
//!
//! let backend = MemoryBackend::new();
//! backend.seed("todos", vec![json!({"id": 1, "name": "a"}).as_object().unwrap().clone()]);
//!
//! let rows = backend.query_all("todos").await.unwrap();
//! assert_eq!(rows.len(), 1);
//! # }
//! ```

use crate::backend::{
    BackendError, BoxFuture, BroadcastHandler, BroadcastKind, BroadcastMessage, ChangeEvent,
    ChangeHandler, ChannelFuture, ChannelState, ChannelStatus, RealtimeChannel, RealtimeTransport,
    TableBackend,
};
use crate::entry::{row_id, EntryId, Row};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// One recorded backend operation.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalOp {
    QueryAll { table: String },
    Insert { table: String },
    Update { table: String, id: EntryId },
    Delete { table: String, id: EntryId },
    Join { channel: String },
    Leave { channel: String },
    Send { channel: String, kind: BroadcastKind, id: EntryId },
}

#[derive(Debug, Default)]
struct Faults {
    fail_writes: bool,
    fail_queries: bool,
    /// Upcoming sends that time out.
    failing_sends: u32,
    fail_leave: bool,
    latency: Duration,
}

#[derive(Debug)]
struct Table {
    primary_key: String,
    rows: Vec<Row>,
    next_id: i64,
}

impl Table {
    fn new(primary_key: &str) -> Self {
        Self {
            primary_key: primary_key.to_string(),
            rows: Vec::new(),
            next_id: 1,
        }
    }

    fn position(&self, index_field: &str, id: &EntryId) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row_id(row, index_field).as_ref() == Some(id))
    }
}

#[derive(Default)]
struct Inner {
    tables: Mutex<HashMap<String, Table>>,
    channels: Mutex<Vec<Weak<MemoryChannel>>>,
    journal: Mutex<Vec<JournalOp>>,
    faults: Mutex<Faults>,
    channels_created: Mutex<usize>,
}

impl Inner {
    fn record(&self, op: JournalOp) {
        trace!(op = ?op, "Memory backend operation");
        self.journal.lock().push(op);
    }

    fn latency(&self) -> Duration {
        self.faults.lock().latency
    }

    fn live_channels(&self) -> Vec<Arc<MemoryChannel>> {
        let mut channels = self.channels.lock();
        channels.retain(|weak| weak.strong_count() > 0);
        channels.iter().filter_map(Weak::upgrade).collect()
    }

    /// Deliver a change to every joined change channel of `table`.
    fn notify_change(&self, table: &str, event: ChangeEvent) {
        let handlers: Vec<ChangeHandler> = self
            .live_channels()
            .into_iter()
            .filter(|c| c.state() == ChannelState::Joined)
            .filter_map(|c| match &c.kind {
                ChannelKind::Changes { table: t, handler } if t == table => Some(handler.clone()),
                _ => None,
            })
            .collect();
        for handler in handlers {
            handler(event.clone());
        }
    }

    /// Deliver a broadcast to joined channels named `channel`.
    ///
    /// `sender` is skipped unless it asked for self-echo.
    fn deliver_broadcast(&self, channel: &str, sender: Option<&MemoryChannel>, message: &BroadcastMessage) {
        let handlers: Vec<BroadcastHandler> = self
            .live_channels()
            .into_iter()
            .filter(|c| c.name == channel && c.state() == ChannelState::Joined)
            .filter_map(|c| match &c.kind {
                ChannelKind::Broadcast { self_echo, handler } => {
                    let is_sender = sender.is_some_and(|s| std::ptr::eq(s, c.as_ref()));
                    (!is_sender || *self_echo).then(|| handler.clone())
                }
                ChannelKind::Changes { .. } => None,
            })
            .collect();
        for handler in handlers {
            handler(message.clone());
        }
    }
}

enum ChannelKind {
    Changes { table: String, handler: ChangeHandler },
    Broadcast { self_echo: bool, handler: BroadcastHandler },
}

struct MemoryChannel {
    name: String,
    kind: ChannelKind,
    state: Mutex<ChannelState>,
    hub: Arc<Inner>,
}

impl RealtimeChannel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn join(&self) -> ChannelFuture<'_> {
        Box::pin(async move {
            *self.state.lock() = ChannelState::Joining;
            sleep(self.hub.latency()).await;
            self.hub.record(JournalOp::Join {
                channel: self.name.clone(),
            });
            *self.state.lock() = ChannelState::Joined;
            ChannelStatus::Ok
        })
    }

    fn leave(&self) -> ChannelFuture<'_> {
        Box::pin(async move {
            sleep(self.hub.latency()).await;
            self.hub.record(JournalOp::Leave {
                channel: self.name.clone(),
            });
            if self.hub.faults.lock().fail_leave {
                return ChannelStatus::Error("leave rejected".to_string());
            }
            *self.state.lock() = ChannelState::Closed;
            ChannelStatus::Ok
        })
    }

    fn send(&self, message: BroadcastMessage) -> ChannelFuture<'_> {
        Box::pin(async move {
            if matches!(self.kind, ChannelKind::Changes { .. }) {
                return ChannelStatus::Error("channel does not accept broadcasts".to_string());
            }
            sleep(self.hub.latency()).await;
            self.hub.record(JournalOp::Send {
                channel: self.name.clone(),
                kind: message.kind,
                id: message.id.clone(),
            });

            {
                let mut faults = self.hub.faults.lock();
                if faults.failing_sends > 0 {
                    faults.failing_sends -= 1;
                    return ChannelStatus::TimedOut;
                }
            }
            if self.state() != ChannelState::Joined {
                return ChannelStatus::Error("channel not joined".to_string());
            }

            self.hub.deliver_broadcast(&self.name, Some(self), &message);
            ChannelStatus::Ok
        })
    }
}

async fn sleep(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

/// Shared in-memory store and realtime hub.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `table` with a primary key other than `id`.
    pub fn create_table(&self, table: &str, primary_key: &str) {
        self.inner
            .tables
            .lock()
            .entry(table.to_string())
            .or_insert_with(|| Table::new(primary_key));
    }

    /// Append rows without emitting change notifications.
    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        let mut tables = self.inner.tables.lock();
        let entry = tables.entry(table.to_string()).or_insert_with(|| Table::new("id"));
        for row in rows {
            if let Some(EntryId::Int(n)) = row_id(&row, &entry.primary_key) {
                entry.next_id = entry.next_id.max(n + 1);
            }
            entry.rows.push(row);
        }
    }

    /// All rows of `table`, in storage order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .tables
            .lock()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// The row of `table` whose primary key is `id`.
    pub fn row(&self, table: &str, id: &EntryId) -> Option<Row> {
        let tables = self.inner.tables.lock();
        let t = tables.get(table)?;
        t.position(&t.primary_key, id).map(|i| t.rows[i].clone())
    }

    pub fn journal(&self) -> Vec<JournalOp> {
        self.inner.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.inner.journal.lock().clear();
    }

    /// Durable writes (insert/update/delete) recorded against `table`.
    pub fn write_count(&self, table: &str) -> usize {
        self.inner
            .journal
            .lock()
            .iter()
            .filter(|op| match op {
                JournalOp::Insert { table: t }
                | JournalOp::Update { table: t, .. }
                | JournalOp::Delete { table: t, .. } => t == table,
                _ => false,
            })
            .count()
    }

    pub fn join_count(&self, channel: &str) -> usize {
        self.inner
            .journal
            .lock()
            .iter()
            .filter(|op| matches!(op, JournalOp::Join { channel: c } if c == channel))
            .count()
    }

    pub fn leave_count(&self, channel: &str) -> usize {
        self.inner
            .journal
            .lock()
            .iter()
            .filter(|op| matches!(op, JournalOp::Leave { channel: c } if c == channel))
            .count()
    }

    /// Number of channel handles ever created on this backend.
    pub fn channels_created(&self) -> usize {
        *self.inner.channels_created.lock()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Fault injection
    // ═══════════════════════════════════════════════════════════════════════════

    /// Make insert/update/delete fail until turned off.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.faults.lock().fail_writes = fail;
    }

    pub fn fail_queries(&self, fail: bool) {
        self.inner.faults.lock().fail_queries = fail;
    }

    /// Make the next `count` broadcast sends time out.
    pub fn fail_sends(&self, count: u32) {
        self.inner.faults.lock().failing_sends = count;
    }

    /// Make leave handshakes fail until turned off.
    pub fn fail_leave(&self, fail: bool) {
        self.inner.faults.lock().fail_leave = fail;
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.faults.lock().latency = latency;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Direct injection
    // ═══════════════════════════════════════════════════════════════════════════

    /// Deliver a raw change event to joined change channels of `table`.
    pub fn push_change(&self, table: &str, event: ChangeEvent) {
        self.inner.notify_change(table, event);
    }

    /// Deliver a broadcast as if sent by a peer with no local channel.
    pub fn push_broadcast(&self, channel: &str, message: BroadcastMessage) {
        self.inner.deliver_broadcast(channel, None, &message);
    }

    fn register(&self, name: &str, kind: ChannelKind) -> Arc<dyn RealtimeChannel> {
        let channel = Arc::new(MemoryChannel {
            name: name.to_string(),
            kind,
            state: Mutex::new(ChannelState::Closed),
            hub: self.inner.clone(),
        });
        self.inner.channels.lock().push(Arc::downgrade(&channel));
        *self.inner.channels_created.lock() += 1;
        debug!(channel = %name, "Created memory channel");
        channel
    }

    fn check_writes(&self) -> Result<(), BackendError> {
        if self.inner.faults.lock().fail_writes {
            Err(BackendError::new("injected write failure"))
        } else {
            Ok(())
        }
    }
}

impl RealtimeTransport for MemoryBackend {
    fn subscribe_changes(
        &self,
        channel: &str,
        table: &str,
        handler: ChangeHandler,
    ) -> Arc<dyn RealtimeChannel> {
        self.register(
            channel,
            ChannelKind::Changes {
                table: table.to_string(),
                handler,
            },
        )
    }

    fn broadcast_channel(
        &self,
        channel: &str,
        self_echo: bool,
        handler: BroadcastHandler,
    ) -> Arc<dyn RealtimeChannel> {
        self.register(channel, ChannelKind::Broadcast { self_echo, handler })
    }
}

impl TableBackend for MemoryBackend {
    fn query_all(&self, table: &str) -> BoxFuture<'_, Vec<Row>> {
        let table = table.to_string();
        Box::pin(async move {
            sleep(self.inner.latency()).await;
            self.inner.record(JournalOp::QueryAll { table: table.clone() });
            if self.inner.faults.lock().fail_queries {
                return Err(BackendError::new("injected query failure"));
            }
            Ok(self.rows(&table))
        })
    }

    fn insert(&self, table: &str, mut row: Row) -> BoxFuture<'_, ()> {
        let table = table.to_string();
        Box::pin(async move {
            sleep(self.inner.latency()).await;
            self.inner.record(JournalOp::Insert { table: table.clone() });
            self.check_writes()?;

            let inserted = {
                let mut tables = self.inner.tables.lock();
                let t = tables.entry(table.clone()).or_insert_with(|| Table::new("id"));
                match row_id(&row, &t.primary_key) {
                    Some(id) if t.position(&t.primary_key, &id).is_some() => {
                        return Err(BackendError::new(format!("duplicate key {}", id)));
                    }
                    Some(EntryId::Int(n)) => t.next_id = t.next_id.max(n + 1),
                    Some(EntryId::Text(_)) => {}
                    None => {
                        row.insert(t.primary_key.clone(), t.next_id.into());
                        t.next_id += 1;
                    }
                }
                t.rows.push(row.clone());
                row
            };

            self.inner.notify_change(&table, ChangeEvent::insert(inserted));
            Ok(())
        })
    }

    fn update(&self, table: &str, index_field: &str, id: &EntryId, patch: Row) -> BoxFuture<'_, ()> {
        let table = table.to_string();
        let index_field = index_field.to_string();
        let id = id.clone();
        Box::pin(async move {
            sleep(self.inner.latency()).await;
            self.inner.record(JournalOp::Update {
                table: table.clone(),
                id: id.clone(),
            });
            self.check_writes()?;

            let change = {
                let mut tables = self.inner.tables.lock();
                tables.get_mut(&table).and_then(|t| {
                    let i = t.position(&index_field, &id)?;
                    let before = t.rows[i].clone();
                    for (key, value) in patch {
                        t.rows[i].insert(key, value);
                    }
                    Some(ChangeEvent::update(Some(before), t.rows[i].clone()))
                })
            };

            // Updating zero rows is not an error.
            if let Some(event) = change {
                self.inner.notify_change(&table, event);
            }
            Ok(())
        })
    }

    fn delete_by_key(&self, table: &str, index_field: &str, id: &EntryId) -> BoxFuture<'_, ()> {
        let table = table.to_string();
        let index_field = index_field.to_string();
        let id = id.clone();
        Box::pin(async move {
            sleep(self.inner.latency()).await;
            self.inner.record(JournalOp::Delete {
                table: table.clone(),
                id: id.clone(),
            });
            self.check_writes()?;

            let removed = {
                let mut tables = self.inner.tables.lock();
                tables.get_mut(&table).and_then(|t| {
                    let i = t.position(&index_field, &id)?;
                    Some(t.rows.remove(i))
                })
            };

            if let Some(before) = removed {
                self.inner.notify_change(&table, ChangeEvent::delete(before));
            }
            Ok(())
        })
    }
}
