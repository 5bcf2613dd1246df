// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated table engine.
//!
//! The main entry point that ties together:
//! - The in-memory [`Replica`] readers observe
//! - The durable change feed via [`ChangeStreamAdapter`]
//! - The peer broadcast channel via [`BroadcastAdapter`]
//! - Debounced mutations via [`WriteBuffer`]
//!
//! # Lifecycle
//!
//! Channels are reference-counted by subscribers:
//! 1. The first [`acquire()`](TableReplica::acquire) joins both channels and
//!    performs the initial load (once per engine)
//! 2. Later acquires only bump the count
//! 3. The last [`release()`](TableReplica::release) flushes pending writes,
//!    then leaves the broadcast channel and the change feed
//! 4. A release that cannot flush or leave returns the error and keeps its
//!    subscription, so it can be retried
//!
//! Re-acquiring after a full release re-joins the same channel handles.
//!
//! # Example
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> realtime_replica::Result<()> {
//! use realtime_replica::{MemoryBackend, ReplicaConfig, TableReplica};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let todos = TableReplica::new(backend, ReplicaConfig::for_testing("todos"))?;
//!
//! let rx = todos.acquire().await?;
//! todos.add(json!({"name": "write docs"}).as_object().unwrap().clone()).await?;
//! assert_eq!(rx.borrow().len(), 1);
//!
//! todos.release().await?;
//! # Ok(())
//! # }
//! ```

mod types;

pub use types::{ChannelStates, MutateOutcome, ReplicaHooks};

use crate::backend::TableBackend;
use crate::broadcast::BroadcastAdapter;
use crate::change_stream::ChangeStreamAdapter;
use crate::config::ReplicaConfig;
use crate::entry::{strip_id, Entry, EntryId, Row};
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::observer::{EventSource, IntegrityWarning, SyncObserver};
use crate::replica::{Replica, Snapshot};
use crate::write_buffer::{FlushResult, WriteBuffer, WriteDecision};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, instrument, warn};

/// A table replicated into memory and kept in sync with its peers.
pub struct TableReplica<B: TableBackend> {
    config: ReplicaConfig,
    backend: Arc<B>,
    replica: Arc<Replica>,
    changes: ChangeStreamAdapter,
    broadcast: BroadcastAdapter,
    buffer: WriteBuffer,
    /// Set once the initial load succeeded.
    loaded: OnceCell<()>,
    /// Held across join + load so a concurrent acquire sees both done.
    start_lock: tokio::sync::Mutex<()>,
    subscribers: Mutex<usize>,
    observer: Arc<dyn SyncObserver>,
}

impl<B: TableBackend> TableReplica<B> {
    /// Create an engine with the default hooks (metrics observer, no ready callback).
    pub fn new(backend: Arc<B>, config: ReplicaConfig) -> Result<Self> {
        Self::with_hooks(backend, config, ReplicaHooks::default())
    }

    /// Create an engine with an injected observer and ready callback.
    ///
    /// Fails with [`ReplicaError::Config`] on an invalid configuration.
    /// Channel handles are created here, but nothing is joined or loaded
    /// until the first [`acquire()`](Self::acquire).
    pub fn with_hooks(backend: Arc<B>, config: ReplicaConfig, hooks: ReplicaHooks) -> Result<Self> {
        config.validate()?;
        let observer = hooks.observer;

        let replica = Arc::new(Replica::new(config.table.clone(), observer.clone()));
        let changes = ChangeStreamAdapter::new(
            backend.as_ref(),
            &config.change_channel_name(),
            &config.table,
            &config.index_name,
            replica.clone(),
            observer.clone(),
        );
        let broadcast = BroadcastAdapter::new(
            backend.as_ref(),
            &config.broadcast_channel_name(),
            &config.broadcast_event(),
            &config.index_name,
            config.send_retry.clone(),
            replica.clone(),
            observer.clone(),
            hooks.on_ready,
        );
        let buffer = WriteBuffer::new(config.table.clone(), config.write_interval(), observer.clone());

        debug!(
            table = %config.table,
            index_name = %config.index_name,
            write_interval_ms = config.write_interval_ms,
            "Created table replica"
        );

        Ok(Self {
            config,
            backend,
            replica,
            changes,
            broadcast,
            buffer,
            loaded: OnceCell::new(),
            start_lock: tokio::sync::Mutex::new(()),
            subscribers: Mutex::new(0),
            observer,
        })
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn table(&self) -> &str {
        &self.config.table
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Current snapshot of the replica.
    pub fn snapshot(&self) -> Snapshot {
        self.replica.read()
    }

    /// Current value of one entry.
    pub fn get(&self, id: &EntryId) -> Option<Entry> {
        self.replica.get(id)
    }

    /// Watch the replica without holding a subscription.
    ///
    /// The receiver sees updates only while someone holds an
    /// [`acquire()`](Self::acquire).
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.replica.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        *self.subscribers.lock()
    }

    pub fn channel_states(&self) -> ChannelStates {
        ChannelStates {
            changes: self.changes.gate().state(),
            broadcast: self.broadcast.gate().state(),
        }
    }

    /// Identifiers broadcast but not yet persisted.
    pub fn pending_writes(&self) -> Vec<EntryId> {
        self.buffer.pending_ids()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Subscription lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Register a subscriber and return a receiver of replica snapshots.
    ///
    /// Joins both channels (idempotent) and performs the initial load the
    /// first time it succeeds. Returns once both are done, even when another
    /// acquire started them. On failure, or if this future is dropped before
    /// it completes, the subscription is rolled back.
    pub async fn acquire(&self) -> Result<watch::Receiver<Snapshot>> {
        let registration = Registration::new(self);

        match self.start().await {
            Ok(()) => {
                registration.commit();
                Ok(self.replica.subscribe())
            }
            Err(e) => {
                warn!(table = %self.table(), error = %e, "Acquire failed, releasing subscription");
                registration.commit();
                if self.unregister() {
                    if let Err(leave_err) = self.leave_channels().await {
                        warn!(table = %self.table(), error = %leave_err, "Leave after failed acquire also failed");
                    }
                }
                Err(e)
            }
        }
    }

    async fn start(&self) -> Result<()> {
        let _start = self.start_lock.lock().await;
        let (changes, broadcast) = futures::join!(
            self.changes.gate().ensure_joined(),
            self.broadcast.gate().ensure_joined()
        );
        changes?;
        broadcast?;

        self.loaded
            .get_or_try_init(|| async { self.load().await.map(|_| ()) })
            .await?;
        Ok(())
    }

    /// Drop a subscriber. The last one flushes and leaves both channels.
    ///
    /// If pending writes cannot be persisted, or a leave handshake fails,
    /// the error is returned and the subscription is kept: the channels the
    /// engine still holds stay joined and a later `release()` tries again.
    pub async fn release(&self) -> Result<()> {
        if !self.unregister() {
            return Ok(());
        }

        info!(table = %self.table(), "Last subscriber released, leaving channels");
        let result = self.leave_channels().await;
        if result.is_err() {
            let count = self.register();
            warn!(table = %self.table(), subscribers = count, "Release failed, subscription kept");
        }
        result
    }

    /// Broadcast first: its pre-leave flush must succeed before the change
    /// feed, which would confirm those writes, is given up.
    async fn leave_channels(&self) -> Result<()> {
        self.broadcast
            .gate()
            .ensure_left_with(|| async {
                let result = self.flush().await;
                if result.is_success() {
                    Ok(())
                } else {
                    Err(ReplicaError::Unflushed {
                        table: self.config.table.clone(),
                        pending: self.buffer.pending_ids(),
                    })
                }
            })
            .await?;

        if *self.subscribers.lock() > 0 {
            debug!(table = %self.table(), "Re-acquired while leaving, keeping change feed");
            return Ok(());
        }
        self.changes.gate().ensure_left().await
    }

    fn register(&self) -> usize {
        let count = {
            let mut subscribers = self.subscribers.lock();
            *subscribers += 1;
            *subscribers
        };
        metrics::set_subscribers(self.table(), count);
        debug!(table = %self.table(), subscribers = count, "Subscriber acquired");
        count
    }

    /// Returns `true` if this was the last subscriber.
    fn unregister(&self) -> bool {
        let remaining = {
            let mut subscribers = self.subscribers.lock();
            if *subscribers == 0 {
                warn!(table = %self.table(), "Release without matching acquire");
                return false;
            }
            *subscribers -= 1;
            *subscribers
        };
        metrics::set_subscribers(self.table(), remaining);
        debug!(table = %self.table(), subscribers = remaining, "Subscriber released");
        remaining == 0
    }

    /// Replace the replica with a full read of the table.
    ///
    /// Rows without an identifier are skipped with an integrity warning.
    #[instrument(skip(self), fields(table = %self.config.table))]
    pub async fn load(&self) -> Result<usize> {
        let rows = self
            .backend
            .query_all(&self.config.table)
            .await
            .map_err(|e| ReplicaError::transport("query_all", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match Entry::from_row(row, &self.config.index_name) {
                Some(entry) => entries.push(entry),
                None => {
                    let warning = IntegrityWarning::MissingIdentifier {
                        source: EventSource::InitialLoad,
                        index_name: self.config.index_name.clone(),
                    };
                    warn!(table = %self.table(), warning = %warning, "Skipping row without identifier");
                    self.observer.integrity_warning(self.table(), &warning);
                }
            }
        }

        let kept = self.replica.load(entries);
        metrics::set_replica_size(self.table(), kept);
        info!(table = %self.table(), entries = kept, "Initial load complete");
        Ok(kept)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Insert a new row. The store assigns the identifier.
    ///
    /// The replica picks the row up from the change feed.
    pub async fn add(&self, mut row: Row) -> Result<()> {
        if strip_id(&mut row, &self.config.index_name) {
            debug!(table = %self.table(), "Ignoring identifier on new row");
        }
        let result = self.backend.insert(&self.config.table, row).await;
        metrics::record_durable_write(self.table(), "insert", result.is_ok());
        result.map_err(|e| ReplicaError::transport("insert", e))
    }

    /// Delete the row with identifier `id`.
    pub async fn remove(&self, id: impl Into<EntryId>) -> Result<()> {
        let id = id.into();
        let result = self
            .backend
            .delete_by_key(&self.config.table, &self.config.index_name, &id)
            .await;
        metrics::record_durable_write(self.table(), "delete", result.is_ok());
        result.map_err(|e| ReplicaError::transport("delete", e))
    }

    /// Overwrite some fields of the row with identifier `id`.
    ///
    /// Inside the write interval (and with the broadcast channel joined) the
    /// patch is applied locally, broadcast to peers and persisted by a later
    /// flush. Otherwise pending writes are flushed and the patch is written
    /// through. An identifier field in `patch` is ignored.
    pub async fn mutate(&self, id: impl Into<EntryId>, mut patch: Row) -> Result<MutateOutcome> {
        let id = id.into();
        if strip_id(&mut patch, &self.config.index_name) {
            debug!(table = %self.table(), id = %id, "Ignoring identifier in patch");
        }

        // Only entries we hold can be merged locally and flushed later.
        let can_broadcast = self.broadcast.is_joined() && self.replica.contains(&id);

        match self.buffer.decide(can_broadcast) {
            WriteDecision::Buffer => {
                self.replica.apply_merge(&id, &patch);
                self.buffer.mark_pending(id.clone());
                metrics::record_buffered_mutation(self.table());
                debug!(table = %self.table(), id = %id, "Mutation buffered");

                let delivery = self.broadcast.send_mutate(id, patch).await;
                Ok(MutateOutcome::Buffered {
                    delivered: delivery.is_delivered(),
                })
            }
            WriteDecision::WriteThrough => {
                self.flush().await;
                let result = self
                    .backend
                    .update(&self.config.table, &self.config.index_name, &id, patch)
                    .await;
                metrics::record_durable_write(self.table(), "update", result.is_ok());
                result.map_err(|e| ReplicaError::transport("update", e))?;
                Ok(MutateOutcome::Persisted)
            }
        }
    }

    /// Persist every pending buffered mutation.
    ///
    /// Failed writes stay pending for the next flush.
    pub async fn flush(&self) -> FlushResult {
        self.buffer
            .flush(&self.replica, self.backend.as_ref(), &self.config.index_name)
            .await
    }
}

/// A subscriber registered by an `acquire` that has not settled yet.
///
/// Dropping it uncommitted (the acquire future was dropped) takes the
/// subscriber back. Channels joined meanwhile stay joined until the next
/// last release.
struct Registration<'a, B: TableBackend> {
    engine: &'a TableReplica<B>,
    committed: bool,
}

impl<'a, B: TableBackend> Registration<'a, B> {
    fn new(engine: &'a TableReplica<B>) -> Self {
        engine.register();
        Self {
            engine,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl<B: TableBackend> Drop for Registration<'_, B> {
    fn drop(&mut self) {
        if !self.committed {
            warn!(table = %self.engine.table(), "Acquire dropped before completing, rolling back subscriber");
            self.engine.unregister();
        }
    }
}

impl<B: TableBackend> Drop for TableReplica<B> {
    fn drop(&mut self) {
        let pending = self.buffer.len();
        if pending > 0 {
            warn!(
                table = %self.config.table,
                pending,
                "Table replica dropped with unflushed writes"
            );
        }
    }
}
