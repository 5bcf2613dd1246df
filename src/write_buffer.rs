// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write buffer for debounced mutations.
//!
//! Decides per mutation whether to write through to the durable store or to
//! broadcast now and persist later, and drains the buffered identifiers on
//! flush.
//!
//! # Design
//!
//! ```text
//! mutate(id, patch) ──▶ decide(joined) ──┬──▶ WriteThrough: flush, then durable update
//!                                        │
//!                                        └──▶ Buffer: mark_pending(id), broadcast
//!
//!                     HashMap<id, seq>
//!                     (latest mark wins)
//!                            │
//!            flush() ────────┴──▶ replica value ──▶ durable update
//!                                 (id stripped)      ok: forget id (if seq unchanged)
//!                                                    err: keep for next flush
//! ```
//!
//! Pending identifiers carry a sequence number. A flush only forgets an
//! identifier if no newer mutation marked it while the durable write was in
//! flight, so a late buffered value is never lost.

use crate::backend::TableBackend;
use crate::entry::EntryId;
use crate::metrics;
use crate::observer::SyncObserver;
use crate::replica::Replica;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// What `mutate()` should do with one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    /// Flush pending identifiers, then write this mutation durably.
    WriteThrough,
    /// Broadcast only; persist on a later flush.
    Buffer,
}

/// Result of a flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Pending identifiers when the flush started.
    pub total: usize,
    /// Durable updates that succeeded.
    pub persisted: usize,
    /// Durable updates that failed (still pending).
    pub failed: usize,
    /// Identifiers whose entry is gone from the replica.
    pub dropped: usize,
    pub duration: Duration,
}

impl FlushResult {
    /// Check if every pending write was persisted or dropped.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Default)]
struct BufferState {
    last_durable_write: Option<Instant>,
    pending: HashMap<EntryId, u64>,
    seq: u64,
}

/// Pending-write set plus the debounce clock of one table.
pub struct WriteBuffer {
    table: String,
    interval: Duration,
    state: Mutex<BufferState>,
    /// Serializes flushes.
    flush_gate: tokio::sync::Mutex<()>,
    observer: Arc<dyn SyncObserver>,
}

impl WriteBuffer {
    /// Create a buffer. A zero `interval` disables buffering.
    pub fn new(table: impl Into<String>, interval: Duration, observer: Arc<dyn SyncObserver>) -> Self {
        Self {
            table: table.into(),
            interval,
            state: Mutex::new(BufferState::default()),
            flush_gate: tokio::sync::Mutex::new(()),
            observer,
        }
    }

    /// Choose write-through or buffer for a mutation.
    ///
    /// `can_broadcast` is whether the broadcast channel can carry this
    /// mutation right now. Choosing write-through stamps the debounce clock
    /// in the same step, so two concurrent callers can't both write through
    /// inside one window.
    pub fn decide(&self, can_broadcast: bool) -> WriteDecision {
        let mut state = self.state.lock();
        let now = Instant::now();

        let within_window = match state.last_durable_write {
            Some(last) => now.saturating_duration_since(last) < self.interval,
            None => false,
        };

        if self.interval.is_zero() || !can_broadcast || !within_window {
            state.last_durable_write = Some(now);
            WriteDecision::WriteThrough
        } else {
            WriteDecision::Buffer
        }
    }

    /// Record an identifier whose latest value was broadcast but not persisted.
    pub fn mark_pending(&self, id: EntryId) {
        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        state.pending.insert(id, seq);
        metrics::set_pending_writes(&self.table, state.pending.len());
    }

    /// Identifiers currently awaiting a durable write.
    pub fn pending_ids(&self) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self.state.lock().pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_pending(&self, id: &EntryId) -> bool {
        self.state.lock().pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Persist every pending identifier's current replica value.
    ///
    /// Failures stay pending for the next flush; nothing is retried inside
    /// one flush. Concurrent flushes run one after the other.
    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn flush<B>(&self, replica: &Replica, backend: &B, index_name: &str) -> FlushResult
    where
        B: TableBackend + ?Sized,
    {
        let _gate = self.flush_gate.lock().await;
        let start = std::time::Instant::now();

        let batch: Vec<(EntryId, u64)> = {
            let state = self.state.lock();
            state.pending.iter().map(|(id, seq)| (id.clone(), *seq)).collect()
        };

        if batch.is_empty() {
            return FlushResult::default();
        }

        let mut result = FlushResult {
            total: batch.len(),
            ..Default::default()
        };

        debug!(table = %self.table, pending = result.total, "Flushing pending writes");

        for (id, seq) in batch {
            let Some(entry) = replica.get(&id) else {
                debug!(table = %self.table, id = %id, "Pending entry no longer in replica, dropping");
                self.forget(&id, seq);
                result.dropped += 1;
                continue;
            };

            // Entry fields never contain the identifier.
            let patch = entry.fields().clone();
            match backend.update(&self.table, index_name, &id, patch).await {
                Ok(()) => {
                    metrics::record_durable_write(&self.table, "flush", true);
                    self.forget(&id, seq);
                    result.persisted += 1;
                }
                Err(e) => {
                    metrics::record_durable_write(&self.table, "flush", false);
                    warn!(
                        table = %self.table,
                        id = %id,
                        error = %e,
                        "Failed to persist pending write, keeping it for the next flush"
                    );
                    result.failed += 1;
                }
            }
        }

        result.duration = start.elapsed();
        metrics::set_pending_writes(&self.table, self.len());

        info!(
            table = %self.table,
            total = result.total,
            persisted = result.persisted,
            failed = result.failed,
            dropped = result.dropped,
            "Flush complete"
        );

        self.observer.flushed(&self.table, &result);
        result
    }

    /// Remove `id` unless it was marked again after `seq`.
    fn forget(&self, id: &EntryId, seq: u64) {
        let mut state = self.state.lock();
        if state.pending.get(id) == Some(&seq) {
            state.pending.remove(id);
        }
    }
}
