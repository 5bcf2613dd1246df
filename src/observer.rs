//! Observer hooks for engine events.
//!
//! The engine reports integrity anomalies, channel transitions, broadcast
//! delivery and flushes through an injected [`SyncObserver`]. The default,
//! [`MetricsObserver`], forwards to the [`metrics`](crate::metrics) functions;
//! tests plug in a recording observer to assert on exact event counts.
//!
//! Every event is also logged with `tracing` at the call site, so the
//! observer is purely additive.

use crate::entry::EntryId;
use crate::lifecycle::GateState;
use crate::metrics;
use crate::resilience::Delivery;
use crate::write_buffer::FlushResult;
use std::fmt;

/// Where an inbound event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    InitialLoad,
    ChangeStream,
    Broadcast,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::InitialLoad => write!(f, "initial_load"),
            EventSource::ChangeStream => write!(f, "change_stream"),
            EventSource::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Apply operation that needs an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetedOp {
    Update,
    Merge,
}

impl fmt::Display for TargetedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetedOp::Update => write!(f, "update"),
            TargetedOp::Merge => write!(f, "merge"),
        }
    }
}

/// A non-fatal data-integrity anomaly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityWarning {
    /// The identifier field was absent from every payload of an event.
    MissingIdentifier {
        source: EventSource,
        index_name: String,
    },
    /// An update or merge targeted an identifier the replica doesn't hold.
    UnknownIdentifier { op: TargetedOp, id: EntryId },
}

impl IntegrityWarning {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            IntegrityWarning::MissingIdentifier { .. } => "missing_identifier",
            IntegrityWarning::UnknownIdentifier { .. } => "unknown_identifier",
        }
    }
}

impl fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityWarning::MissingIdentifier { source, index_name } => {
                write!(f, "index {} not found in {} payload", index_name, source)
            }
            IntegrityWarning::UnknownIdentifier { op, id } => {
                write!(f, "{} for unknown identifier {}", op, id)
            }
        }
    }
}

/// Receives engine events. All methods default to no-ops.
pub trait SyncObserver: Send + Sync + 'static {
    fn integrity_warning(&self, _table: &str, _warning: &IntegrityWarning) {}

    fn channel_transition(&self, _channel: &str, _state: GateState) {}

    fn broadcast_delivery(&self, _channel: &str, _delivery: &Delivery) {}

    fn flushed(&self, _table: &str, _result: &FlushResult) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl SyncObserver for NoOpObserver {}

/// Observer that records Prometheus-style metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsObserver;

impl SyncObserver for MetricsObserver {
    fn integrity_warning(&self, table: &str, warning: &IntegrityWarning) {
        metrics::record_integrity_warning(table, warning.kind());
    }

    fn channel_transition(&self, channel: &str, state: GateState) {
        let label = state.to_string();
        metrics::record_channel_transition(channel, &label);
        metrics::set_channel_state(channel, &label);
    }

    fn broadcast_delivery(&self, channel: &str, delivery: &Delivery) {
        metrics::record_broadcast_send(channel, delivery.attempts, delivery.is_delivered());
    }

    fn flushed(&self, table: &str, result: &FlushResult) {
        metrics::record_flush(table, result.persisted, result.failed, result.dropped, result.duration);
    }
}
