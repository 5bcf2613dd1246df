//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Integrity warnings on inbound streams
//! - Channel lifecycle transitions
//! - Broadcast delivery (attempts, exhaustion)
//! - Durable writes and buffered mutations
//! - Flush results
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replica_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Nothing is recorded unless the application installs a `metrics` recorder.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a data-integrity warning (missing or unknown identifier).
pub fn record_integrity_warning(table: &str, kind: &str) {
    counter!("replica_integrity_warnings_total", "table" => table.to_string(), "kind" => kind.to_string())
        .increment(1);
}

/// Record a channel lifecycle transition.
pub fn record_channel_transition(channel: &str, state: &str) {
    counter!("replica_channel_transitions_total", "channel" => channel.to_string(), "state" => state.to_string())
        .increment(1);
}

/// Set channel state gauge (0=closed, 1=joining, 2=joined, 3=leaving).
pub fn set_channel_state(channel: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "joining" => 1.0,
        "joined" => 2.0,
        "leaving" => 3.0,
        _ => -1.0,
    };
    gauge!("replica_channel_state", "channel" => channel.to_string()).set(value);
}

/// Record a broadcast send and how many attempts it took.
pub fn record_broadcast_send(channel: &str, attempts: u32, delivered: bool) {
    let status = if delivered { "delivered" } else { "exhausted" };
    counter!("replica_broadcast_sends_total", "channel" => channel.to_string(), "status" => status)
        .increment(1);
    histogram!("replica_broadcast_send_attempts", "channel" => channel.to_string())
        .record(attempts as f64);
}

/// Record a durable write issued by the engine.
pub fn record_durable_write(table: &str, operation: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replica_durable_writes_total",
        "table" => table.to_string(),
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a mutation that was broadcast instead of written.
pub fn record_buffered_mutation(table: &str) {
    counter!("replica_buffered_mutations_total", "table" => table.to_string()).increment(1);
}

/// Record a flush of the pending-write set.
pub fn record_flush(table: &str, persisted: usize, failed: usize, dropped: usize, duration: Duration) {
    let table = table.to_string();
    counter!("replica_flushes_total", "table" => table.clone()).increment(1);
    counter!("replica_flush_persisted_total", "table" => table.clone()).increment(persisted as u64);
    if failed > 0 {
        counter!("replica_flush_errors_total", "table" => table.clone()).increment(failed as u64);
    }
    if dropped > 0 {
        counter!("replica_flush_dropped_total", "table" => table.clone()).increment(dropped as u64);
    }
    histogram!("replica_flush_duration_seconds", "table" => table).record(duration.as_secs_f64());
}

/// Gauge for entries awaiting a durable write.
pub fn set_pending_writes(table: &str, count: usize) {
    gauge!("replica_pending_writes", "table" => table.to_string()).set(count as f64);
}

/// Gauge for active replica subscribers.
pub fn set_subscribers(name: &str, count: usize) {
    gauge!("replica_subscribers", "name" => name.to_string()).set(count as f64);
}

/// Gauge for replica size.
pub fn set_replica_size(table: &str, len: usize) {
    gauge!("replica_entries", "table" => table.to_string()).set(len as f64);
}
