//! # Realtime Replica
//!
//! Client-side replicas of a remote table (or an ephemeral shared set),
//! kept in sync across concurrent clients in near real time.
//!
//! ## Architecture
//!
//! The engine merges two inbound streams into one in-memory collection and
//! debounces local writes:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              TableReplica                                 │
//! │                                                                           │
//! │  ┌──────────────────────┐                          ┌──────────────────┐   │
//! │  │ ChangeStreamAdapter  │── insert/update/delete ─►│                  │   │
//! │  │ ({table}-table-      │                          │     Replica      │──►│ readers
//! │  │  changes)            │                          │ (Arc<Vec<Entry>> │   │ (watch)
//! │  └──────────────────────┘                          │  snapshots)      │   │
//! │  ┌──────────────────────┐                          │                  │   │
//! │  │ BroadcastAdapter     │── add/remove/mutate ────►│                  │   │
//! │  │ ({table}-broadcast-  │   (self-echo)            └──────────────────┘   │
//! │  │  changes)            │◄── send_with_retry ──┐                          │
//! │  └──────────────────────┘                      │                          │
//! │            ▲                          ┌────────┴────────┐                 │
//! │  ChannelGate (join/leave)             │   WriteBuffer   │── flush ──► TableBackend
//! │                                       │ (pending ids)   │                 │
//! │                                       └─────────────────┘                 │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Write Paths
//!
//! 1. **Write-through**: `add`, `remove`, and `mutate` outside the write
//!    interval go straight to the durable store; the change feed brings the
//!    result back into every replica.
//! 2. **Buffered**: `mutate` inside the write interval is applied locally,
//!    broadcast to peers and persisted by the next flush (on the next
//!    write-through or before the broadcast channel is left).
//!
//! ## Usage
//!
//! ```rust
//! use realtime_replica::{MemoryBackend, ReplicaConfig, TableReplica};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> realtime_replica::Result<()> {
//!     let backend = Arc::new(MemoryBackend::new());
//!     let config = ReplicaConfig {
//!         table: "todos".into(),
//!         write_interval_ms: 500,
//!         ..Default::default()
//!     };
//!     let todos = TableReplica::new(backend, config)?;
//!
//!     let mut rx = todos.acquire().await?;
//!     todos.add(json!({"name": "a"}).as_object().unwrap().clone()).await?;
//!     assert_eq!(rx.borrow_and_update().len(), 1);
//!
//!     // Last release flushes pending writes and leaves both channels
//!     todos.release().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod broadcast;
pub mod change_stream;
pub mod config;
pub mod entry;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod observer;
pub mod replica;
pub mod resilience;
pub mod set;
pub mod store;
pub mod write_buffer;

// Re-exports for convenience
pub use backend::{BackendError, ChangeEvent, ChannelStatus, RealtimeChannel, RealtimeTransport, TableBackend};
pub use config::{ReplicaConfig, SendRetryConfig, SharedSetConfig};
pub use entry::{Entry, EntryId, Row};
pub use error::{ReplicaError, Result};
pub use lifecycle::GateState;
pub use memory::MemoryBackend;
pub use observer::{IntegrityWarning, MetricsObserver, NoOpObserver, SyncObserver};
pub use replica::{Replica, Snapshot};
pub use set::SharedSet;
pub use store::{ChannelStates, MutateOutcome, ReplicaHooks, TableReplica};
pub use write_buffer::FlushResult;
