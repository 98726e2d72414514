//! # Tabpulse
//!
//! A local activity-telemetry pipeline: merges presence observations into
//! sessions, buffers them durably and forwards them to a remote collector in
//! batches.
//!
//! ## Core Concepts
//!
//! - [`ActivityEvent`] = a session (start, duration, origin, actor)
//! - [`EventBuffer`] = the ordered, persisted sequence of sessions
//! - [`merge`] = decides whether a candidate extends the tail or starts anew
//! - [`run_sync_cycle`] = filter, batch, send, and clear only on full success
//!
//! ## Architecture
//!
//! ```text
//! Presence source                         Trigger ("sync", every N seconds)
//!     │                                         │
//!     ▼ record()                                ▼ sync()
//! EventBuffer::add_one ──┐               PolicySource.resolve()
//!     │                  │                      │
//!     │  merge(tail, c)  │                      ▼
//!     │  Extend/Append ◄─┘               EventBuffer (locked for the cycle)
//!     ▼                                         │ read_all()
//! KvStore["events"] ◄───────────────────────────┤
//!                                               ▼
//!                                     to_transport_records()
//!                                               │
//!                                               ▼ chunks of batch_size
//!                                     Transport.send() per batch
//!                                               │
//!                              all ok ──► clear()   any failed ──► retain
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Only the tail mutates** - earlier events are immutable once appended
//! 2. **Durations never shrink** - a late or replayed candidate can't shorten a session
//! 3. **One writer at a time** - `add_one`, `clear` and a whole sync cycle are serialized
//! 4. **Clear means delivered** - the buffer is emptied only when every batch succeeded
//! 5. **Undeliverable is not deletable** - events failing the filter stay buffered
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tabpulse::{MemoryStore, PipelineBuilder, PipelineConfig, Presence, StorePolicy};
//!
//! let store = Arc::new(MemoryStore::new());
//! let pipeline = Arc::new(
//!     PipelineBuilder::new(store.clone(), Arc::new(my_transport), Arc::new(StorePolicy::new(store)))
//!         .with_config(PipelineConfig::default().with_pulse_window_secs(30.0))
//!         .build()?,
//! );
//!
//! let handle = pipeline.clone().start();
//! pipeline.record_now(Presence::new("https://example.com", "Example")).await?;
//! ```

mod buffer;
mod config;
mod dispatch;
mod error;
mod event;
mod filter;
mod merge;
mod pipeline;
mod policy;
mod status;
mod store;
mod transport;

// Retry is usable on its own for one-shot remote calls
pub mod retry;

// Re-export event types
pub use event::{ActivityEvent, Origin, Presence};

// Re-export merge engine
pub use merge::{merge, MergeResult};

// Re-export buffer types
pub use buffer::{BufferGuard, BufferWatcher, EventBuffer, DEFAULT_BUFFER_KEY};

// Re-export store types
pub use store::{ChangeNotifier, KvStore, MemoryStore, CHANGE_CHANNEL_CAPACITY};

// Re-export filter types
pub use filter::{to_transport_records, TransportRecord, ALLOWED_SCHEMES};

// Re-export dispatcher
pub use dispatch::{batches, run_sync_cycle};

// Re-export collaborator types
pub use policy::{
    PolicySource, StaticPolicy, StorePolicy, SyncPolicy, ROUTING_KEY, SYNC_ENABLED_KEY, TENANT_KEY,
};
pub use transport::{
    CollectorHeaders, Transport, TransportResponse, TENANT_HEADER, TOKEN_HEADER,
};

// Re-export status probe
pub use status::{probe_status, CollectorStatus, STATUS_KEY};

// Re-export configuration
pub use config::{
    is_routing_label, PipelineConfig, DEFAULT_BATCH_SIZE, DEFAULT_PULSE_WINDOW_SECS,
    ROUTING_PLACEHOLDER,
};

// Re-export error types
pub use error::{PulseError, Result, SkipReason, SyncOutcome};

// Re-export runtime types (primary entry point)
pub use pipeline::{Pipeline, PipelineBuilder, PipelineHandle, MANUAL_TRIGGER, SYNC_TRIGGER};

// Re-export retry types
pub use retry::{with_retry, with_retry_observed, RetryAttempt, RetryPolicy};

// Re-export commonly used external types
pub use async_trait::async_trait;
