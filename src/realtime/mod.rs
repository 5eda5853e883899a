//! Realtime sync against a remote document store.
//!
//! - [`remote`]: the store seam, queries and change types
//! - [`memory`]: in-process store
//! - [`sync_queue`]: durable queue of pending mutations
//! - [`service`]: subscriptions, optimistic mutations and the processor

pub mod memory;
pub mod remote;
pub mod service;
pub mod subscription;
pub mod sync_queue;

pub use memory::InMemoryRemoteStore;
pub use remote::{BatchOp, ChangeType, Direction, DocumentQuery, FilterOp, RemoteChange, RemoteError, RemoteStore};
pub use service::{BatchOutcome, ChangeEvent, RealtimeSync, SyncError, SyncFailure, SyncNotice, SyncReport};
pub use subscription::SubscriptionHandle;
pub use sync_queue::{SyncOperation, SyncQueueItem};
