//! Durable storage: backends, the checksummed envelope, and app-state helpers.

pub mod codec;
pub mod durable;
pub mod envelope;
pub mod memory;
pub mod persistence;
pub mod sqlite;
pub mod traits;

pub use durable::{DurableStore, Integrity, RetrieveOptions, Retrieved, StorageUsage, StoreOptions};
pub use memory::InMemoryBackend;
pub use persistence::{Persistence, RecentItem};
pub use sqlite::SqliteBackend;
pub use traits::{KvBackend, StorageError};
