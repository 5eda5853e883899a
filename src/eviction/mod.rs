//! Eviction policy for the cache memory tier.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Eviction Module                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  lru.rs   - Least-recently-used ordering                     │
//! │  └─ AccessLog: key → logical access tick                     │
//! │  └─ victim(): smallest tick, O(log n)                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cache touches the log on every `set` and every `get` hit, and
//! evicts `victim()` while the memory tier is over capacity. Eviction only
//! affects the memory tier; the persistent copy stays in the Durable Store.

pub mod lru;

pub use lru::AccessLog;
