// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Offline Sync
//!
//! The offline-resilience layer of a garage management app: device storage,
//! a two-tier cache, connectivity tracking, a queued HTTP client and
//! realtime document sync with an offline mutation queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      OfflineEngine                          │
//! │  • Wires components, owns background tasks                 │
//! │  • Created → Starting → Running → ShuttingDown → Stopped   │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌─────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │ NetworkMonitor  │  │  NetworkClient   │  │  RealtimeSync    │
//! │ • probe → state │─►│ • retry/timeout  │  │ • subscriptions  │
//! │ • listeners     │  │ • offline queue  │  │ • mutation queue │
//! └─────────────────┘  └──────────────────┘  └──────────────────┘
//!                                                     │
//!                                                     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Cache (memory + durable)                │
//! │  • LRU bound on the memory tier, TTL on both tiers         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DurableStore                          │
//! │  • Versioned envelopes with checksums and migrations       │
//! │  • Optional compression and AES-GCM encryption             │
//! │  • KvBackend: in-memory or SQLite                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offline_sync::clock::SystemClock;
//! use offline_sync::coordinator::Collaborators;
//! use offline_sync::network::{ManualProbe, ReqwestTransport};
//! use offline_sync::realtime::InMemoryRemoteStore;
//! use offline_sync::storage::SqliteBackend;
//! use offline_sync::{OfflineConfig, OfflineEngine};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = OfflineConfig {
//!         api_base_url: Some("https://api.example.com".into()),
//!         ..Default::default()
//!     };
//!
//!     let clock = Arc::new(SystemClock);
//!     let engine = OfflineEngine::new(config, Collaborators {
//!         backend: Arc::new(SqliteBackend::open("garage.db").await.expect("db")),
//!         transport: Arc::new(ReqwestTransport::new().expect("http")),
//!         remote: Arc::new(InMemoryRemoteStore::new(clock.clone())),
//!         probe: Arc::new(ManualProbe::default()),
//!         clock,
//!     })
//!     .expect("engine");
//!
//!     engine.start().await.expect("Failed to start");
//!
//!     // Optimistic write: visible in the cache now, pushed when online
//!     engine.sync().queue_update("cars", "c1", &json!({"mileage": 51_200})).await.ok();
//!     let car: Option<serde_json::Value> = engine.cache().get("cars:c1").await;
//!     println!("{car:?}");
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`OfflineEngine`] composition root
//! - [`storage`]: Durable Store, key-value backends and persistence helpers
//! - [`cache`]: two-tier LRU/TTL cache
//! - [`network`]: connectivity monitor and the queued request client
//! - [`realtime`]: remote subscriptions and the offline mutation queue
//! - [`resilience`]: circuit breaker and retry policies
//! - [`eviction`]: LRU access ordering
//! - [`keys`]: typed key registry

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod eviction;
pub mod keys;
pub mod metrics;
pub mod network;
pub mod realtime;
pub mod resilience;
pub mod storage;

pub use cache::{Cache, CacheEntry, CacheStats};
pub use config::OfflineConfig;
pub use coordinator::{Collaborators, EngineError, EngineState, HealthCheck, OfflineEngine};
pub use network::{ApiResponse, NetworkClient, NetworkMonitor, NetworkStatus, RequestConfig, RequestError, RequestOptions};
pub use realtime::{RealtimeSync, RemoteStore, SyncError, SyncOperation};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState, CircuitStats};
pub use resilience::retry::RetryConfig;
pub use storage::{DurableStore, KvBackend, Persistence, RetrieveOptions, StorageError, StoreOptions};
pub use metrics::LatencyTimer;
