// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline engine coordinator.
//!
//! The [`OfflineEngine`] owns every component and the background tasks
//! that keep them moving:
//! - Durable Store and the persistence helpers
//! - two-tier Cache, with the expiry sweeper
//! - Network Monitor, fed from a connectivity probe
//! - request client, with the reconnect drain driver
//! - Realtime Sync, with the mutation processor
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use offline_sync::clock::SystemClock;
//! use offline_sync::coordinator::{Collaborators, EngineState, OfflineEngine};
//! use offline_sync::network::{ManualProbe, ReqwestTransport};
//! use offline_sync::realtime::InMemoryRemoteStore;
//! use offline_sync::storage::InMemoryBackend;
//! use offline_sync::OfflineConfig;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let clock = Arc::new(SystemClock);
//! let collaborators = Collaborators {
//!     backend: Arc::new(InMemoryBackend::new()),
//!     transport: Arc::new(ReqwestTransport::new().expect("http client")),
//!     remote: Arc::new(InMemoryRemoteStore::new(clock.clone())),
//!     probe: Arc::new(ManualProbe::default()),
//!     clock,
//! };
//!
//! let engine = OfflineEngine::new(OfflineConfig::default(), collaborators).expect("engine");
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await.expect("start");
//! engine.sync().queue_update("cars", "c1", &serde_json::json!({"mileage": 500})).await.ok();
//! engine.shutdown().await;
//! # }
//! ```

mod lifecycle;
mod types;

pub use types::{Collaborators, EngineError, EngineState, HealthCheck};

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::Cache;
use crate::clock::Clock;
use crate::config::OfflineConfig;
use crate::metrics;
use crate::network::{ConnectivityProbe, NetworkClient, NetworkMonitor};
use crate::realtime::RealtimeSync;
use crate::resilience::circuit_breaker::CircuitState;
use crate::storage::{DurableStore, Persistence};

/// Composition root for the offline layer.
///
/// Components are shared `Arc`s; the accessors hand out the same instances
/// the background tasks use.
pub struct OfflineEngine {
    config: OfflineConfig,
    clock: Arc<dyn Clock>,
    store: Arc<DurableStore>,
    persistence: Arc<Persistence>,
    cache: Arc<Cache>,
    monitor: Arc<NetworkMonitor>,
    client: Arc<NetworkClient>,
    sync: Arc<RealtimeSync>,
    probe: Arc<dyn ConnectivityProbe>,

    state: watch::Sender<EngineState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineEngine {
    /// Wire the components. Nothing runs until [`start`](Self::start).
    ///
    /// Fails if the configured encryption key is malformed.
    pub fn new(config: OfflineConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        let Collaborators { backend, transport, remote, probe, clock } = collaborators;

        let store = Arc::new(DurableStore::new(backend, Arc::clone(&clock), &config)?);
        let persistence = Arc::new(Persistence::new(Arc::clone(&store), &config));
        let cache = Arc::new(Cache::new(Arc::clone(&store), Arc::clone(&clock), &config));
        // Seeded from the probe now; the forwarder keeps it current once started
        let monitor = Arc::new(NetworkMonitor::new(probe.watch().borrow().clone()));
        let client = Arc::new(NetworkClient::new(transport, Arc::clone(&monitor), Arc::clone(&clock), &config));
        let sync = Arc::new(RealtimeSync::new(
            remote,
            Arc::clone(&cache),
            Arc::clone(&monitor),
            Arc::clone(&store),
            Arc::clone(&clock),
            &config,
        ));

        let (state, _) = watch::channel(EngineState::Created);
        let (shutdown, _) = watch::channel(false);
        metrics::set_engine_state(&EngineState::Created.to_string());

        Ok(Self {
            config,
            clock,
            store,
            persistence,
            cache,
            monitor,
            client,
            sync,
            probe,
            state,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn set_state(&self, next: EngineState) {
        let previous = self.state.send_replace(next);
        metrics::set_engine_state(&next.to_string());
        debug!(from = %previous, to = %next, "Engine state changed");
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Snapshot for diagnostics screens and support bundles.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let state = self.state();
        let status = self.monitor.status();
        let remote_circuit = self.sync.circuit().state();

        HealthCheck {
            state,
            online: status.is_online(),
            connection_type: status.connection_type,
            cache: self.cache.get_stats(),
            request_queue: self.client.queue_size(),
            sync_queue: self.sync.queue_size(),
            unsynced: self.sync.unsynced_documents().len(),
            subscriptions: self.sync.subscription_count(),
            remote_circuit,
            healthy: state == EngineState::Running && remote_circuit != CircuitState::Open,
        }
    }

    #[must_use]
    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    #[must_use]
    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn client(&self) -> &Arc<NetworkClient> {
        &self.client
    }

    #[must_use]
    pub fn sync(&self) -> &Arc<RealtimeSync> {
        &self.sync
    }
}
