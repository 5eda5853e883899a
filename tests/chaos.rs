//! Chaos testing for the offline layer.
//!
//! This module tests failure scenarios using:
//! 1. **Failing wrappers** - error injection at specific call counts for the
//!    key-value backend, the HTTP transport and the remote store
//! 2. **Data corruption** - garbage written straight into device storage
//! 3. **Sustained outages** - remote failures that trip the circuit breaker
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use offline_sync::clock::ManualClock;
use offline_sync::keys::StorageKey;
use offline_sync::network::{
    HttpRequest, HttpResponse, ManualProbe, NetworkClient, NetworkMonitor, NetworkStatus, Transport, TransportError,
};
use offline_sync::realtime::{
    BatchOp, DocumentQuery, InMemoryRemoteStore, RemoteChange, RemoteError, RemoteStore,
};
use offline_sync::storage::InMemoryBackend;
use offline_sync::{
    Cache, CircuitState, Collaborators, DurableStore, EngineState, KvBackend, OfflineConfig, OfflineEngine,
    RealtimeSync, RequestConfig, RequestOptions, StorageError,
};

// =============================================================================
// Failing Wrappers - Precise Error Injection
// =============================================================================

/// Decides which calls fail. Calls are 1-indexed.
struct FaultPlan {
    call_count: AtomicU64,
    fail_on_calls: Vec<u64>,
    /// Overrides the schedule: every call fails while set
    down: AtomicBool,
}

impl FaultPlan {
    fn on_calls(fail_on_calls: Vec<u64>) -> Self {
        Self {
            call_count: AtomicU64::new(0),
            fail_on_calls,
            down: AtomicBool::new(false),
        }
    }

    fn first(n: u64) -> Self {
        Self::on_calls((1..=n).collect())
    }

    fn never() -> Self {
        Self::on_calls(Vec::new())
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.down.load(Ordering::SeqCst) || self.fail_on_calls.contains(&count)
    }
}

/// Key-value backend whose calls fail according to a [`FaultPlan`].
struct FailingBackend {
    inner: InMemoryBackend,
    plan: FaultPlan,
}

impl FailingBackend {
    fn new(plan: FaultPlan) -> Self {
        Self { inner: InMemoryBackend::new(), plan }
    }

    fn maybe_fail(&self) -> Result<(), StorageError> {
        if self.plan.should_fail() {
            Err(StorageError::Backend("disk I/O error".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvBackend for FailingBackend {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.maybe_fail()?;
        self.inner.get_item(key).await
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.set_item(key, value).await
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.remove_item(key).await
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, StorageError> {
        self.maybe_fail()?;
        self.inner.get_all_keys().await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.maybe_fail()?;
        self.inner.clear().await
    }
}

/// Transport that refuses connections per its plan and otherwise answers 200.
struct FlakyTransport {
    plan: FaultPlan,
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        if self.plan.should_fail() {
            return Err(TransportError::Connect("connection reset by peer".into()));
        }
        Ok(HttpResponse::new(200, "OK").with_json(&json!({"url": request.url})))
    }
}

/// Remote store that reports `Unavailable` per its plan.
struct FlakyRemote {
    inner: InMemoryRemoteStore,
    plan: FaultPlan,
}

impl FlakyRemote {
    fn maybe_fail(&self) -> Result<(), RemoteError> {
        if self.plan.should_fail() {
            Err(RemoteError::Unavailable("deadline exceeded".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for FlakyRemote {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, RemoteError> {
        self.maybe_fail()?;
        self.inner.get_document(collection, id).await
    }

    async fn set_document(&self, collection: &str, id: &str, data: &Value, merge: bool) -> Result<(), RemoteError> {
        self.maybe_fail()?;
        self.inner.set_document(collection, id, data, merge).await
    }

    async fn update_document(&self, collection: &str, id: &str, patch: &Value) -> Result<(), RemoteError> {
        self.maybe_fail()?;
        self.inner.update_document(collection, id, patch).await
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.maybe_fail()?;
        self.inner.delete_document(collection, id).await
    }

    async fn commit_batch(&self, ops: &[BatchOp]) -> Result<(), RemoteError> {
        self.maybe_fail()?;
        self.inner.commit_batch(ops).await
    }

    async fn watch_collection(&self, query: &DocumentQuery) -> Result<mpsc::Receiver<RemoteChange>, RemoteError> {
        self.inner.watch_collection(query).await
    }

    async fn watch_document(&self, collection: &str, id: &str) -> Result<mpsc::Receiver<RemoteChange>, RemoteError> {
        self.inner.watch_document(collection, id).await
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn config() -> OfflineConfig {
    OfflineConfig {
        retry_base_delay_ms: 5,
        retry_max_delay_ms: 20,
        remote_circuit_failure_threshold: 1000,
        ..OfflineConfig::default()
    }
}

/// Sync service without background tasks, so passes run only when called.
struct SyncRig {
    clock: Arc<ManualClock>,
    remote: Arc<FlakyRemote>,
    sync: Arc<RealtimeSync>,
}

fn sync_rig(plan: FaultPlan, config: &OfflineConfig) -> SyncRig {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(DurableStore::new(Arc::new(InMemoryBackend::new()), clock.clone(), config).unwrap());
    let cache = Arc::new(Cache::new(store.clone(), clock.clone(), config));
    let monitor = Arc::new(NetworkMonitor::new(NetworkStatus::online("wifi")));
    let remote = Arc::new(FlakyRemote {
        inner: InMemoryRemoteStore::new(clock.clone()),
        plan,
    });
    let sync = Arc::new(RealtimeSync::new(remote.clone(), cache, monitor, store, clock.clone(), config));
    SyncRig { clock, remote, sync }
}

// =============================================================================
// Device storage failures
// =============================================================================

#[tokio::test]
async fn chaos_dead_disk_never_fails_cache_operations() {
    let backend = Arc::new(FailingBackend::new(FaultPlan::never()));
    backend.plan.set_down(true);
    let clock = Arc::new(ManualClock::default());
    let config = config();
    let store = Arc::new(DurableStore::new(backend.clone(), clock.clone(), &config).unwrap());
    let cache = Cache::new(store, clock, &config);

    cache.set("customers:cu1", &json!({"name": "Sam"}), None).await;
    let hit: Option<Value> = cache.get("customers:cu1").await;
    assert_eq!(hit, Some(json!({"name": "Sam"})));

    // A miss falls through to the dead disk and is still just a miss
    assert_eq!(cache.get::<Value>("customers:cu2").await, None);
    cache.remove("customers:cu1").await;
    assert!(!cache.contains("customers:cu1"));
    assert_eq!(cache.warm_from_store().await, 0);
    assert!(backend.plan.calls() > 0);
}

#[tokio::test]
async fn chaos_engine_runs_on_a_dead_disk() {
    let backend = Arc::new(FailingBackend::new(FaultPlan::never()));
    backend.plan.set_down(true);
    let clock = Arc::new(ManualClock::default());
    let engine = OfflineEngine::new(
        config(),
        Collaborators {
            backend: backend.clone(),
            transport: Arc::new(FlakyTransport { plan: FaultPlan::never() }),
            remote: Arc::new(InMemoryRemoteStore::new(clock.clone())),
            probe: Arc::new(ManualProbe::new(NetworkStatus::offline())),
            clock,
        },
    )
    .unwrap();

    engine.start().await.unwrap();
    assert_eq!(engine.state(), EngineState::Running);

    let id = engine.sync().queue_create("jobs", "j1", &json!({"bay": 2})).await.unwrap();
    assert!(!id.is_empty());
    assert_eq!(engine.sync().queue_size(), 1);

    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn chaos_corrupted_queue_blob_is_ignored_at_startup() {
    let backend = Arc::new(InMemoryBackend::new());
    let config = config();
    let queue_key = StorageKey::SyncQueue.render(&config.app_prefix);
    let garbage = "{\"version\":1,\"data\":[{\"id\":";
    backend.put_raw(&queue_key, garbage);
    let clock = Arc::new(ManualClock::default());
    let engine = OfflineEngine::new(
        config,
        Collaborators {
            backend: backend.clone(),
            transport: Arc::new(FlakyTransport { plan: FaultPlan::never() }),
            remote: Arc::new(InMemoryRemoteStore::new(clock.clone())),
            probe: Arc::new(ManualProbe::new(NetworkStatus::offline())),
            clock,
        },
    )
    .unwrap();

    engine.start().await.unwrap();
    assert_eq!(engine.sync().queue_size(), 0);

    // The next mutation overwrites the garbage with a readable queue
    engine.sync().queue_delete("cars", "c3").await;
    engine.shutdown().await;
    assert_ne!(backend.raw(&queue_key).unwrap(), garbage);
}

#[tokio::test]
async fn chaos_intermittent_disk_errors_during_sets() {
    // Every other backend call fails
    let backend = Arc::new(FailingBackend::new(FaultPlan::on_calls((1..=200).filter(|n| n % 2 == 0).collect())));
    let clock = Arc::new(ManualClock::default());
    let config = config();
    let store = Arc::new(DurableStore::new(backend, clock.clone(), &config).unwrap());
    let cache = Cache::new(store, clock, &config);

    for i in 0..20 {
        cache.set(&format!("parts:p{i}"), &json!({"qty": i}), None).await;
    }
    for i in 0..20 {
        let hit: Option<Value> = cache.get(&format!("parts:p{i}")).await;
        assert_eq!(hit, Some(json!({"qty": i})));
    }
}

// =============================================================================
// Transport failures
// =============================================================================

#[tokio::test]
async fn chaos_connection_resets_are_retried() {
    let clock = Arc::new(ManualClock::default());
    let transport = Arc::new(FlakyTransport { plan: FaultPlan::first(2) });
    let monitor = Arc::new(NetworkMonitor::new(NetworkStatus::online("cellular")));
    let client = NetworkClient::new(transport.clone(), monitor, clock, &config());

    let response = client
        .request("https://api.garage.test/cars", RequestOptions::default(), RequestConfig::default())
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(transport.plan.calls(), 3);
}

#[tokio::test]
async fn chaos_connection_resets_exhaust_retry_budget() {
    let clock = Arc::new(ManualClock::default());
    let transport = Arc::new(FlakyTransport { plan: FaultPlan::first(10) });
    let monitor = Arc::new(NetworkMonitor::new(NetworkStatus::online("cellular")));
    let client = NetworkClient::new(transport.clone(), monitor, clock, &config());

    let err = client
        .request(
            "https://api.garage.test/cars",
            RequestOptions::default(),
            RequestConfig { retries: Some(1), ..RequestConfig::default() },
        )
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(transport.plan.calls(), 2);
}

// =============================================================================
// Remote store failures
// =============================================================================

#[tokio::test]
async fn chaos_transient_remote_errors_are_retried_across_passes() {
    let rig = sync_rig(FaultPlan::first(2), &config());
    rig.sync.queue_create("customers", "cu1", &json!({"name": "Lee"})).await.unwrap();

    let first = rig.sync.process_sync_queue().await;
    assert_eq!(first.requeued, 1);
    let second = rig.sync.process_sync_queue().await;
    assert_eq!(second.requeued, 1);
    assert_eq!(rig.sync.pending_mutations()[0].retries, 2);

    let third = rig.sync.process_sync_queue().await;
    assert_eq!(third.synced, 1);
    assert_eq!(rig.sync.queue_size(), 0);
    assert!(rig.remote.inner.document("customers", "cu1").is_some());
}

#[tokio::test]
async fn chaos_failed_create_holds_back_later_edits() {
    let rig = sync_rig(FaultPlan::first(1), &config());
    rig.sync.queue_create("cars", "c1", &json!({"make": "Saab", "mileage": 100})).await.unwrap();
    rig.sync.queue_update("cars", "c1", &json!({"mileage": 500})).await.unwrap();

    let first = rig.sync.process_sync_queue().await;
    assert_eq!((first.synced, first.requeued, first.failed), (0, 2, 0));
    assert!(!rig.sync.is_unsynced("cars", "c1"));

    // The edit was held without reaching the remote or spending retries
    assert_eq!(rig.remote.plan.calls(), 1);
    let pending = rig.sync.pending_mutations();
    assert_eq!(pending[0].retries, 1);
    assert_eq!(pending[1].retries, 0);

    let second = rig.sync.process_sync_queue().await;
    assert_eq!(second.synced, 2);
    assert_eq!(rig.sync.queue_size(), 0);
    assert_eq!(rig.remote.inner.document("cars", "c1"), Some(json!({"make": "Saab", "mileage": 500})));
    assert!(!rig.sync.is_unsynced("cars", "c1"));
}

#[tokio::test]
async fn chaos_sustained_outage_exhausts_retries() {
    let config = OfflineConfig { sync_max_retries: 2, ..config() };
    let rig = sync_rig(FaultPlan::never(), &config);
    rig.remote.plan.set_down(true);
    rig.sync.queue_update("cars", "c1", &json!({"mileage": 10})).await.unwrap();

    let mut failed = 0;
    for _ in 0..3 {
        failed += rig.sync.process_sync_queue().await.failed;
    }

    assert_eq!(failed, 1);
    assert_eq!(rig.sync.queue_size(), 0);
    assert!(rig.sync.is_unsynced("cars", "c1"));
    assert_eq!(rig.sync.unsynced_documents()[0].retries, 2);
}

#[tokio::test]
async fn chaos_open_circuit_defers_without_charging_retries() {
    let config = OfflineConfig {
        remote_circuit_failure_threshold: 2,
        remote_circuit_recovery_secs: 3600,
        sync_max_retries: 50,
        ..config()
    };
    let rig = sync_rig(FaultPlan::never(), &config);
    rig.remote.plan.set_down(true);
    for id in ["a", "b", "c", "d"] {
        rig.sync.queue_create("jobs", id, &json!({"id": id})).await.unwrap();
    }

    let report = rig.sync.process_sync_queue().await;

    assert_eq!(rig.sync.circuit().state(), CircuitState::Open);
    assert_eq!(report.requeued, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(rig.sync.queue_size(), 4);

    // Only the calls that reached the remote were charged
    let charged: u32 = rig.sync.pending_mutations().iter().map(|m| m.retries).sum();
    assert_eq!(charged, 2);
    assert!(rig.sync.unsynced_documents().is_empty());
}

#[tokio::test]
async fn chaos_expired_mutation_is_dropped_and_flagged() {
    let rig = sync_rig(FaultPlan::never(), &config());
    rig.sync.queue_create("reports", "r1", &json!({"total": 120})).await.unwrap();
    rig.clock.advance(Duration::from_secs(config().sync_queue_max_age_secs + 1));

    let report = rig.sync.process_sync_queue().await;

    assert_eq!(report.expired, 1);
    assert_eq!(report.failed, 1);
    assert!(rig.sync.is_unsynced("reports", "r1"));
    assert!(rig.remote.inner.document("reports", "r1").is_none());
}
