//! End-to-end offline scenarios through the engine.
//!
//! Every collaborator is in-process: the in-memory key-value backend, the
//! in-memory remote store, a manual connectivity probe and a scripted HTTP
//! transport. No network or Docker needed.
//!
//! # Running Tests
//! ```bash
//! cargo test --test offline_scenarios
//! ```
//!
//! # Test Organization
//! - `happy_*` - normal operation: optimistic writes, queued requests, restart
//! - `failure_*` - permanent failures, retry bounds, expiry

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use offline_sync::clock::ManualClock;
use offline_sync::network::{HttpRequest, HttpResponse, ManualProbe, NetworkStatus, Transport, TransportError};
use offline_sync::realtime::{BatchOp, BatchOutcome, ChangeType, InMemoryRemoteStore, SyncNotice};
use offline_sync::storage::InMemoryBackend;
use offline_sync::{Collaborators, EngineState, OfflineConfig, OfflineEngine, RemoteStore, RequestError};

// =============================================================================
// Harness
// =============================================================================

/// Answers every request with the current status; records what it saw.
struct ScriptedTransport {
    status: AtomicU16,
    seen: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    fn new(status: u16) -> Self {
        Self {
            status: AtomicU16::new(status),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.seen.lock().push(request.clone());
        let status = self.status.load(Ordering::SeqCst);
        let text = if status < 400 { "OK" } else { "Service Unavailable" };
        Ok(HttpResponse::new(status, text).with_json(&json!({"path": request.url})))
    }
}

struct Device {
    backend: Arc<InMemoryBackend>,
    remote: Arc<InMemoryRemoteStore>,
    probe: Arc<ManualProbe>,
    clock: Arc<ManualClock>,
    transport: Arc<ScriptedTransport>,
}

impl Device {
    fn new(online: bool) -> Self {
        let clock = Arc::new(ManualClock::default());
        let status = if online { NetworkStatus::online("wifi") } else { NetworkStatus::offline() };
        Self {
            backend: Arc::new(InMemoryBackend::new()),
            remote: Arc::new(InMemoryRemoteStore::new(clock.clone())),
            probe: Arc::new(ManualProbe::new(status)),
            clock,
            transport: Arc::new(ScriptedTransport::new(200)),
        }
    }

    fn config() -> OfflineConfig {
        OfflineConfig {
            api_base_url: Some("https://api.garage.test".into()),
            retry_base_delay_ms: 5,
            retry_max_delay_ms: 20,
            remote_circuit_failure_threshold: 1000,
            ..OfflineConfig::default()
        }
    }

    async fn boot(&self) -> OfflineEngine {
        self.boot_with(Self::config()).await
    }

    async fn boot_with(&self, config: OfflineConfig) -> OfflineEngine {
        let engine = OfflineEngine::new(
            config,
            Collaborators {
                backend: self.backend.clone(),
                transport: self.transport.clone(),
                remote: self.remote.clone(),
                probe: self.probe.clone(),
                clock: self.clock.clone(),
            },
        )
        .expect("engine");
        engine.start().await.expect("start");
        engine
    }
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 3s");
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn happy_mileage_update_made_offline_reaches_remote() {
    let device = Device::new(false);
    device.remote.set_document("cars", "c1", &json!({"reg": "AB12 CDE", "mileage": 48_000}), false).await.unwrap();
    let engine = device.boot().await;

    let (tx, mut changes) = mpsc::unbounded_channel();
    let sync = engine.sync().clone();
    sync.subscribe_to_document("cars", "c1", move |event| {
        let _ = tx.send(event);
    })
    .await
    .unwrap();

    // Snapshot lands in the cache
    let first = changes.recv().await.unwrap();
    assert_eq!(first.change_type, ChangeType::Added);
    let cache = engine.cache().clone();
    wait_until(|| cache.contains("cars:c1")).await;

    // Technician updates mileage with no signal
    engine.sync().queue_update("cars", "c1", &json!({"mileage": 51_200})).await.unwrap();
    let cached: Value = engine.cache().get("cars:c1").await.unwrap();
    assert_eq!(cached, json!({"reg": "AB12 CDE", "mileage": 51_200}));
    assert_eq!(device.remote.document("cars", "c1").unwrap()["mileage"], 48_000);
    assert_eq!(engine.sync().queue_size(), 1);

    device.probe.set_online(true);

    let remote = device.remote.clone();
    wait_until(|| remote.document("cars", "c1").is_some_and(|d| d["mileage"] == 51_200)).await;
    let sync = engine.sync().clone();
    wait_until(|| sync.queue_size() == 0).await;

    assert_eq!(device.remote.document("cars", "c1").unwrap()["reg"], "AB12 CDE");
    assert!(!engine.sync().is_unsynced("cars", "c1"));

    engine.shutdown().await;
}

#[tokio::test]
async fn happy_remote_change_does_not_clobber_pending_edit() {
    let device = Device::new(false);
    device.remote.set_document("jobs", "j1", &json!({"status": "open"}), false).await.unwrap();
    let engine = device.boot().await;

    let (tx, mut changes) = mpsc::unbounded_channel();
    let sync = engine.sync().clone();
    sync.subscribe_to_collection("jobs", None, move |event| {
        let _ = tx.send(event);
    })
    .await
    .unwrap();
    changes.recv().await.unwrap();

    engine.sync().queue_update("jobs", "j1", &json!({"status": "done"})).await.unwrap();

    // The office edits the same job while the device is offline
    device.remote.set_document("jobs", "j1", &json!({"status": "waiting_parts"}), false).await.unwrap();
    let echoed = changes.recv().await.unwrap();
    assert_eq!(echoed.change_type, ChangeType::Modified);

    let cached: Value = engine.cache().get("jobs:j1").await.unwrap();
    assert_eq!(cached["status"], "done");

    device.probe.set_online(true);
    let remote = device.remote.clone();
    wait_until(|| remote.document("jobs", "j1").is_some_and(|d| d["status"] == "done")).await;

    engine.shutdown().await;
}

#[tokio::test]
async fn happy_request_queued_offline_resolves_on_reconnect() {
    let device = Device::new(false);
    let engine = device.boot().await;

    let client = engine.client().clone();
    let pending = tokio::spawn(async move { client.post("/jobs/j1/notes", json!({"text": "brake pads"})).await });

    let client = engine.client().clone();
    wait_until(|| client.queue_size() == 1).await;
    assert_eq!(device.transport.calls(), 0);

    device.probe.set_online(true);
    let response = tokio::time::timeout(Duration::from_secs(3), pending).await.unwrap().unwrap().unwrap();

    assert_eq!(response.status, 200);
    let body: Value = response.json().unwrap();
    assert_eq!(body["path"], "https://api.garage.test/jobs/j1/notes");
    assert_eq!(engine.client().queue_size(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn happy_offline_batch_is_split_into_mutations() {
    let device = Device::new(false);
    device.remote.set_document("cars", "c2", &json!({"colour": "red"}), false).await.unwrap();
    let engine = device.boot().await;

    let outcome = engine
        .sync()
        .execute_batch(vec![
            BatchOp::Set { collection: "jobs".into(), id: "j7".into(), data: json!({"car": "c2"}), merge: false },
            BatchOp::Update { collection: "cars".into(), id: "c2".into(), data: json!({"colour": "blue"}) },
        ])
        .await
        .unwrap();
    assert_eq!(outcome, BatchOutcome::Queued(2));
    assert_eq!(engine.sync().queue_size(), 2);

    device.probe.set_online(true);
    let remote = device.remote.clone();
    wait_until(|| remote.document("jobs", "j7").is_some() && remote.document("cars", "c2").is_some_and(|d| d["colour"] == "blue")).await;

    engine.shutdown().await;
}

#[tokio::test]
async fn happy_queue_survives_app_restart() {
    let device = Device::new(false);

    let engine = device.boot().await;
    engine.sync().queue_create("inspections", "i1", &json!({"tyres": "ok"})).await.unwrap();
    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Stopped);

    let engine = device.boot().await;
    assert_eq!(engine.sync().queue_size(), 1);
    let cached: Value = engine.cache().get("inspections:i1").await.unwrap();
    assert_eq!(cached["tyres"], "ok");

    device.probe.set_online(true);
    let remote = device.remote.clone();
    wait_until(|| remote.document("inspections", "i1").is_some()).await;

    engine.shutdown().await;
}

// =============================================================================
// Failure scenarios
// =============================================================================

#[tokio::test]
async fn failure_rejected_mutation_flags_entity_unsynced() {
    let device = Device::new(true);
    let engine = device.boot().await;
    let mut notices = engine.sync().notices();

    // Update of a document the remote has never seen is a permanent error
    engine.sync().queue_update("cars", "ghost", &json!({"mileage": 9})).await.unwrap();

    let notice = tokio::time::timeout(Duration::from_secs(3), notices.recv()).await.unwrap().unwrap();
    let SyncNotice::PermanentFailure(failure) = notice;
    assert_eq!(failure.collection, "cars");
    assert_eq!(failure.document_id, "ghost");

    assert!(engine.sync().is_unsynced("cars", "ghost"));
    assert_eq!(engine.health().unsynced, 1);
    let cached: Value = engine.cache().get("cars:ghost").await.unwrap();
    assert_eq!(cached["mileage"], 9);

    assert!(engine.sync().discard_unsynced("cars", "ghost").await);
    assert_eq!(engine.cache().get::<Value>("cars:ghost").await, None);
    assert!(engine.sync().unsynced_documents().is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn failure_server_errors_retry_a_bounded_number_of_times() {
    let device = Device::new(true);
    device.transport.status.store(503, Ordering::SeqCst);
    let engine = device.boot().await;

    let err = engine.client().get("/customers").await.unwrap_err();

    assert!(matches!(err, RequestError::Http { status: 503, .. }));
    assert_eq!(device.transport.calls(), 1 + engine.config().request_max_retries);

    engine.shutdown().await;
}

#[tokio::test]
async fn failure_client_errors_are_not_retried() {
    let device = Device::new(true);
    device.transport.status.store(422, Ordering::SeqCst);
    let engine = device.boot().await;

    let err = engine.client().put("/cars/c1", json!({"vin": ""})).await.unwrap_err();

    assert!(err.is_client_error());
    assert_eq!(device.transport.calls(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn failure_stale_request_is_rejected_on_drain() {
    let device = Device::new(false);
    let engine = device.boot().await;

    let client = engine.client().clone();
    let pending = tokio::spawn(async move { client.get("/reports/weekly").await });
    let client = engine.client().clone();
    wait_until(|| client.queue_size() == 1).await;

    device.clock.advance(Duration::from_secs(engine.config().request_queue_max_age_secs + 1));
    device.probe.set_online(true);

    let err = tokio::time::timeout(Duration::from_secs(3), pending).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, RequestError::Expired { .. }));
    assert_eq!(device.transport.calls(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn failure_remote_outage_keeps_mutations_queued() {
    let device = Device::new(true);
    device.remote.set_available(false);
    let config = OfflineConfig {
        sync_max_retries: 100,
        ..Device::config()
    };
    let engine = device.boot_with(config).await;

    engine.sync().queue_create("customers", "cu1", &json!({"name": "Pat"})).await.unwrap();
    let report = engine.sync().process_sync_queue().await;
    assert!(report.requeued == 1 || report.skipped);
    assert_eq!(engine.sync().queue_size(), 1);
    assert!(!engine.sync().is_unsynced("customers", "cu1"));

    device.remote.set_available(true);
    for _ in 0..50 {
        if engine.sync().queue_size() == 0 {
            break;
        }
        engine.sync().process_sync_queue().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.sync().queue_size(), 0);
    assert!(device.remote.document("customers", "cu1").is_some());

    engine.shutdown().await;
}
