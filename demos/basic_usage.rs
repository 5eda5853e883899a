// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic offline-sync usage example.
//!
//! Demonstrates:
//! 1. Starting the engine on a SQLite file with the network down
//! 2. Optimistic edits that land in the cache immediately
//! 3. A request issued offline waiting in the request queue
//! 4. Reconnecting: queued mutations and requests drain on their own
//! 5. Displaying health and metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use offline_sync::clock::SystemClock;
use offline_sync::network::{HttpRequest, HttpResponse, ManualProbe, NetworkStatus, Transport, TransportError};
use offline_sync::realtime::InMemoryRemoteStore;
use offline_sync::storage::SqliteBackend;
use offline_sync::{Collaborators, EngineState, OfflineConfig, OfflineEngine, RemoteStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stand-in for the garage API: echoes the path back.
struct EchoApi;

#[async_trait]
impl Transport for EchoApi {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse::new(200, "OK").with_json(&json!({
            "method": request.method.as_str(),
            "url": request.url,
        })))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "offline_sync=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           offline-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine (no signal in the workshop)
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring offline-sync...");

    let db_dir = std::env::temp_dir().join("offline_sync_demo");
    std::fs::create_dir_all(&db_dir)?;
    let db_path = db_dir.join("garage.db");

    let config = OfflineConfig {
        app_prefix: "garage".into(),
        api_base_url: Some("https://api.garage.example".into()),
        storage_path: Some(db_path.display().to_string()),
        ..Default::default()
    };

    let clock = Arc::new(SystemClock);
    let remote = Arc::new(InMemoryRemoteStore::new(clock.clone()));
    remote.set_document("cars", "c1", &json!({"reg": "AB12 CDE", "mileage": 48_000}), false).await?;
    let probe = Arc::new(ManualProbe::new(NetworkStatus::offline()));

    let backend = Arc::new(SqliteBackend::from_config(&config).await?);
    let engine = OfflineEngine::new(
        config,
        Collaborators {
            backend,
            transport: Arc::new(EchoApi),
            remote: remote.clone(),
            probe: probe.clone(),
            clock,
        },
    )?;

    println!("   State: {}", engine.state());
    engine.start().await?;
    assert_eq!(engine.state(), EngineState::Running);
    println!("   ✅ Engine running (online: {})", engine.monitor().is_online_now());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Optimistic edits while offline
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Recording work offline...");

    let start = Instant::now();
    engine.sync().queue_update("cars", "c1", &json!({"mileage": 51_200})).await?;
    engine.sync().queue_create("jobs", "j1", &json!({"car": "c1", "task": "brake pads"})).await?;
    println!("   └─ Queued 2 mutations ({:?})", start.elapsed());

    let car: Option<Value> = engine.cache().get("cars:c1").await;
    println!("   └─ Cached car: {}", car.unwrap_or(Value::Null));
    println!("   └─ Remote car: {}", remote.document("cars", "c1").unwrap_or(Value::Null));

    // ─────────────────────────────────────────────────────────────────────────
    // 3. A request issued offline waits in the queue
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📮 Posting a note offline...");
    let client = engine.client().clone();
    let note = tokio::spawn(async move { client.post("/jobs/j1/notes", json!({"text": "pads at 2mm"})).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("   └─ Request queue: {}", engine.client().queue_size());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Signal comes back
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📶 Reconnecting...");
    probe.set(NetworkStatus::online("wifi"));

    let response = note.await??;
    println!("   └─ Note delivered: {} {:?}", response.status, response.data);

    for _ in 0..50 {
        if engine.sync().queue_size() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("   └─ Remote car: {}", remote.document("cars", "c1").unwrap_or(Value::Null));
    println!("   └─ Remote job: {}", remote.document("jobs", "j1").unwrap_or(Value::Null));

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Health and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let health = engine.health();
    println!("\n🩺 Health:");
    println!("   ┌─ State: {} (healthy: {})", health.state, health.healthy);
    println!("   ├─ Online: {} ({})", health.online, health.connection_type);
    println!("   ├─ Cache: {} items, hit rate {:.0}%", health.cache.total_items, health.cache.hit_rate * 100.0);
    println!("   ├─ Queues: {} requests, {} mutations", health.request_queue, health.sync_queue);
    println!("   └─ Unsynced: {}", health.unsynced);

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", engine.state());

    if let Err(e) = std::fs::remove_dir_all(&db_dir) {
        println!("   └─ Warning: could not remove {}: {}", db_dir.display(), e);
    }

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        let rendered = match value {
            DebugValue::Counter(v) => v.to_string(),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
        };
        lines.push(format!("{}{} = {}", key.name(), label_str, rendered));
    }
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
