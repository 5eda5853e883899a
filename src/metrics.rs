// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for offline-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host app is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size gauges
//!
//! # Labels
//! - `tier`: memory, durable, network, remote
//! - `operation`: get, set, remove, store, retrieve, request, ...
//! - `status`: success, error, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record an operation outcome
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "offline_sync_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "offline_sync_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE - Memory tier health
// ═══════════════════════════════════════════════════════════════════════════

/// Set current memory-tier item count
pub fn set_cache_items(count: usize) {
    gauge!("offline_sync_cache_items").set(count as f64);
}

/// Set current memory-tier size in bytes
pub fn set_cache_bytes(bytes: usize) {
    gauge!("offline_sync_cache_bytes").set(bytes as f64);
}

/// Record a cache lookup
pub fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "offline_sync_cache_lookups_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Record LRU eviction
pub fn record_eviction(count: usize, bytes: usize) {
    counter!("offline_sync_evictions_total").increment(count as u64);
    counter!("offline_sync_evicted_bytes_total").increment(bytes as u64);
}

/// Record entries dropped for exceeding their TTL
pub fn record_expired(count: usize) {
    counter!("offline_sync_expired_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// DURABLE STORE - Integrity and migrations
// ═══════════════════════════════════════════════════════════════════════════

/// Record data corruption detection
pub fn record_corruption(key: &str) {
    counter!(
        "offline_sync_corruption_detected_total",
        "key" => key.to_string()
    )
    .increment(1);
}

/// Record a schema migration applied on read
pub fn record_migration(from: u32, to: u32) {
    counter!(
        "offline_sync_migrations_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Record bytes written to a tier
pub fn record_bytes_written(tier: &str, bytes: usize) {
    counter!(
        "offline_sync_bytes_written_total",
        "tier" => tier.to_string()
    )
    .increment(bytes as u64);
}

/// Record bytes read from a tier
pub fn record_bytes_read(tier: &str, bytes: usize) {
    counter!(
        "offline_sync_bytes_read_total",
        "tier" => tier.to_string()
    )
    .increment(bytes as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with category for alerting
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "offline_sync_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a timeout error
pub fn record_timeout(tier: &str, operation: &str) {
    counter!(
        "offline_sync_timeouts_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE DEPTHS - Pending work
// ═══════════════════════════════════════════════════════════════════════════

/// Set request queue depth (requests waiting for connectivity)
pub fn set_request_queue_depth(count: usize) {
    gauge!("offline_sync_request_queue_items").set(count as f64);
}

/// Set sync queue depth (mutations waiting for the remote store)
pub fn set_sync_queue_depth(count: usize) {
    gauge!("offline_sync_sync_queue_items").set(count as f64);
}

/// Record one request-queue drain pass
pub fn record_drain(resolved: usize, requeued: usize, rejected: usize) {
    counter!("offline_sync_drain_passes_total").increment(1);
    counter!("offline_sync_drain_items_total", "outcome" => "resolved").increment(resolved as u64);
    counter!("offline_sync_drain_items_total", "outcome" => "requeued").increment(requeued as u64);
    counter!("offline_sync_drain_items_total", "outcome" => "rejected").increment(rejected as u64);
}

/// Record one sync-queue processing pass
pub fn record_sync_pass(synced: usize, requeued: usize, failed: usize) {
    counter!("offline_sync_sync_passes_total").increment(1);
    counter!("offline_sync_sync_items_total", "outcome" => "synced").increment(synced as u64);
    counter!("offline_sync_sync_items_total", "outcome" => "requeued").increment(requeued as u64);
    counter!("offline_sync_sync_items_total", "outcome" => "failed").increment(failed as u64);
}

/// Set the number of entities whose optimistic write never reached the remote
pub fn set_unsynced_entities(count: usize) {
    gauge!("offline_sync_unsynced_entities").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTIVITY & RESILIENCE
// ═══════════════════════════════════════════════════════════════════════════

/// Set connectivity status (1 = online, 0 = offline)
pub fn set_online(online: bool) {
    gauge!("offline_sync_online").set(if online { 1.0 } else { 0.0 });
}

/// Record circuit breaker state change
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "offline_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "offline_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a structured event by name
pub fn record_event(event: &'static str) {
    counter!(
        "offline_sync_events_total",
        "event" => event
    )
    .increment(1);
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "offline_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record total startup time
pub fn record_startup_total(duration: Duration) {
    histogram!("offline_sync_startup_seconds").record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
