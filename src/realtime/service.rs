// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realtime sync: remote change streams in, optimistic mutations out.
//!
//! # Mutation path
//!
//! ```text
//! queue_update(cars, c1, {mileage: 500})
//!        │
//!        ├──► cache.merge("cars:c1")        (visible immediately)
//!        ├──► SyncQueue.push + persist
//!        └──► wake processor
//!                    │ online
//!                    ▼
//!        process_sync_queue ──► circuit ──► RemoteStore.update_document
//!                    │
//!                    ├─ ok                  → settled
//!                    ├─ transient / open    → requeued
//!                    └─ permanent / expired → flagged unsynced + SyncNotice
//! ```
//!
//! Remote changes for a document with a mutation still queued do not touch
//! the cache, so a stale echo can't overwrite the optimistic value.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::remote::{BatchOp, ChangeType, DocumentQuery, RemoteChange, RemoteError, RemoteStore};
use super::subscription::{SubscriptionHandle, SubscriptionManager};
use super::sync_queue::{SyncOperation, SyncQueue, SyncQueueItem};
use crate::cache::Cache;
use crate::clock::Clock;
use crate::config::OfflineConfig;
use crate::events::OfflineEvent;
use crate::keys::CacheKey;
use crate::metrics;
use crate::network::NetworkMonitor;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::storage::DurableStore;

const NOTICE_BUFFER: usize = 64;

/// Normalized change handed to subscription callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub change_type: ChangeType,
    pub collection: String,
    pub document_id: String,
    pub data: Option<Value>,
    pub timestamp_ms: u64,
}

impl From<RemoteChange> for ChangeEvent {
    fn from(change: RemoteChange) -> Self {
        Self {
            change_type: change.change_type,
            collection: change.collection,
            document_id: change.document_id,
            data: change.data,
            timestamp_ms: change.timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("queued mutation expired after {age_ms} ms")]
    Expired { age_ms: u64 },

    #[error("sync queue was cleared")]
    QueueCleared,

    #[error("remote circuit is open")]
    CircuitOpen,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<CircuitError<RemoteError>> for SyncError {
    fn from(e: CircuitError<RemoteError>) -> Self {
        match e {
            CircuitError::Rejected => Self::CircuitOpen,
            CircuitError::Inner(e) => Self::Remote(e),
        }
    }
}

/// A mutation that will never reach the remote store on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFailure {
    pub collection: String,
    pub document_id: String,
    pub operation: SyncOperation,
    pub error: SyncError,
    pub retries: u32,
    pub failed_at_ms: u64,
    /// Queue position of the failed mutation
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    /// The entity keeps its optimistic value locally but is now flagged unsynced
    PermanentFailure(SyncFailure),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub requeued: usize,
    /// Includes `expired`
    pub failed: usize,
    pub expired: usize,
    /// Another pass was already running
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Offline: split into individual queued mutations
    Queued(usize),
    /// Online: committed atomically
    Committed(usize),
}

struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn document_key(collection: &str, id: &str) -> String {
    CacheKey::document(collection, id).to_string()
}

pub struct RealtimeSync {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<Cache>,
    monitor: Arc<NetworkMonitor>,
    clock: Arc<dyn Clock>,
    queue: SyncQueue,
    subscriptions: SubscriptionManager,
    circuit: CircuitBreaker,
    failures: DashMap<(String, String), SyncFailure>,
    notices: broadcast::Sender<SyncNotice>,
    wake: Notify,
    processing: AtomicBool,
    max_retries: u32,
    max_age: Duration,
    process_interval: Duration,
}

impl RealtimeSync {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<Cache>,
        monitor: Arc<NetworkMonitor>,
        store: Arc<DurableStore>,
        clock: Arc<dyn Clock>,
        config: &OfflineConfig,
    ) -> Self {
        let (notices, _rx) = broadcast::channel(NOTICE_BUFFER);
        Self {
            remote,
            cache,
            monitor,
            clock,
            queue: SyncQueue::new(store),
            subscriptions: SubscriptionManager::new(),
            circuit: CircuitBreaker::new("remote", config.remote_circuit()),
            failures: DashMap::new(),
            notices,
            wake: Notify::new(),
            processing: AtomicBool::new(false),
            max_retries: config.sync_max_retries,
            max_age: config.sync_queue_max_age(),
            process_interval: Duration::from_secs(config.sync_process_interval_secs.max(1)),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Subscriptions
    // ═══════════════════════════════════════════════════════════════════════

    /// Watch a collection. Without a query every document matches.
    pub async fn subscribe_to_collection<F>(
        self: &Arc<Self>,
        collection: &str,
        query: Option<DocumentQuery>,
        callback: F,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let mut query = query.unwrap_or_else(|| DocumentQuery::new(collection));
        query.collection = collection.to_string();

        let rx = self.remote.watch_collection(&query).await?;
        Ok(self.forward(collection.to_string(), rx, callback))
    }

    pub async fn subscribe_to_document<F>(
        self: &Arc<Self>,
        collection: &str,
        id: &str,
        callback: F,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let rx = self.remote.watch_document(collection, id).await?;
        Ok(self.forward(format!("{}/{}", collection, id), rx, callback))
    }

    fn forward<F>(self: &Arc<Self>, target: String, mut rx: mpsc::Receiver<RemoteChange>, callback: F) -> SubscriptionHandle
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let (handle, active) = self.subscriptions.reserve();
        let flag = Arc::clone(&active);
        let sync: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                let Some(sync) = sync.upgrade() else {
                    break;
                };
                sync.apply_remote_change(&change).await;

                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                let document_id = change.document_id.clone();
                if catch_unwind(AssertUnwindSafe(|| callback(ChangeEvent::from(change)))).is_err() {
                    error!(subscription = handle.id(), document_id = %document_id, "Subscription callback panicked");
                }
            }
        });

        self.subscriptions.insert(handle, target, active, task);
        handle
    }

    async fn apply_remote_change(&self, change: &RemoteChange) {
        let id = (change.collection.clone(), change.document_id.clone());
        if self.failures.remove(&id).is_some() {
            info!(
                collection = %change.collection,
                document_id = %change.document_id,
                "Remote change cleared unsynced flag"
            );
            metrics::set_unsynced_entities(self.failures.len());
        }

        if self.queue.has_pending(&change.collection, &change.document_id) {
            debug!(
                collection = %change.collection,
                document_id = %change.document_id,
                "Local mutation pending, skipping cache write"
            );
            return;
        }

        let key = document_key(&change.collection, &change.document_id);
        match (&change.change_type, &change.data) {
            (ChangeType::Removed, _) | (_, None) => self.cache.remove(&key).await,
            (_, Some(data)) => self.cache.set(&key, data, None).await,
        }
    }

    /// Idempotent.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.subscriptions.unsubscribe(handle)
    }

    pub fn unsubscribe_all(&self) -> usize {
        self.subscriptions.unsubscribe_all()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Optimistic mutations
    // ═══════════════════════════════════════════════════════════════════════

    /// Returns the queue item id.
    pub async fn queue_create<T: Serialize + ?Sized>(
        &self,
        collection: &str,
        id: &str,
        data: &T,
    ) -> Result<String, SyncError> {
        let value = serde_json::to_value(data)?;
        self.cache.set(&document_key(collection, id), &value, None).await;
        Ok(self.enqueue(SyncOperation::Create, collection, id, Some(value)).await)
    }

    /// Shallow-merges `patch` into the cached document.
    pub async fn queue_update<T: Serialize + ?Sized>(
        &self,
        collection: &str,
        id: &str,
        patch: &T,
    ) -> Result<String, SyncError> {
        let value = serde_json::to_value(patch)?;
        self.cache.merge(&document_key(collection, id), &value, None).await;
        Ok(self.enqueue(SyncOperation::Update, collection, id, Some(value)).await)
    }

    pub async fn queue_delete(&self, collection: &str, id: &str) -> String {
        self.cache.remove(&document_key(collection, id)).await;
        self.enqueue(SyncOperation::Delete, collection, id, None).await
    }

    async fn enqueue(&self, operation: SyncOperation, collection: &str, id: &str, data: Option<Value>) -> String {
        let item = SyncQueueItem::new(operation, collection, id, data, self.clock.now_ms(), self.max_retries);
        let item_id = item.id.clone();

        let depth = self.queue.push(item);
        metrics::set_sync_queue_depth(depth);
        debug!(
            operation = operation.as_str(),
            collection = %collection,
            document_id = %id,
            queue_size = depth,
            "Queued mutation"
        );

        self.persist_queue().await;
        self.wake.notify_one();
        item_id
    }

    /// Write the queue to the durable store; failures are logged.
    pub async fn persist_queue(&self) {
        if let Err(e) = self.queue.persist().await {
            warn!(error = %e, "Failed to persist sync queue");
        }
    }

    /// Reload the persisted queue. Called once at engine start.
    pub async fn restore_queue(&self) -> usize {
        let restored = self.queue.restore().await;
        metrics::set_sync_queue_depth(self.queue.len());
        if restored > 0 {
            self.wake.notify_one();
        }
        restored
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Processing
    // ═══════════════════════════════════════════════════════════════════════

    /// One pass over a snapshot of the queue, oldest first.
    pub async fn process_sync_queue(&self) -> SyncReport {
        if self.processing.swap(true, Ordering::AcqRel) {
            return SyncReport { skipped: true, ..Default::default() };
        }
        let _guard = PassGuard(&self.processing);

        if !self.monitor.is_online_now() {
            return SyncReport { requeued: self.queue.len(), ..Default::default() };
        }

        let batch = self.queue.begin_pass();
        let mut report = SyncReport::default();
        if batch.is_empty() {
            self.queue.end_pass();
            return report;
        }
        info!(count = batch.len(), "Processing sync queue");

        let mut circuit_open = false;
        // Documents with a requeued mutation this pass; their later
        // mutations wait too so they reach the remote in order
        let mut blocked: HashSet<(String, String)> = HashSet::new();
        for mut item in batch {
            let age_ms = item.age_ms(self.clock.now_ms());
            if age_ms > self.max_age.as_millis() as u64 {
                self.queue.settle(&item.id);
                self.flag_unsynced(&item, SyncError::Expired { age_ms });
                report.failed += 1;
                report.expired += 1;
                continue;
            }

            let document = (item.collection.clone(), item.document_id.clone());

            // Open circuit, lost connection or an earlier mutation still
            // waiting: leave it for later, uncharged
            if circuit_open || blocked.contains(&document) || !self.monitor.is_online_now() {
                blocked.insert(document);
                self.queue.requeue(item);
                report.requeued += 1;
                continue;
            }

            match self.push_to_remote(&item).await {
                Ok(()) => {
                    self.queue.settle(&item.id);
                    self.clear_flag(&item);
                    report.synced += 1;
                }
                Err(SyncError::CircuitOpen) => {
                    circuit_open = true;
                    blocked.insert(document);
                    self.queue.requeue(item);
                    report.requeued += 1;
                }
                Err(SyncError::Remote(e)) if e.is_transient() && item.retries < item.max_retries => {
                    item.retries += 1;
                    debug!(id = %item.id, retries = item.retries, error = %e, "Requeueing mutation");
                    blocked.insert(document);
                    self.queue.requeue(item);
                    report.requeued += 1;
                }
                Err(e) => {
                    self.queue.settle(&item.id);
                    self.flag_unsynced(&item, e);
                    report.failed += 1;
                }
            }
        }

        self.queue.end_pass();
        self.persist_queue().await;

        metrics::record_sync_pass(report.synced, report.requeued, report.failed);
        metrics::set_sync_queue_depth(self.queue.len());
        info!(
            synced = report.synced,
            requeued = report.requeued,
            failed = report.failed,
            "Sync pass complete"
        );
        report
    }

    async fn push_to_remote(&self, item: &SyncQueueItem) -> Result<(), SyncError> {
        let remote = Arc::clone(&self.remote);
        let data = item.data.clone().unwrap_or_else(|| Value::Object(Default::default()));

        self.circuit
            .call_if(RemoteError::is_transient, || async move {
                match item.operation {
                    SyncOperation::Create => {
                        remote.set_document(&item.collection, &item.document_id, &data, false).await
                    }
                    SyncOperation::Update => remote.update_document(&item.collection, &item.document_id, &data).await,
                    SyncOperation::Delete => remote.delete_document(&item.collection, &item.document_id).await,
                }
            })
            .await
            .map_err(SyncError::from)
    }

    /// Process on wake-ups from new mutations, on reconnect, and on a timer.
    pub fn spawn_processor(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        let mut reconnected = self.monitor.reconnected();

        tokio::spawn(async move {
            let mut ticker = interval(sync.process_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = sync.wake.notified() => {}
                    changed = reconnected.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                if sync.monitor.is_online_now() && !sync.queue.is_empty() {
                    sync.process_sync_queue().await;
                }
            }
            debug!("Sync processor stopped");
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Batches and reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Commit atomically when online; queue each op when offline.
    pub async fn execute_batch(&self, ops: Vec<BatchOp>) -> Result<BatchOutcome, SyncError> {
        let count = ops.len();

        if !self.monitor.is_online_now() {
            for op in ops {
                match op {
                    BatchOp::Set { collection, id, data, merge: false } => {
                        self.queue_create(&collection, &id, &data).await?;
                    }
                    BatchOp::Set { collection, id, data, merge: true } | BatchOp::Update { collection, id, data } => {
                        self.queue_update(&collection, &id, &data).await?;
                    }
                    BatchOp::Delete { collection, id } => {
                        self.queue_delete(&collection, &id).await;
                    }
                }
            }
            return Ok(BatchOutcome::Queued(count));
        }

        let remote = Arc::clone(&self.remote);
        let batch = &ops;
        self.circuit
            .call_if(RemoteError::is_transient, || async move { remote.commit_batch(batch).await })
            .await?;

        for op in &ops {
            match op {
                BatchOp::Set { collection, id, data, merge: false } => {
                    self.cache.set(&document_key(collection, id), data, None).await;
                }
                BatchOp::Set { collection, id, data, merge: true } | BatchOp::Update { collection, id, data } => {
                    self.cache.merge(&document_key(collection, id), data, None).await;
                }
                BatchOp::Delete { collection, id } => {
                    self.cache.remove(&document_key(collection, id)).await;
                }
            }
        }
        debug!(count, "Committed batch");
        Ok(BatchOutcome::Committed(count))
    }

    /// Cache first; on a miss, fetch from the remote while online and cache it.
    pub async fn fetch_document<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>, SyncError> {
        let key = document_key(collection, id);
        if let Some(cached) = self.cache.get::<T>(&key).await {
            return Ok(Some(cached));
        }
        if !self.monitor.is_online_now() {
            return Ok(None);
        }

        let Some(document) = self.remote.get_document(collection, id).await? else {
            return Ok(None);
        };
        self.cache.set(&key, &document, None).await;
        Ok(Some(serde_json::from_value(document)?))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Unsynced entities
    // ═══════════════════════════════════════════════════════════════════════

    fn flag_unsynced(&self, item: &SyncQueueItem, error: SyncError) {
        let reason = error.to_string();
        OfflineEvent::SyncRejected {
            collection: &item.collection,
            document_id: &item.document_id,
            operation: item.operation.as_str(),
            reason: &reason,
        }
        .emit();

        let failure = SyncFailure {
            collection: item.collection.clone(),
            document_id: item.document_id.clone(),
            operation: item.operation,
            error,
            retries: item.retries,
            failed_at_ms: self.clock.now_ms(),
            seq: item.seq,
        };
        self.failures
            .insert((item.collection.clone(), item.document_id.clone()), failure.clone());
        metrics::set_unsynced_entities(self.failures.len());

        // No receivers is fine
        let _ = self.notices.send(SyncNotice::PermanentFailure(failure));
    }

    /// A mutation reached the remote. Only failures of mutations queued
    /// before it are resolved by that; a newer failed edit stays flagged.
    fn clear_flag(&self, settled: &SyncQueueItem) {
        let id = (settled.collection.clone(), settled.document_id.clone());
        if self.failures.remove_if(&id, |_, failure| failure.seq < settled.seq).is_some() {
            metrics::set_unsynced_entities(self.failures.len());
        }
    }

    #[must_use]
    pub fn is_unsynced(&self, collection: &str, id: &str) -> bool {
        self.failures.contains_key(&(collection.to_string(), id.to_string()))
    }

    /// Flagged entities ordered by collection, then id.
    #[must_use]
    pub fn unsynced_documents(&self) -> Vec<SyncFailure> {
        let mut failures: Vec<SyncFailure> = self.failures.iter().map(|e| e.value().clone()).collect();
        failures.sort_by(|a, b| (&a.collection, &a.document_id).cmp(&(&b.collection, &b.document_id)));
        failures
    }

    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    /// Give up on the local version: unflag, drop mutations still queued for
    /// the entity and the optimistic cache entry so the next read goes to
    /// the remote.
    pub async fn discard_unsynced(&self, collection: &str, id: &str) -> bool {
        let removed = self.failures.remove(&(collection.to_string(), id.to_string())).is_some();
        if removed {
            let dropped = self.queue.discard(collection, id);
            if dropped > 0 {
                self.persist_queue().await;
                metrics::set_sync_queue_depth(self.queue.len());
            }
            self.cache.remove(&document_key(collection, id)).await;
            metrics::set_unsynced_entities(self.failures.len());
            info!(collection = %collection, document_id = %id, dropped, "Discarded unsynced changes");
        }
        removed
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queue inspection
    // ═══════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn pending_mutations(&self) -> Vec<SyncQueueItem> {
        self.queue.items()
    }

    #[must_use]
    pub fn has_pending(&self, collection: &str, id: &str) -> bool {
        self.queue.has_pending(collection, id)
    }

    /// Drop every pending mutation; each affected entity is flagged unsynced.
    pub async fn clear_queue(&self) -> usize {
        let items = self.queue.clear();
        for item in &items {
            self.flag_unsynced(item, SyncError::QueueCleared);
        }
        self.persist_queue().await;
        metrics::set_sync_queue_depth(self.queue.len());
        items.len()
    }

    #[must_use]
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }
}
