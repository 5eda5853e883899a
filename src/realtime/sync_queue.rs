// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable FIFO of pending remote mutations.
//!
//! Items taken for a processing pass are tracked as in-flight until the pass
//! settles, so they still count as pending for echo suppression and are
//! still written out if the queue is persisted mid-pass.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::keys::StorageKey;
use crate::storage::{DurableStore, RetrieveOptions, StorageError, StoreOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: String,
    pub operation: SyncOperation,
    pub collection: String,
    pub document_id: String,
    /// Full document for create, patch for update, `None` for delete
    pub data: Option<Value>,
    pub timestamp_ms: u64,
    pub retries: u32,
    pub max_retries: u32,
    /// Position in the queue, assigned on push
    #[serde(default)]
    pub seq: u64,
}

impl SyncQueueItem {
    #[must_use]
    pub fn new(
        operation: SyncOperation,
        collection: impl Into<String>,
        document_id: impl Into<String>,
        data: Option<Value>,
        timestamp_ms: u64,
        max_retries: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            collection: collection.into(),
            document_id: document_id.into(),
            data,
            timestamp_ms,
            retries: 0,
            max_retries,
            seq: 0,
        }
    }

    #[must_use]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }

    fn targets(&self, collection: &str, document_id: &str) -> bool {
        self.collection == collection && self.document_id == document_id
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<SyncQueueItem>,
    in_flight: Vec<SyncQueueItem>,
    next_seq: u64,
}

impl QueueState {
    fn renumber(&mut self) {
        for item in self.in_flight.iter_mut().chain(self.pending.iter_mut()) {
            self.next_seq += 1;
            item.seq = self.next_seq;
        }
    }
}

pub struct SyncQueue {
    state: Mutex<QueueState>,
    store: Arc<DurableStore>,
}

impl SyncQueue {
    #[must_use]
    pub fn new(store: Arc<DurableStore>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            store,
        }
    }

    /// Append and return the number of queued items, in-flight included.
    pub fn push(&self, mut item: SyncQueueItem) -> usize {
        let mut state = self.state.lock();
        state.next_seq += 1;
        item.seq = state.next_seq;
        state.pending.push_back(item);
        state.pending.len() + state.in_flight.len()
    }

    /// Move everything pending into flight, oldest first.
    pub(crate) fn begin_pass(&self) -> Vec<SyncQueueItem> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let batch: Vec<SyncQueueItem> = state.pending.drain(..).collect();
        state.in_flight = batch.clone();
        batch
    }

    /// Put an in-flight item back at the end of the queue.
    pub(crate) fn requeue(&self, item: SyncQueueItem) {
        let mut state = self.state.lock();
        state.in_flight.retain(|i| i.id != item.id);
        state.pending.push_back(item);
    }

    /// An in-flight item reached a final outcome.
    pub(crate) fn settle(&self, id: &str) {
        self.state.lock().in_flight.retain(|i| i.id != id);
    }

    pub(crate) fn end_pass(&self) {
        self.state.lock().in_flight.clear();
    }

    /// A mutation for this document has not reached the remote yet.
    #[must_use]
    pub fn has_pending(&self, collection: &str, document_id: &str) -> bool {
        let state = self.state.lock();
        state
            .pending
            .iter()
            .chain(state.in_flight.iter())
            .any(|item| item.targets(collection, document_id))
    }

    /// Remove pending items for one document, returning how many were dropped.
    /// In-flight items are left to their pass.
    pub fn discard(&self, collection: &str, document_id: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|item| !item.targets(collection, document_id));
        before - state.pending.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.in_flight.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending items, oldest first.
    #[must_use]
    pub fn items(&self) -> Vec<SyncQueueItem> {
        self.state.lock().pending.iter().cloned().collect()
    }

    pub fn clear(&self) -> Vec<SyncQueueItem> {
        self.state.lock().pending.drain(..).collect()
    }

    fn snapshot(&self) -> Vec<SyncQueueItem> {
        let state = self.state.lock();
        let mut seen = HashSet::new();
        state
            .in_flight
            .iter()
            .chain(state.pending.iter())
            .filter(|item| seen.insert(item.id.clone()))
            .cloned()
            .collect()
    }

    pub async fn persist(&self) -> Result<(), StorageError> {
        let items = self.snapshot();
        self.store
            .store(&StorageKey::SyncQueue, &items, StoreOptions::default())
            .await?;
        debug!(count = items.len(), "Persisted sync queue");
        Ok(())
    }

    /// Load the persisted queue ahead of anything queued since start.
    /// Items already present are not duplicated.
    pub async fn restore(&self) -> usize {
        let Some(stored) = self
            .store
            .retrieve::<Vec<SyncQueueItem>>(&StorageKey::SyncQueue, RetrieveOptions::default())
            .await
        else {
            return 0;
        };

        let mut state = self.state.lock();
        let known: HashSet<String> = state.pending.iter().map(|i| i.id.clone()).collect();
        let restored: Vec<SyncQueueItem> = stored.into_iter().filter(|i| !known.contains(&i.id)).collect();
        let count = restored.len();
        for item in restored.into_iter().rev() {
            state.pending.push_front(item);
        }
        // Restored items go first, so positions are handed out again in queue order
        state.renumber();

        if count > 0 {
            info!(count, "Restored sync queue");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::OfflineConfig;
    use crate::storage::{InMemoryBackend, KvBackend};
    use serde_json::json;

    fn store_on(backend: Arc<InMemoryBackend>) -> Arc<DurableStore> {
        let clock = Arc::new(ManualClock::default());
        Arc::new(DurableStore::new(backend, clock, &OfflineConfig::default()).unwrap())
    }

    fn item(op: SyncOperation, id: &str) -> SyncQueueItem {
        SyncQueueItem::new(op, "cars", id, Some(json!({"mileage": 1})), 1_000, 3)
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let backend = Arc::new(InMemoryBackend::new());
        let queue = SyncQueue::new(store_on(backend.clone()));
        queue.push(item(SyncOperation::Create, "c1"));
        queue.push(item(SyncOperation::Update, "c2"));
        queue.persist().await.unwrap();
        assert!(backend.get_item("offline:sync_queue:default").await.unwrap().is_some());

        let reopened = SyncQueue::new(store_on(backend));
        reopened.push(item(SyncOperation::Delete, "c3"));
        assert_eq!(reopened.restore().await, 2);

        let ids: Vec<_> = reopened.items().into_iter().map(|i| i.document_id).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);

        // Second restore finds nothing new
        assert_eq!(reopened.restore().await, 0);
        assert_eq!(reopened.len(), 3);
    }

    #[tokio::test]
    async fn test_in_flight_items_count_as_pending() {
        let queue = SyncQueue::new(store_on(Arc::new(InMemoryBackend::new())));
        queue.push(item(SyncOperation::Update, "c1"));

        queue.push(item(SyncOperation::Update, "c2"));

        let mut batch = queue.begin_pass();
        assert_eq!(batch.len(), 2);
        assert!(queue.has_pending("cars", "c1"));
        assert!(!queue.has_pending("cars", "c3"));
        assert_eq!(queue.snapshot().len(), 2);

        let second = batch.pop().unwrap();
        queue.settle(&batch[0].id);
        queue.requeue(second);
        assert_eq!(queue.len(), 1);
        assert!(!queue.has_pending("cars", "c1"));

        queue.end_pass();
        assert_eq!(queue.items()[0].document_id, "c2");
    }

    #[tokio::test]
    async fn test_discard_targets_one_document() {
        let queue = SyncQueue::new(store_on(Arc::new(InMemoryBackend::new())));
        queue.push(item(SyncOperation::Create, "c1"));
        queue.push(item(SyncOperation::Update, "c1"));
        queue.push(item(SyncOperation::Update, "c2"));

        assert_eq!(queue.discard("cars", "c1"), 2);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_positions_follow_queue_order_after_restore() {
        let backend = Arc::new(InMemoryBackend::new());
        let queue = SyncQueue::new(store_on(backend.clone()));
        queue.push(item(SyncOperation::Create, "c1"));
        queue.push(item(SyncOperation::Update, "c1"));
        queue.persist().await.unwrap();

        let reopened = SyncQueue::new(store_on(backend));
        reopened.push(item(SyncOperation::Delete, "c2"));
        reopened.restore().await;
        reopened.push(item(SyncOperation::Update, "c3"));

        let seqs: Vec<u64> = reopened.items().iter().map(|i| i.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{:?}", seqs);
    }

    #[test]
    fn test_item_serialization_shape() {
        let item = item(SyncOperation::Delete, "c9");
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["operation"], "delete");
        assert_eq!(value["document_id"], "c9");
        assert_eq!(item.age_ms(4_000), 3_000);
    }
}
