//! In-process [`RemoteStore`].
//!
//! Used by embedders without a backend and by the test suites. Writes fan
//! out to watchers synchronously; a watcher that falls behind its buffer
//! misses changes rather than stalling writers.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use super::remote::{BatchOp, ChangeType, DocumentQuery, RemoteChange, RemoteError, RemoteStore};
use crate::clock::Clock;

const WATCH_BUFFER: usize = 256;

type Collections = BTreeMap<String, BTreeMap<String, Value>>;

enum WatchTarget {
    Collection(DocumentQuery),
    Document { collection: String, id: String },
}

struct Watcher {
    target: WatchTarget,
    tx: mpsc::Sender<RemoteChange>,
}

/// Before/after image of one document write.
struct Write {
    collection: String,
    id: String,
    before: Option<Value>,
    after: Option<Value>,
}

pub struct InMemoryRemoteStore {
    docs: RwLock<Collections>,
    watchers: Mutex<Vec<Watcher>>,
    available: AtomicBool,
    writes: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl InMemoryRemoteStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            watchers: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
            clock,
        }
    }

    /// Outage switch: while unavailable every call fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Successful document writes so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Read without availability checks, for assertions.
    #[must_use]
    pub fn document(&self, collection: &str, id: &str) -> Option<Value> {
        self.docs.read().get(collection).and_then(|c| c.get(id)).cloned()
    }

    #[must_use]
    pub fn collection_len(&self, collection: &str) -> usize {
        self.docs.read().get(collection).map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn watcher_count(&self) -> usize {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| !w.tx.is_closed());
        watchers.len()
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("remote store is offline".into()))
        }
    }

    fn commit(&self, ops: &[BatchOp]) -> Result<(), RemoteError> {
        self.check_available()?;

        let writes = {
            let mut docs = self.docs.write();
            // Stage on a copy so a failing op leaves nothing behind
            let mut staged = docs.clone();
            let writes = ops
                .iter()
                .map(|op| apply(&mut staged, op))
                .collect::<Result<Vec<_>, _>>()?;
            *docs = staged;
            writes
        };

        self.writes.fetch_add(writes.len(), Ordering::SeqCst);
        let now = self.clock.now_ms();
        for write in &writes {
            self.fan_out(write, now);
        }
        Ok(())
    }

    fn fan_out(&self, write: &Write, timestamp_ms: u64) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|watcher| {
            let Some(change) = change_for(&watcher.target, write, timestamp_ms) else {
                return !watcher.tx.is_closed();
            };
            match watcher.tx.try_send(change) {
                Ok(()) => true,
                Err(TrySendError::Full(change)) => {
                    warn!(
                        collection = %change.collection,
                        document_id = %change.document_id,
                        "Watcher buffer full, dropping change"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    fn register(&self, target: WatchTarget, snapshot: Vec<RemoteChange>) -> mpsc::Receiver<RemoteChange> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER.max(snapshot.len() + 1));
        for change in snapshot {
            // Capacity covers the snapshot
            let _ = tx.try_send(change);
        }
        self.watchers.lock().push(Watcher { target, tx });
        rx
    }
}

fn merge_into(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(current), Value::Object(fields)) => {
            for (k, v) in fields {
                current.insert(k.clone(), v.clone());
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn apply(docs: &mut Collections, op: &BatchOp) -> Result<Write, RemoteError> {
    let collection = op.collection().to_string();
    let id = op.document_id().to_string();
    if collection.is_empty() || id.is_empty() {
        return Err(RemoteError::InvalidArgument("collection and id must be non-empty".into()));
    }

    let documents = docs.entry(collection.clone()).or_default();
    let before = documents.get(&id).cloned();

    let after = match op {
        BatchOp::Set { data, merge, .. } => {
            let mut next = match (&before, merge) {
                (Some(existing), true) => existing.clone(),
                _ => Value::Null,
            };
            merge_into(&mut next, data);
            Some(next)
        }
        BatchOp::Update { data, .. } => {
            let Some(existing) = &before else {
                return Err(RemoteError::NotFound { collection, id });
            };
            let mut next = existing.clone();
            merge_into(&mut next, data);
            Some(next)
        }
        BatchOp::Delete { .. } => None,
    };

    match &after {
        Some(value) => {
            documents.insert(id.clone(), value.clone());
        }
        None => {
            documents.remove(&id);
        }
    }

    Ok(Write { collection, id, before, after })
}

fn change_for(target: &WatchTarget, write: &Write, timestamp_ms: u64) -> Option<RemoteChange> {
    let (was_visible, is_visible) = match target {
        WatchTarget::Collection(query) => {
            if query.collection != write.collection {
                return None;
            }
            (
                write.before.as_ref().is_some_and(|d| query.matches(d)),
                write.after.as_ref().is_some_and(|d| query.matches(d)),
            )
        }
        WatchTarget::Document { collection, id } => {
            if *collection != write.collection || *id != write.id {
                return None;
            }
            (write.before.is_some(), write.after.is_some())
        }
    };

    let change_type = match (was_visible, is_visible) {
        (false, true) => ChangeType::Added,
        (true, true) => ChangeType::Modified,
        (true, false) => ChangeType::Removed,
        (false, false) => return None,
    };

    Some(RemoteChange {
        change_type,
        collection: write.collection.clone(),
        document_id: write.id.clone(),
        data: if is_visible { write.after.clone() } else { None },
        timestamp_ms,
    })
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, RemoteError> {
        self.check_available()?;
        Ok(self.document(collection, id))
    }

    async fn set_document(&self, collection: &str, id: &str, data: &Value, merge: bool) -> Result<(), RemoteError> {
        self.commit(&[BatchOp::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            data: data.clone(),
            merge,
        }])
    }

    async fn update_document(&self, collection: &str, id: &str, patch: &Value) -> Result<(), RemoteError> {
        self.commit(&[BatchOp::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            data: patch.clone(),
        }])
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.commit(&[BatchOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        }])
    }

    async fn commit_batch(&self, ops: &[BatchOp]) -> Result<(), RemoteError> {
        self.commit(ops)
    }

    async fn watch_collection(&self, query: &DocumentQuery) -> Result<mpsc::Receiver<RemoteChange>, RemoteError> {
        self.check_available()?;

        let now = self.clock.now_ms();
        let mut matching: Vec<(String, Value)> = self
            .docs
            .read()
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, doc)| query.matches(doc))
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default();
        query.arrange(&mut matching);

        let snapshot = matching
            .into_iter()
            .map(|(id, doc)| RemoteChange {
                change_type: ChangeType::Added,
                collection: query.collection.clone(),
                document_id: id,
                data: Some(doc),
                timestamp_ms: now,
            })
            .collect();

        Ok(self.register(WatchTarget::Collection(query.clone()), snapshot))
    }

    async fn watch_document(&self, collection: &str, id: &str) -> Result<mpsc::Receiver<RemoteChange>, RemoteError> {
        self.check_available()?;

        let snapshot = self
            .document(collection, id)
            .map(|doc| RemoteChange {
                change_type: ChangeType::Added,
                collection: collection.to_string(),
                document_id: id.to_string(),
                data: Some(doc),
                timestamp_ms: self.clock.now_ms(),
            })
            .into_iter()
            .collect();

        let target = WatchTarget::Document {
            collection: collection.to_string(),
            id: id.to_string(),
        };
        Ok(self.register(target, snapshot))
    }
}
