//! Registry of live watch subscriptions.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Returned by the subscribe calls; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Subscription {
    target: String,
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct SubscriptionManager {
    subscriptions: DashMap<u64, Subscription>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a handle and the flag its forwarding task must check before
    /// every callback.
    pub(crate) fn reserve(&self) -> (SubscriptionHandle, Arc<AtomicBool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        (SubscriptionHandle { id }, Arc::new(AtomicBool::new(true)))
    }

    pub(crate) fn insert(
        &self,
        handle: SubscriptionHandle,
        target: String,
        active: Arc<AtomicBool>,
        task: JoinHandle<()>,
    ) {
        debug!(subscription = handle.id, target = %target, "Subscribed");
        self.subscriptions.insert(handle.id, Subscription { target, active, task });
    }

    /// Idempotent. Returns whether the handle was live.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        match self.subscriptions.remove(&handle.id) {
            Some((_, sub)) => {
                sub.active.store(false, Ordering::SeqCst);
                sub.task.abort();
                debug!(subscription = handle.id, target = %sub.target, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe_all(&self) -> usize {
        let ids: Vec<u64> = self.subscriptions.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.unsubscribe(SubscriptionHandle { id: *id }))
            .count()
    }

    #[must_use]
    pub fn is_active(&self, handle: SubscriptionHandle) -> bool {
        self.subscriptions.contains_key(&handle.id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// `collection` or `collection/id` per live subscription, sorted.
    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.subscriptions.iter().map(|e| e.target.clone()).collect();
        targets.sort();
        targets
    }
}
