// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! App-state persistence helpers.
//!
//! Thin wrappers over [`DurableStore`] for the state the app restores after
//! a restart: the active inspection session, form drafts, search history,
//! recently viewed entities and preferences. Sessions and drafts are
//! encrypted whenever a storage key is configured.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::durable::{DurableStore, RetrieveOptions, StoreOptions};
use super::traits::StorageError;
use crate::config::OfflineConfig;
use crate::keys::{Namespace, StorageKey};

/// An entity the technician opened recently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentItem {
    pub id: String,
    pub kind: String,
    pub label: String,
    pub viewed_at_ms: u64,
}

pub struct Persistence {
    store: Arc<DurableStore>,
    search_history_limit: usize,
    recently_viewed_limit: usize,
    debounce: Duration,
    /// Latest debounce generation per rendered key
    pending: Arc<DashMap<String, u64>>,
    generation: AtomicU64,
}

impl Persistence {
    #[must_use]
    pub fn new(store: Arc<DurableStore>, config: &OfflineConfig) -> Self {
        Self {
            store,
            search_history_limit: config.search_history_limit,
            recently_viewed_limit: config.recently_viewed_limit,
            debounce: Duration::from_millis(config.persist_debounce_ms),
            pending: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn private_options(&self) -> StoreOptions {
        StoreOptions {
            encrypt: self.store.can_encrypt(),
            ..StoreOptions::default()
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sessions
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn persist_session<T: Serialize>(&self, session_id: &str, session: &T) -> Result<(), StorageError> {
        self.store
            .store(&StorageKey::Session(session_id.to_string()), session, self.private_options())
            .await
    }

    pub async fn load_session<T: DeserializeOwned>(&self, session_id: &str) -> Option<T> {
        self.store
            .retrieve(&StorageKey::Session(session_id.to_string()), RetrieveOptions::default())
            .await
    }

    pub async fn clear_session(&self, session_id: &str) -> Result<(), StorageError> {
        self.store.remove(&StorageKey::Session(session_id.to_string())).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Drafts
    // ═══════════════════════════════════════════════════════════════════════

    fn draft_key(kind: &str, id: &str) -> StorageKey {
        StorageKey::Draft {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub async fn persist_draft<T: Serialize>(&self, kind: &str, id: &str, draft: &T) -> Result<(), StorageError> {
        self.store.store(&Self::draft_key(kind, id), draft, self.private_options()).await
    }

    pub async fn load_draft<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Option<T> {
        self.store.retrieve(&Self::draft_key(kind, id), RetrieveOptions::default()).await
    }

    pub async fn remove_draft(&self, kind: &str, id: &str) -> Result<(), StorageError> {
        self.store.remove(&Self::draft_key(kind, id)).await
    }

    /// Ids of every stored draft of `kind`.
    pub async fn list_drafts(&self, kind: &str) -> Result<Vec<String>, StorageError> {
        let app = self.store.app_prefix();
        Ok(self
            .store
            .keys_in(Namespace::Draft)
            .await?
            .iter()
            .filter_map(|raw| match StorageKey::parse(app, raw)? {
                StorageKey::Draft { kind: k, id } if k == kind => Some(id),
                _ => None,
            })
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Search history & recently viewed
    // ═══════════════════════════════════════════════════════════════════════

    /// Record a search. Newest first, unique, capped; blank queries are ignored.
    pub async fn persist_search_history(&self, query: &str) -> Result<Vec<String>, StorageError> {
        let query = query.trim();
        let mut history = self.load_search_history().await;
        if query.is_empty() {
            return Ok(history);
        }

        history.retain(|q| q != query);
        history.insert(0, query.to_string());
        history.truncate(self.search_history_limit);

        self.store.store(&StorageKey::SearchHistory, &history, StoreOptions::default()).await?;
        Ok(history)
    }

    pub async fn load_search_history(&self) -> Vec<String> {
        self.store
            .retrieve(&StorageKey::SearchHistory, RetrieveOptions::default())
            .await
            .unwrap_or_default()
    }

    pub async fn clear_search_history(&self) -> Result<(), StorageError> {
        self.store.remove(&StorageKey::SearchHistory).await
    }

    /// Record a view. Newest first, unique by id, capped.
    pub async fn persist_recently_viewed(&self, item: RecentItem) -> Result<Vec<RecentItem>, StorageError> {
        let mut recent = self.load_recently_viewed().await;
        recent.retain(|r| r.id != item.id);
        recent.insert(0, item);
        recent.truncate(self.recently_viewed_limit);

        self.store.store(&StorageKey::RecentlyViewed, &recent, StoreOptions::default()).await?;
        Ok(recent)
    }

    pub async fn load_recently_viewed(&self) -> Vec<RecentItem> {
        self.store
            .retrieve(&StorageKey::RecentlyViewed, RetrieveOptions::default())
            .await
            .unwrap_or_default()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Preferences
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn persist_preferences<T: Serialize>(&self, name: &str, prefs: &T) -> Result<(), StorageError> {
        self.store
            .store(&StorageKey::Preferences(name.to_string()), prefs, StoreOptions::default())
            .await
    }

    pub async fn load_preferences<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.store
            .retrieve(&StorageKey::Preferences(name.to_string()), RetrieveOptions::default())
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Debounced writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Coalesce rapid writes to `key`: only the value passed last within the
    /// debounce window is stored. The returned handle completes once this
    /// call's timer fires, whether or not it was superseded.
    pub fn persist_debounced(&self, key: StorageKey, value: Value) -> JoinHandle<()> {
        let raw_key = key.render(self.store.app_prefix());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending.insert(raw_key.clone(), generation);

        let store = Arc::clone(&self.store);
        let pending = Arc::clone(&self.pending);
        let delay = self.debounce;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let latest = pending.remove_if(&raw_key, |_, g| *g == generation).is_some();
            if !latest {
                debug!(key = %raw_key, "Debounced write superseded");
                return;
            }

            if let Err(e) = store.store(&key, &value, StoreOptions::default()).await {
                warn!(key = %raw_key, error = %e, "Debounced write failed");
            }
        })
    }

    /// Number of debounced writes still waiting for their timer.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::memory::InMemoryBackend;
    use serde_json::json;

    fn persistence(config: OfflineConfig) -> Persistence {
        let store = DurableStore::new(
            Arc::new(InMemoryBackend::new()),
            Arc::new(ManualClock::default()),
            &config,
        )
        .unwrap();
        Persistence::new(Arc::new(store), &config)
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let p = persistence(OfflineConfig::default());

        p.persist_session("s1", &json!({"car": "c1", "step": 3})).await.unwrap();
        assert_eq!(p.load_session::<Value>("s1").await, Some(json!({"car": "c1", "step": 3})));

        p.clear_session("s1").await.unwrap();
        assert!(p.load_session::<Value>("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_sessions_encrypted_when_key_configured() {
        let config = OfflineConfig {
            storage_encryption_key: Some("07".repeat(32)),
            ..Default::default()
        };
        let backend = Arc::new(InMemoryBackend::new());
        let store = Arc::new(DurableStore::new(backend.clone(), Arc::new(ManualClock::default()), &config).unwrap());
        let p = Persistence::new(store, &config);

        p.persist_session("s1", &json!({"vin": "WVW999"})).await.unwrap();

        let raw = backend.raw("offline:session:s1").unwrap();
        assert!(raw.starts_with("e1:"));
        assert_eq!(p.load_session::<Value>("s1").await, Some(json!({"vin": "WVW999"})));
    }

    #[tokio::test]
    async fn test_drafts_listed_by_kind() {
        let p = persistence(OfflineConfig::default());

        p.persist_draft("customer", "new", &json!({"name": "Ada"})).await.unwrap();
        p.persist_draft("customer", "u7", &json!({"name": "Bo"})).await.unwrap();
        p.persist_draft("car", "new", &json!({"vin": "X"})).await.unwrap();

        let mut ids = p.list_drafts("customer").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["new".to_string(), "u7".to_string()]);

        p.remove_draft("customer", "new").await.unwrap();
        assert_eq!(p.list_drafts("customer").await.unwrap(), vec!["u7".to_string()]);
        assert_eq!(p.load_draft::<Value>("car", "new").await, Some(json!({"vin": "X"})));
    }

    #[tokio::test]
    async fn test_search_history_dedup_and_limit() {
        let p = persistence(OfflineConfig { search_history_limit: 3, ..Default::default() });

        for q in ["brakes", "tyres", "oil", "brakes", "  ", "clutch"] {
            p.persist_search_history(q).await.unwrap();
        }

        assert_eq!(p.load_search_history().await, vec!["clutch", "brakes", "oil"]);

        p.clear_search_history().await.unwrap();
        assert!(p.load_search_history().await.is_empty());
    }

    #[tokio::test]
    async fn test_recently_viewed_unique_by_id() {
        let p = persistence(OfflineConfig { recently_viewed_limit: 2, ..Default::default() });
        let item = |id: &str, at: u64| RecentItem {
            id: id.into(),
            kind: "car".into(),
            label: format!("Car {id}"),
            viewed_at_ms: at,
        };

        p.persist_recently_viewed(item("c1", 1)).await.unwrap();
        p.persist_recently_viewed(item("c2", 2)).await.unwrap();
        p.persist_recently_viewed(item("c1", 3)).await.unwrap();
        p.persist_recently_viewed(item("c3", 4)).await.unwrap();

        let ids: Vec<_> = p.load_recently_viewed().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c3", "c1"]);
    }

    #[tokio::test]
    async fn test_preferences() {
        let p = persistence(OfflineConfig::default());
        assert!(p.load_preferences::<Value>("display").await.is_none());

        p.persist_preferences("display", &json!({"units": "km"})).await.unwrap();
        assert_eq!(p.load_preferences::<Value>("display").await, Some(json!({"units": "km"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_writes_coalesce() {
        let p = persistence(OfflineConfig { persist_debounce_ms: 500, ..Default::default() });
        let key = StorageKey::Preferences("draft-form".into());

        let first = p.persist_debounced(key.clone(), json!({"step": 1}));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = p.persist_debounced(key.clone(), json!({"step": 2}));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let third = p.persist_debounced(key.clone(), json!({"step": 3}));

        assert_eq!(p.pending_writes(), 1);
        assert!(p.load_preferences::<Value>("draft-form").await.is_none());

        first.await.unwrap();
        second.await.unwrap();
        // Nothing written yet: both earlier timers were superseded
        assert!(p.load_preferences::<Value>("draft-form").await.is_none());

        third.await.unwrap();
        assert_eq!(p.load_preferences::<Value>("draft-form").await, Some(json!({"step": 3})));
        assert_eq!(p.pending_writes(), 0);
    }
}
