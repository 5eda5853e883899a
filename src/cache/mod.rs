// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-tier cache: a bounded memory tier over the Durable Store.
//!
//! # Architecture
//!
//! ```text
//!            get(key)                         set(key, v, ttl)
//!               │                                   │
//!               ▼                                   ▼
//! ┌─────────────────────────────┐     ┌─────────────────────────────┐
//! │ Memory tier (HashMap)       │◄────│ evict LRU while full        │
//! │  + AccessLog (LRU order)    │     │ insert, touch AccessLog     │
//! └──────────────┬──────────────┘     └──────────────┬──────────────┘
//!     miss/expired│                                  │ mirror (best effort)
//!                 ▼                                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │ Durable Store  {app}:cache:{key} → {data, timestamp_ms, ttl_ms}   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Invariants
//!
//! - `get` never returns an entry whose `timestamp + ttl` has passed, from
//!   either tier. Expired entries found on read are deleted.
//! - Every memory-tier key has an AccessLog entry.
//! - Durable Store failures are logged and never fail a cache operation.
//!
//! Memory-tier state sits behind a `parking_lot::Mutex` that is never held
//! across an `.await`, so operations are atomic only at the synchronous
//! boundary.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use offline_sync::{Cache, DurableStore, OfflineConfig};
//! use offline_sync::clock::ManualClock;
//! use offline_sync::storage::InMemoryBackend;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = OfflineConfig::default();
//! let clock = Arc::new(ManualClock::default());
//! let store = Arc::new(DurableStore::new(Arc::new(InMemoryBackend::new()), clock.clone(), &config).unwrap());
//! let cache = Cache::new(store, clock.clone(), &config);
//!
//! cache.set("a", &json!({"x": 1}), Some(Duration::from_millis(1000))).await;
//! assert_eq!(cache.get::<Value>("a").await, Some(json!({"x": 1})));
//!
//! clock.advance(Duration::from_millis(1100));
//! assert_eq!(cache.get::<Value>("a").await, None);
//! # }
//! ```

mod entities;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::OfflineConfig;
use crate::eviction::AccessLog;
use crate::events::{EvictionReason, OfflineEvent};
use crate::keys::{Namespace, StorageKey};
use crate::metrics;
use crate::storage::{DurableStore, RetrieveOptions, StoreOptions};

/// A memory-tier entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    pub timestamp_ms: u64,
    pub ttl_ms: u64,
    pub size_bytes: usize,
}

impl CacheEntry {
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        is_expired(self.timestamp_ms, self.ttl_ms, now_ms)
    }
}

fn is_expired(timestamp_ms: u64, ttl_ms: u64, now_ms: u64) -> bool {
    now_ms.saturating_sub(timestamp_ms) > ttl_ms
}

/// Shape of the persistent-tier copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    data: Value,
    timestamp_ms: u64,
    ttl_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CacheStats {
    pub total_items: usize,
    /// Sum of serialized entry sizes in the memory tier
    pub total_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub eviction_count: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    access: AccessLog,
    total_size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.access.remove(key);
        self.total_size = self.total_size.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Insert, evicting least-recently-used keys while at capacity.
    /// Returns the evicted keys.
    fn insert(&mut self, entry: CacheEntry, max_entries: usize) -> Vec<String> {
        let mut evicted = Vec::new();

        if let Some(old) = self.remove_entry(&entry.key) {
            debug!(key = %old.key, "Overwriting cache entry");
        } else {
            while self.entries.len() >= max_entries.max(1) {
                let Some(victim) = self.access.victim().map(str::to_string) else {
                    break;
                };
                if let Some(gone) = self.remove_entry(&victim) {
                    self.evictions += 1;
                    metrics::record_eviction(1, gone.size_bytes);
                }
                evicted.push(victim);
            }
        }

        self.access.touch(&entry.key);
        self.total_size += entry.size_bytes;
        self.entries.insert(entry.key.clone(), entry);
        evicted
    }

    fn publish_gauges(&self) {
        metrics::set_cache_items(self.entries.len());
        metrics::set_cache_bytes(self.total_size);
    }
}

pub struct Cache {
    state: Mutex<CacheState>,
    store: Arc<DurableStore>,
    clock: Arc<dyn Clock>,
    default_ttl_ms: u64,
    max_entries: usize,
    sweep_interval: Duration,
}

impl Cache {
    #[must_use]
    pub fn new(store: Arc<DurableStore>, clock: Arc<dyn Clock>, config: &OfflineConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            store,
            clock,
            default_ttl_ms: config.cache_default_ttl_ms,
            max_entries: config.cache_max_entries,
            sweep_interval: Duration::from_secs(config.cache_sweep_interval_secs.max(1)),
        }
    }

    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Insert or overwrite `key`, then mirror it into the Durable Store.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Option<Duration>) {
        let value = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache value is not serializable");
                return;
            }
        };
        let ttl_ms = ttl.map_or(self.default_ttl_ms, |t| t.as_millis() as u64);
        let now = self.clock.now_ms();

        self.insert_memory(key, value.clone(), now, ttl_ms);
        self.persist(key, value, now, ttl_ms).await;
    }

    fn insert_memory(&self, key: &str, data: Value, timestamp_ms: u64, ttl_ms: u64) {
        let entry = CacheEntry {
            key: key.to_string(),
            size_bytes: data.to_string().len(),
            data,
            timestamp_ms,
            ttl_ms,
        };

        let evicted = {
            let mut state = self.state.lock();
            let evicted = state.insert(entry, self.max_entries);
            state.publish_gauges();
            evicted
        };

        for victim in &evicted {
            OfflineEvent::CacheEvicted { key: victim, reason: EvictionReason::Lru }.emit();
        }
    }

    async fn persist(&self, key: &str, data: Value, timestamp_ms: u64, ttl_ms: u64) {
        let persisted = PersistedEntry { data, timestamp_ms, ttl_ms };
        if let Err(e) = self
            .store
            .store(&StorageKey::Cache(key.to_string()), &persisted, StoreOptions::default())
            .await
        {
            warn!(key = %key, error = %e, "Failed to mirror cache entry to durable store");
        }
    }

    /// Read `key`, falling back to the Durable Store on a memory miss.
    ///
    /// A value that cannot be deserialized into `T` is reported as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let found = self.lookup(key).await.and_then(|value| match serde_json::from_value(value) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(key = %key, error = %e, "Cached value has an unexpected shape");
                None
            }
        });

        let hit = found.is_some();
        {
            let mut state = self.state.lock();
            if hit {
                state.hits += 1;
            } else {
                state.misses += 1;
            }
        }
        metrics::record_cache_lookup(hit);
        found
    }

    /// Memory tier, then persistent tier, without touching statistics.
    async fn lookup(&self, key: &str) -> Option<Value> {
        let now = self.clock.now_ms();

        let expired = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    let data = entry.data.clone();
                    state.access.touch(key);
                    return Some(data);
                }
                Some(_) => {
                    state.remove_entry(key);
                    state.publish_gauges();
                    true
                }
                None => false,
            }
        };
        if expired {
            OfflineEvent::CacheEvicted { key, reason: EvictionReason::Expired }.emit();
            metrics::record_expired(1);
        }

        let storage_key = StorageKey::Cache(key.to_string());
        let persisted: PersistedEntry = self.store.retrieve(&storage_key, RetrieveOptions::default()).await?;

        if is_expired(persisted.timestamp_ms, persisted.ttl_ms, now) {
            if let Err(e) = self.store.remove(&storage_key).await {
                warn!(key = %key, error = %e, "Failed to drop expired durable cache entry");
            }
            return None;
        }

        // A concurrent set may have landed while the durable read was in flight
        let current = {
            let state = self.state.lock();
            state.entries.get(key).filter(|e| !e.is_expired(now)).map(|e| e.data.clone())
        };
        if current.is_some() {
            return current;
        }

        debug!(key = %key, "Promoting durable cache entry to memory");
        self.insert_memory(key, persisted.data.clone(), persisted.timestamp_ms, persisted.ttl_ms);
        Some(persisted.data)
    }

    /// Remove `key` from both tiers.
    pub async fn remove(&self, key: &str) {
        {
            let mut state = self.state.lock();
            state.remove_entry(key);
            state.publish_gauges();
        }
        if let Err(e) = self.store.remove(&StorageKey::Cache(key.to_string())).await {
            warn!(key = %key, error = %e, "Failed to remove durable cache entry");
        }
    }

    /// Empty both tiers and reset statistics.
    pub async fn clear(&self) {
        {
            let mut state = self.state.lock();
            *state = CacheState::default();
            state.publish_gauges();
        }
        match self.store.clear_namespace(Namespace::Cache).await {
            Ok(removed) => info!(removed, "Cache cleared"),
            Err(e) => warn!(error = %e, "Failed to clear durable cache entries"),
        }
    }

    #[must_use]
    pub fn get_stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        let (hit_rate, miss_rate) = if lookups == 0 {
            (0.0, 0.0)
        } else {
            (state.hits as f64 / lookups as f64, state.misses as f64 / lookups as f64)
        };

        CacheStats {
            total_items: state.entries.len(),
            total_size: state.total_size,
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            miss_rate,
            eviction_count: state.evictions,
        }
    }

    /// Drop every expired memory-tier entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<String> = {
            let mut state = self.state.lock();
            let keys: Vec<String> = state
                .entries
                .values()
                .filter(|e| e.is_expired(now))
                .map(|e| e.key.clone())
                .collect();
            for key in &keys {
                state.remove_entry(key);
            }
            state.publish_gauges();
            keys
        };

        for key in &expired {
            OfflineEvent::CacheEvicted { key, reason: EvictionReason::Expired }.emit();
        }
        if !expired.is_empty() {
            metrics::record_expired(expired.len());
            debug!(count = expired.len(), "Swept expired cache entries");
        }
        expired.len()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every sweep interval until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        cache.sweep_expired();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("Cache sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Whether a live entry for `key` is in the memory tier. Does not touch LRU order.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Live memory-tier keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        let mut keys: Vec<String> = self
            .state
            .lock()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remove every key starting with `prefix` from both tiers.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut removed: Vec<String> = {
            let mut state = self.state.lock();
            let keys: Vec<String> = state.entries.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
            for key in &keys {
                state.remove_entry(key);
            }
            state.publish_gauges();
            keys
        };

        let app = self.store.app_prefix().to_string();
        match self.store.keys_in(Namespace::Cache).await {
            Ok(raw_keys) => {
                for raw in raw_keys {
                    let Some(StorageKey::Cache(key)) = StorageKey::parse(&app, &raw) else {
                        continue;
                    };
                    if !key.starts_with(prefix) {
                        continue;
                    }
                    if let Err(e) = self.store.remove(&StorageKey::Cache(key.clone())).await {
                        warn!(key = %key, error = %e, "Failed to remove durable cache entry");
                    }
                    removed.push(key);
                }
            }
            Err(e) => warn!(prefix = %prefix, error = %e, "Failed to list durable cache entries"),
        }

        removed.sort();
        removed.dedup();
        removed.len()
    }

    /// Rehydrate the memory tier from the Durable Store after a restart.
    ///
    /// Loads the newest live entries up to capacity and drops expired ones.
    pub async fn warm_from_store(&self) -> usize {
        let now = self.clock.now_ms();
        let app = self.store.app_prefix().to_string();

        let raw_keys = match self.store.keys_in(Namespace::Cache).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list durable cache entries");
                return 0;
            }
        };

        let mut live = Vec::new();
        for raw in raw_keys {
            let Some(StorageKey::Cache(key)) = StorageKey::parse(&app, &raw) else {
                continue;
            };
            let storage_key = StorageKey::Cache(key.clone());
            let Some(persisted) = self
                .store
                .retrieve::<PersistedEntry>(&storage_key, RetrieveOptions::default())
                .await
            else {
                continue;
            };

            if is_expired(persisted.timestamp_ms, persisted.ttl_ms, now) {
                if let Err(e) = self.store.remove(&storage_key).await {
                    warn!(key = %key, error = %e, "Failed to drop expired durable cache entry");
                }
                continue;
            }
            live.push((key, persisted));
        }

        // Newest first, then insert oldest-to-newest so LRU order follows write time
        live.sort_by(|a, b| b.1.timestamp_ms.cmp(&a.1.timestamp_ms));
        live.truncate(self.max_entries.max(1));
        live.reverse();

        let count = live.len();
        for (key, persisted) in live {
            self.insert_memory(&key, persisted.data, persisted.timestamp_ms, persisted.ttl_ms);
        }
        info!(count, "Warmed cache from durable store");
        count
    }

    /// Shallow-merge a JSON object `patch` into the cached value for `key`
    /// and store the result. A missing or non-object value is replaced by
    /// the patch.
    pub async fn merge(&self, key: &str, patch: &Value, ttl: Option<Duration>) -> Value {
        let merged = match (self.lookup(key).await, patch) {
            (Some(Value::Object(mut current)), Value::Object(fields)) => {
                for (k, v) in fields {
                    current.insert(k.clone(), v.clone());
                }
                Value::Object(current)
            }
            _ => patch.clone(),
        };

        self.set(key, &merged, ttl).await;
        merged
    }
}
