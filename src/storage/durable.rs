// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable Store: versioned, checksummed values over a [`KvBackend`].
//!
//! Every value is wrapped in a [`StorageItem`] carrying the schema version,
//! a write timestamp and a SHA-256 checksum. Reads verify the checksum and
//! run any registered migrations between the stored version and the
//! current one, writing the upgraded envelope back.
//!
//! # Read Semantics
//!
//! [`DurableStore::retrieve`] favours availability: absence and every read,
//! decode or parse failure yield `None` (logged), and a checksum mismatch
//! still returns the data after a warning. Callers that need to act on
//! corruption use [`DurableStore::retrieve_checked`].
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use offline_sync::{DurableStore, OfflineConfig, StoreOptions, RetrieveOptions};
//! use offline_sync::keys::StorageKey;
//! use offline_sync::storage::InMemoryBackend;
//! use offline_sync::clock::SystemClock;
//! use std::sync::Arc;
//!
//! let store = DurableStore::new(
//!     Arc::new(InMemoryBackend::new()),
//!     Arc::new(SystemClock),
//!     &OfflineConfig::default(),
//! ).unwrap();
//!
//! let key = StorageKey::Preferences("units".into());
//! store.store(&key, &"metric", StoreOptions::default()).await.unwrap();
//! let units: Option<String> = store.retrieve(&key, RetrieveOptions::default()).await;
//! assert_eq!(units.as_deref(), Some("metric"));
//! # }
//! ```

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::codec::{self, Cipher, Layers};
use super::envelope::StorageItem;
use super::traits::{KvBackend, StorageError};
use crate::clock::Clock;
use crate::config::OfflineConfig;
use crate::events::OfflineEvent;
use crate::keys::{Namespace, StorageKey};
use crate::metrics::{self, LatencyTimer};

/// Transforms data stored at `version - 1` into the shape of `version`.
pub type Migration = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    pub encrypt: bool,
    pub compress: bool,
    pub skip_size_validation: bool,
}

impl StoreOptions {
    #[must_use]
    pub fn compressed() -> Self {
        Self { compress: true, ..Self::default() }
    }

    #[must_use]
    pub fn encrypted() -> Self {
        Self { encrypt: true, ..Self::default() }
    }
}

/// Which layers a read is allowed to unwrap. A stored value carrying a
/// layer that is not allowed is treated as unreadable.
#[derive(Debug, Clone, Copy)]
pub struct RetrieveOptions {
    pub decrypt: bool,
    pub decompress: bool,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            decrypt: true,
            decompress: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    Verified,
    Mismatch { expected: String, actual: String },
}

impl Integrity {
    #[must_use]
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// A value read through [`DurableStore::retrieve_checked`].
#[derive(Debug, Clone)]
pub struct Retrieved<T> {
    pub data: T,
    pub integrity: Integrity,
    /// Stored version when migrations ran on this read
    pub migrated_from: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageUsage {
    pub total_keys: usize,
    pub keys_per_namespace: BTreeMap<Namespace, usize>,
    /// Sum of stored (encoded) value lengths
    pub total_bytes: usize,
}

pub struct DurableStore {
    backend: Arc<dyn KvBackend>,
    clock: Arc<dyn Clock>,
    app_prefix: String,
    schema_version: u32,
    max_bytes: usize,
    cipher: Option<Cipher>,
    migrations: RwLock<BTreeMap<u32, Migration>>,
}

impl DurableStore {
    /// Fails only if a configured encryption key is malformed.
    pub fn new(
        backend: Arc<dyn KvBackend>,
        clock: Arc<dyn Clock>,
        config: &OfflineConfig,
    ) -> Result<Self, StorageError> {
        let cipher = config
            .storage_encryption_key
            .as_deref()
            .map(Cipher::from_hex_key)
            .transpose()?;

        Ok(Self {
            backend,
            clock,
            app_prefix: config.app_prefix.clone(),
            schema_version: config.storage_schema_version,
            max_bytes: config.storage_max_bytes,
            cipher,
            migrations: RwLock::new(BTreeMap::new()),
        })
    }

    #[must_use]
    pub fn app_prefix(&self) -> &str {
        &self.app_prefix
    }

    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    #[must_use]
    pub fn can_encrypt(&self) -> bool {
        self.cipher.is_some()
    }

    /// Register the migration that produces `to_version` from `to_version - 1`.
    /// Re-registering a version replaces the previous function.
    pub fn register_migration<F>(&self, to_version: u32, migration: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.migrations.write().insert(to_version, Arc::new(migration));
    }

    pub async fn store<T: Serialize + ?Sized>(
        &self,
        key: &StorageKey,
        data: &T,
        options: StoreOptions,
    ) -> Result<(), StorageError> {
        let _timer = LatencyTimer::new("durable", "store");
        let raw_key = key.render(&self.app_prefix);

        let result = self.store_value(&raw_key, serde_json::to_value(data)?, self.clock.now_ms(), options).await;
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_operation("durable", "store", status);
        result
    }

    async fn store_value(
        &self,
        raw_key: &str,
        data: Value,
        timestamp: u64,
        options: StoreOptions,
    ) -> Result<(), StorageError> {
        let item = StorageItem::seal(self.schema_version, data, timestamp);
        let json = serde_json::to_string(&item)?;

        if !options.skip_size_validation && json.len() > self.max_bytes {
            return Err(StorageError::SizeExceeded {
                key: raw_key.to_string(),
                size: json.len(),
                max: self.max_bytes,
            });
        }

        let layers = Layers {
            compressed: options.compress,
            encrypted: options.encrypt,
        };
        let encoded = codec::encode(&json, layers, self.cipher.as_ref())?;

        self.backend.set_item(raw_key, &encoded).await?;
        metrics::record_bytes_written("durable", encoded.len());
        debug!(key = %raw_key, bytes = encoded.len(), compressed = options.compress, encrypted = options.encrypt, "Stored item");
        Ok(())
    }

    /// Read a value, returning `None` on absence or any failure.
    pub async fn retrieve<T: DeserializeOwned>(&self, key: &StorageKey, options: RetrieveOptions) -> Option<T> {
        match self.retrieve_checked(key, options).await {
            Ok(found) => found.map(|r| r.data),
            Err(e) => {
                warn!(key = %key.render(&self.app_prefix), error = %e, "Failed to retrieve item");
                metrics::record_error("durable", "retrieve", error_kind(&e));
                None
            }
        }
    }

    /// Read a value and report its integrity and migration status.
    pub async fn retrieve_checked<T: DeserializeOwned>(
        &self,
        key: &StorageKey,
        options: RetrieveOptions,
    ) -> Result<Option<Retrieved<T>>, StorageError> {
        let _timer = LatencyTimer::new("durable", "retrieve");
        let raw_key = key.render(&self.app_prefix);

        let Some(stored) = self.backend.get_item(&raw_key).await? else {
            return Ok(None);
        };
        metrics::record_bytes_read("durable", stored.len());

        let (json, layers) = codec::decode(&stored, self.cipher.as_ref())?;
        if layers.encrypted && !options.decrypt {
            return Err(StorageError::Codec("value is encrypted but decrypt was not requested".into()));
        }
        if layers.compressed && !options.decompress {
            return Err(StorageError::Codec("value is compressed but decompress was not requested".into()));
        }

        let item: StorageItem = serde_json::from_str(&json)?;

        let actual = item.computed_checksum();
        let integrity = if actual == item.checksum {
            Integrity::Verified
        } else {
            OfflineEvent::IntegrityMismatch {
                key: &raw_key,
                expected: &item.checksum,
                actual: &actual,
            }
            .emit();
            metrics::record_corruption(&raw_key);
            Integrity::Mismatch {
                expected: item.checksum.clone(),
                actual,
            }
        };

        let mut data = item.data;
        let mut migrated_from = None;

        if item.version < self.schema_version {
            data = self.migrate(&raw_key, item.version, data)?;
            migrated_from = Some(item.version);

            OfflineEvent::MigrationApplied {
                key: &raw_key,
                from: item.version,
                to: self.schema_version,
            }
            .emit();
            metrics::record_migration(item.version, self.schema_version);

            // Persist the upgrade with the encoding it was read with. Resealing
            // a mismatched item would give it a valid checksum, so it stays as is.
            if integrity == Integrity::Verified {
                let options = StoreOptions {
                    encrypt: layers.encrypted,
                    compress: layers.compressed,
                    skip_size_validation: true,
                };
                if let Err(e) = self.store_value(&raw_key, data.clone(), self.clock.now_ms(), options).await {
                    warn!(key = %raw_key, error = %e, "Failed to write back migrated item");
                }
            } else {
                debug!(key = %raw_key, "Not writing back migrated item with checksum mismatch");
            }
        } else if item.version > self.schema_version {
            debug!(key = %raw_key, stored = item.version, current = self.schema_version, "Item written by a newer schema");
        }

        metrics::record_operation("durable", "retrieve", "success");
        Ok(Some(Retrieved {
            data: serde_json::from_value(data)?,
            integrity,
            migrated_from,
        }))
    }

    /// Apply migrations `from + 1 ..= current` in order.
    fn migrate(&self, raw_key: &str, from: u32, mut data: Value) -> Result<Value, StorageError> {
        let steps: Vec<(u32, Migration)> = self
            .migrations
            .read()
            .range(from + 1..=self.schema_version)
            .map(|(v, m)| (*v, Arc::clone(m)))
            .collect();

        for (version, migration) in steps {
            data = migration(data).map_err(|reason| StorageError::Migration {
                key: raw_key.to_string(),
                version,
                reason,
            })?;
        }
        Ok(data)
    }

    /// Idempotent.
    pub async fn remove(&self, key: &StorageKey) -> Result<(), StorageError> {
        let result = self.backend.remove_item(&key.render(&self.app_prefix)).await;
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_operation("durable", "remove", status);
        result
    }

    /// Delete every key under this store's application prefix. Other
    /// applications sharing the backend are untouched.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let prefix = format!("{}:", self.app_prefix);
        let keys: Vec<String> = self
            .backend
            .get_all_keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect();

        self.backend.multi_remove(&keys).await?;
        debug!(removed = keys.len(), "Cleared durable store");
        Ok(())
    }

    /// Delete every key in one namespace, returning how many were removed.
    pub async fn clear_namespace(&self, namespace: Namespace) -> Result<usize, StorageError> {
        let keys = self.keys_in(namespace).await?;
        self.backend.multi_remove(&keys).await?;
        Ok(keys.len())
    }

    /// Raw backend keys in a namespace.
    pub async fn keys_in(&self, namespace: Namespace) -> Result<Vec<String>, StorageError> {
        let prefix = namespace.key_prefix(&self.app_prefix);
        let mut keys: Vec<String> = self
            .backend
            .get_all_keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Per-namespace key counts and stored size under this application prefix.
    pub async fn usage(&self) -> Result<StorageUsage, StorageError> {
        let mut usage = StorageUsage::default();

        for raw_key in self.backend.get_all_keys().await? {
            let Some(key) = StorageKey::parse(&self.app_prefix, &raw_key) else {
                continue;
            };
            usage.total_keys += 1;
            *usage.keys_per_namespace.entry(key.namespace()).or_default() += 1;
            if let Some(value) = self.backend.get_item(&raw_key).await? {
                usage.total_bytes += value.len();
            }
        }

        Ok(usage)
    }
}

fn error_kind(e: &StorageError) -> &'static str {
    match e {
        StorageError::Backend(_) => "backend",
        StorageError::SizeExceeded { .. } => "size_exceeded",
        StorageError::Serialization(_) => "serialization",
        StorageError::Codec(_) => "codec",
        StorageError::Migration { .. } => "migration",
    }
}
