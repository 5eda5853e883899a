// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! On-device durable backend (SQLite).
//!
//! A single `kv_store` table holds every durable key. The database runs in
//! WAL mode so the sweep and drain tasks can read while a write is in flight.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::traits::{KvBackend, StorageError};
use crate::config::OfflineConfig;
use crate::resilience::retry::{retry, RetryConfig};

#[derive(Debug)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (or create) the database with startup-mode retry.
    ///
    /// Accepts either a `sqlite:` URL or a plain file path.
    pub async fn open(location: &str) -> Result<Self, StorageError> {
        let url = if location.starts_with("sqlite:") {
            location.to_string()
        } else {
            format!("sqlite://{}?mode=rwc", location)
        };

        let pool = retry("sqlite_connect", &RetryConfig::startup(), || async {
            SqlitePoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&url)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let backend = Self { pool };
        backend.enable_wal_mode().await?;
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Open the file named by `storage_path`.
    pub async fn from_config(config: &OfflineConfig) -> Result<Self, StorageError> {
        let Some(path) = config.storage_path.as_deref() else {
            return Err(StorageError::Backend("storage_path is not configured".into()));
        };
        Self::open(path).await
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        retry("sqlite_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS kv_store (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        Ok(())
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[async_trait]
impl KvBackend for SqliteBackend {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        retry("sqlite_get", &RetryConfig::query(), || async {
            let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            match row {
                Some(row) => row
                    .try_get::<String, _>("value")
                    .map(Some)
                    .map_err(|e| StorageError::Backend(e.to_string())),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        retry("sqlite_set", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(value)
            .bind(now_ms())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        retry("sqlite_remove", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM kv_store WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT key FROM kv_store ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(|e| StorageError::Backend(e.to_string())))
            .collect()
    }

    async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_store")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| StorageError::Backend(e.to_string()))?;
        for key in keys {
            sqlx::query("DELETE FROM kv_store WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| StorageError::Backend(e.to_string()))
    }
}
