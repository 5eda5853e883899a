use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Item '{key}' is {size} bytes, limit is {max}")]
    SizeExceeded {
        key: String,
        size: usize,
        max: usize,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Migration to v{version} failed for '{key}': {reason}")]
    Migration {
        key: String,
        version: u32,
        reason: String,
    },
}

/// String key-value persistence, shaped like the mobile AsyncStorage API.
///
/// Implementations must be safe to share between tasks. `remove_item` on a
/// missing key is not an error.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    async fn get_all_keys(&self) -> Result<Vec<String>, StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;

    /// Remove several keys. Default implementation falls back to sequential removes.
    async fn multi_remove(&self, keys: &[String]) -> Result<(), StorageError> {
        for key in keys {
            self.remove_item(key).await?;
        }
        Ok(())
    }
}
