use async_trait::async_trait;
use dashmap::DashMap;
use super::traits::{KvBackend, StorageError};

/// Volatile backend for tests and ephemeral sessions.
pub struct InMemoryBackend {
    data: DashMap<String, String>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current item count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw stored string, bypassing the durable envelope (for tests that tamper with data).
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        self.data.get(key).map(|r| r.value().clone())
    }

    /// Overwrite the raw stored string.
    pub fn put_raw(&self, key: &str, value: impl Into<String>) {
        self.data.insert(key.to_string(), value.into());
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.data.iter().map(|r| r.key().clone()).collect())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.data.clear();
        Ok(())
    }
}
