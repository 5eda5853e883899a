// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the offline engine.
//!
//! # Example
//!
//! ```
//! use offline_sync::OfflineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = OfflineConfig::default();
//! assert_eq!(config.cache_max_entries, 100);
//! assert_eq!(config.storage_max_bytes, 10 * 1024 * 1024); // 10 MiB
//!
//! // Tuned config
//! let config = OfflineConfig {
//!     api_base_url: Some("https://api.example.com".into()),
//!     cache_default_ttl_ms: 60_000,
//!     request_max_retries: 5,
//!     ..Default::default()
//! };
//! assert_eq!(config.retry_config().max_retries, Some(5));
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryConfig;

/// Configuration for the offline engine.
///
/// All fields have defaults matching the mobile app's production values.
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineConfig {
    /// Prefix for every durable key (`{app_prefix}:{namespace}:...`)
    #[serde(default = "default_app_prefix")]
    pub app_prefix: String,

    /// Default cache TTL (default: 5 minutes)
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_default_ttl_ms: u64,
    /// Max memory-tier entries before LRU eviction
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    /// Background expiry sweep period
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub cache_sweep_interval_secs: u64,

    /// Current schema version of persisted envelopes
    #[serde(default = "default_storage_schema_version")]
    pub storage_schema_version: u32,
    /// Max serialized envelope size (default: 10 MiB)
    #[serde(default = "default_storage_max_bytes")]
    pub storage_max_bytes: usize,
    /// Hex-encoded 32-byte AES key; encryption is unavailable without it
    #[serde(default)]
    pub storage_encryption_key: Option<String>,
    /// SQLite file for the durable backend
    #[serde(default)]
    pub storage_path: Option<String>,

    /// Base URL for relative request paths
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Per-attempt request timeout (default: 30s)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_request_max_retries")]
    pub request_max_retries: usize,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Queued requests older than this are rejected on drain (default: 5 min)
    #[serde(default = "default_request_queue_max_age_secs")]
    pub request_queue_max_age_secs: u64,

    /// Retries per offline mutation before it is flagged unsynced
    #[serde(default = "default_sync_max_retries")]
    pub sync_max_retries: u32,
    /// Queued mutations older than this are rejected (default: 7 days)
    #[serde(default = "default_sync_queue_max_age_secs")]
    pub sync_queue_max_age_secs: u64,
    /// Periodic sync queue processing while online
    #[serde(default = "default_sync_process_interval_secs")]
    pub sync_process_interval_secs: u64,

    /// Remote-store circuit breaker
    #[serde(default = "default_remote_circuit_failure_threshold")]
    pub remote_circuit_failure_threshold: u32,
    #[serde(default = "default_remote_circuit_recovery_secs")]
    pub remote_circuit_recovery_secs: u64,

    /// Persistence helper limits
    #[serde(default = "default_search_history_limit")]
    pub search_history_limit: usize,
    #[serde(default = "default_recently_viewed_limit")]
    pub recently_viewed_limit: usize,
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
}

fn default_app_prefix() -> String { "offline".to_string() }
fn default_cache_ttl_ms() -> u64 { 5 * 60 * 1000 }
fn default_cache_max_entries() -> usize { 100 }
fn default_cache_sweep_interval_secs() -> u64 { 60 }
fn default_storage_schema_version() -> u32 { 1 }
fn default_storage_max_bytes() -> usize { 10 * 1024 * 1024 } // 10 MiB
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_request_max_retries() -> usize { 3 }
fn default_retry_base_delay_ms() -> u64 { 1_000 }
fn default_retry_backoff_factor() -> f64 { 2.0 }
fn default_retry_max_delay_ms() -> u64 { 30_000 }
fn default_request_queue_max_age_secs() -> u64 { 5 * 60 }
fn default_sync_max_retries() -> u32 { 3 }
fn default_sync_queue_max_age_secs() -> u64 { 7 * 24 * 60 * 60 }
fn default_sync_process_interval_secs() -> u64 { 30 }
fn default_remote_circuit_failure_threshold() -> u32 { 5 }
fn default_remote_circuit_recovery_secs() -> u64 { 30 }
fn default_search_history_limit() -> usize { 10 }
fn default_recently_viewed_limit() -> usize { 20 }
fn default_persist_debounce_ms() -> u64 { 500 }

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            app_prefix: default_app_prefix(),
            cache_default_ttl_ms: default_cache_ttl_ms(),
            cache_max_entries: default_cache_max_entries(),
            cache_sweep_interval_secs: default_cache_sweep_interval_secs(),
            storage_schema_version: default_storage_schema_version(),
            storage_max_bytes: default_storage_max_bytes(),
            storage_encryption_key: None,
            storage_path: None,
            api_base_url: None,
            request_timeout_ms: default_request_timeout_ms(),
            request_max_retries: default_request_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_backoff_factor: default_retry_backoff_factor(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            request_queue_max_age_secs: default_request_queue_max_age_secs(),
            sync_max_retries: default_sync_max_retries(),
            sync_queue_max_age_secs: default_sync_queue_max_age_secs(),
            sync_process_interval_secs: default_sync_process_interval_secs(),
            remote_circuit_failure_threshold: default_remote_circuit_failure_threshold(),
            remote_circuit_recovery_secs: default_remote_circuit_recovery_secs(),
            search_history_limit: default_search_history_limit(),
            recently_viewed_limit: default_recently_viewed_limit(),
            persist_debounce_ms: default_persist_debounce_ms(),
        }
    }
}

impl OfflineConfig {
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_default_ttl_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn request_queue_max_age(&self) -> Duration {
        Duration::from_secs(self.request_queue_max_age_secs)
    }

    #[must_use]
    pub fn sync_queue_max_age(&self) -> Duration {
        Duration::from_secs(self.sync_queue_max_age_secs)
    }

    /// Backoff policy for outbound requests.
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            factor: self.retry_backoff_factor,
            max_retries: Some(self.request_max_retries),
        }
    }

    #[must_use]
    pub fn remote_circuit(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.remote_circuit_failure_threshold,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(self.remote_circuit_recovery_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_values() {
        let config = OfflineConfig::default();
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.cache_max_entries, 100);
        assert_eq!(config.cache_sweep_interval_secs, 60);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.request_queue_max_age(), Duration::from_secs(300));

        let retry = config.retry_config();
        assert_eq!(retry.initial_delay, Duration::from_millis(1000));
        assert_eq!(retry.max_delay, Duration::from_millis(30_000));
        assert_eq!(retry.factor, 2.0);
        assert_eq!(retry.max_retries, Some(3));
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: OfflineConfig = serde_json::from_str(
            r#"{"app_prefix": "garage", "cache_max_entries": 5}"#,
        )
        .unwrap();

        assert_eq!(config.app_prefix, "garage");
        assert_eq!(config.cache_max_entries, 5);
        assert_eq!(config.storage_schema_version, 1);
        assert!(config.storage_encryption_key.is_none());
    }
}
