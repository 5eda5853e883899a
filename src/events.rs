// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Structured events.
//!
//! Notable state changes are described by a closed set of typed payloads
//! rather than free-form log maps. [`OfflineEvent::emit`] logs each variant
//! with its own fields and counts it in `offline_sync_events_total{event}`.

use tracing::{debug, info, warn};

/// Why a cache entry left the memory tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Lru,
    Expired,
}

impl EvictionReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OfflineEvent<'a> {
    CacheEvicted {
        key: &'a str,
        reason: EvictionReason,
    },
    IntegrityMismatch {
        key: &'a str,
        expected: &'a str,
        actual: &'a str,
    },
    MigrationApplied {
        key: &'a str,
        from: u32,
        to: u32,
    },
    RequestQueued {
        id: &'a str,
        method: &'a str,
        url: &'a str,
        queue_size: usize,
    },
    RequestExpired {
        id: &'a str,
        age_ms: u64,
    },
    RequestFailed {
        id: &'a str,
        status: Option<u16>,
        error: &'a str,
        retries: usize,
    },
    ConnectivityChanged {
        online: bool,
        connection_type: &'a str,
    },
    SyncRejected {
        collection: &'a str,
        document_id: &'a str,
        operation: &'a str,
        reason: &'a str,
    },
}

impl OfflineEvent<'_> {
    /// Stable label used for the metrics counter.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CacheEvicted { .. } => "cache_evicted",
            Self::IntegrityMismatch { .. } => "integrity_mismatch",
            Self::MigrationApplied { .. } => "migration_applied",
            Self::RequestQueued { .. } => "request_queued",
            Self::RequestExpired { .. } => "request_expired",
            Self::RequestFailed { .. } => "request_failed",
            Self::ConnectivityChanged { .. } => "connectivity_changed",
            Self::SyncRejected { .. } => "sync_rejected",
        }
    }

    pub fn emit(&self) {
        crate::metrics::record_event(self.name());

        match self {
            Self::CacheEvicted { key, reason } => {
                debug!(key = %key, reason = reason.as_str(), "Cache entry evicted");
            }
            Self::IntegrityMismatch { key, expected, actual } => {
                warn!(key = %key, expected = %expected, actual = %actual, "Checksum mismatch on stored item");
            }
            Self::MigrationApplied { key, from, to } => {
                info!(key = %key, from, to, "Migrated stored item");
            }
            Self::RequestQueued { id, method, url, queue_size } => {
                info!(id = %id, method = %method, url = %url, queue_size, "Request queued while offline");
            }
            Self::RequestExpired { id, age_ms } => {
                warn!(id = %id, age_ms, "Queued request expired");
            }
            Self::RequestFailed { id, status, error, retries } => {
                warn!(id = %id, status = ?status, error = %error, retries, "Queued request failed");
            }
            Self::ConnectivityChanged { online, connection_type } => {
                info!(online, connection_type = %connection_type, "Connectivity changed");
            }
            Self::SyncRejected { collection, document_id, operation, reason } => {
                warn!(
                    collection = %collection,
                    document_id = %document_id,
                    operation = %operation,
                    reason = %reason,
                    "Offline mutation could not be synced"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_distinct() {
        let events = [
            OfflineEvent::CacheEvicted { key: "k", reason: EvictionReason::Lru },
            OfflineEvent::IntegrityMismatch { key: "k", expected: "a", actual: "b" },
            OfflineEvent::MigrationApplied { key: "k", from: 1, to: 2 },
            OfflineEvent::RequestQueued { id: "r", method: "POST", url: "/x", queue_size: 1 },
            OfflineEvent::RequestExpired { id: "r", age_ms: 1 },
            OfflineEvent::RequestFailed { id: "r", status: Some(500), error: "boom", retries: 3 },
            OfflineEvent::ConnectivityChanged { online: true, connection_type: "wifi" },
            OfflineEvent::SyncRejected { collection: "cars", document_id: "c1", operation: "update", reason: "x" },
        ];

        let mut names: Vec<_> = events.iter().map(OfflineEvent::name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), events.len());

        for event in &events {
            event.emit();
        }
    }
}
