// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned, checksummed envelope around every durable value.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageItem {
    pub version: u32,
    pub data: Value,
    /// Epoch milliseconds at write time
    pub timestamp: u64,
    /// Hex SHA-256 over the canonical JSON of `{version, data, timestamp}`
    pub checksum: String,
}

impl StorageItem {
    /// Wrap `data` and stamp its checksum.
    #[must_use]
    pub fn seal(version: u32, data: Value, timestamp: u64) -> Self {
        let checksum = compute_checksum(version, &data, timestamp);
        Self {
            version,
            data,
            timestamp,
            checksum,
        }
    }

    /// Recompute the checksum from the current fields.
    #[must_use]
    pub fn computed_checksum(&self) -> String {
        compute_checksum(self.version, &self.data, self.timestamp)
    }

    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.computed_checksum() == self.checksum
    }
}

/// `serde_json` maps are ordered by key, so the rendering is canonical
/// for any value built from the same content.
#[must_use]
pub fn compute_checksum(version: u32, data: &Value, timestamp: u64) -> String {
    let canonical = json!({
        "data": data,
        "timestamp": timestamp,
        "version": version,
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}
