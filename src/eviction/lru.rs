// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeMap, HashMap};

/// Recency order for the memory tier.
///
/// Each touch stamps the key with the next value of a logical counter, so
/// recency is a total order with no ties. The least recently used key is
/// the one with the smallest tick.
#[derive(Debug, Default)]
pub struct AccessLog {
    tick: u64,
    by_key: HashMap<String, u64>,
    by_tick: BTreeMap<u64, String>,
}

impl AccessLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` as most recently used.
    pub fn touch(&mut self, key: &str) {
        self.tick += 1;
        if let Some(old) = self.by_key.insert(key.to_string(), self.tick) {
            self.by_tick.remove(&old);
        }
        self.by_tick.insert(self.tick, key.to_string());
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.by_key.remove(key) {
            Some(tick) => {
                self.by_tick.remove(&tick);
                true
            }
            None => false,
        }
    }

    /// Least recently used key.
    #[must_use]
    pub fn victim(&self) -> Option<&str> {
        self.by_tick.values().next().map(String::as_str)
    }

    /// Logical time of the last touch of `key`.
    #[must_use]
    pub fn last_access(&self, key: &str) -> Option<u64> {
        self.by_key.get(key).copied()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
        self.by_tick.clear();
    }
}
