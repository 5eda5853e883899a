// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed key registry for the durable store and the cache.
//!
//! Every persisted key is rendered by one function, [`StorageKey::render`]:
//!
//! ```text
//! {app_prefix}:{namespace}:{rest}
//! ```
//!
//! Components never concatenate key strings by hand, so the cache, the
//! session/draft helpers and the sync queue cannot collide.
//!
//! # Example
//!
//! ```
//! use offline_sync::keys::{StorageKey, CacheKey, Namespace};
//!
//! let key = StorageKey::Draft { kind: "inspection".into(), id: "42".into() };
//! assert_eq!(key.render("garage"), "garage:draft:inspection:42");
//! assert_eq!(key.namespace(), Namespace::Draft);
//!
//! assert_eq!(CacheKey::document("cars", "c1").to_string(), "cars:c1");
//! ```

use std::fmt;

/// Disjoint key namespaces inside the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Cache,
    Session,
    Draft,
    SearchHistory,
    RecentlyViewed,
    Preferences,
    SyncQueue,
}

impl Namespace {
    pub const ALL: [Namespace; 7] = [
        Namespace::Cache,
        Namespace::Session,
        Namespace::Draft,
        Namespace::SearchHistory,
        Namespace::RecentlyViewed,
        Namespace::Preferences,
        Namespace::SyncQueue,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Session => "session",
            Self::Draft => "draft",
            Self::SearchHistory => "search_history",
            Self::RecentlyViewed => "recently_viewed",
            Self::Preferences => "preferences",
            Self::SyncQueue => "sync_queue",
        }
    }

    /// Prefix shared by every key in this namespace, including the trailing colon.
    #[must_use]
    pub fn key_prefix(&self, app_prefix: &str) -> String {
        format!("{}:{}:", app_prefix, self.as_str())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key in the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageKey {
    /// Persistent tier of the cache, keyed by the cache key.
    Cache(String),
    /// Active inspection session snapshot.
    Session(String),
    /// Form draft, e.g. `{kind: "customer", id: "new"}`.
    Draft { kind: String, id: String },
    SearchHistory,
    RecentlyViewed,
    Preferences(String),
    SyncQueue,
}

const SINGLETON: &str = "default";

impl StorageKey {
    #[must_use]
    pub fn namespace(&self) -> Namespace {
        match self {
            Self::Cache(_) => Namespace::Cache,
            Self::Session(_) => Namespace::Session,
            Self::Draft { .. } => Namespace::Draft,
            Self::SearchHistory => Namespace::SearchHistory,
            Self::RecentlyViewed => Namespace::RecentlyViewed,
            Self::Preferences(_) => Namespace::Preferences,
            Self::SyncQueue => Namespace::SyncQueue,
        }
    }

    /// Render as `{app}:{namespace}:{rest}`.
    #[must_use]
    pub fn render(&self, app_prefix: &str) -> String {
        let rest = match self {
            Self::Cache(key) => key.clone(),
            Self::Session(id) => id.clone(),
            Self::Draft { kind, id } => format!("{}:{}", kind, id),
            Self::Preferences(name) => name.clone(),
            Self::SearchHistory | Self::RecentlyViewed | Self::SyncQueue => SINGLETON.to_string(),
        };
        format!("{}{}", self.namespace().key_prefix(app_prefix), rest)
    }

    /// Inverse of [`render`](Self::render) for namespaces whose rest is a plain id.
    #[must_use]
    pub fn parse(app_prefix: &str, raw: &str) -> Option<Self> {
        Namespace::ALL.iter().find_map(|ns| {
            let rest = raw.strip_prefix(&ns.key_prefix(app_prefix))?;
            let key = match ns {
                Namespace::Cache => Self::Cache(rest.to_string()),
                Namespace::Session => Self::Session(rest.to_string()),
                Namespace::Draft => {
                    let (kind, id) = rest.split_once(':')?;
                    Self::Draft { kind: kind.to_string(), id: id.to_string() }
                }
                Namespace::SearchHistory => Self::SearchHistory,
                Namespace::RecentlyViewed => Self::RecentlyViewed,
                Namespace::Preferences => Self::Preferences(rest.to_string()),
                Namespace::SyncQueue => Self::SyncQueue,
            };
            Some(key)
        })
    }
}

/// Domain entities with cache wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Customer,
    Car,
    Session,
    Report,
    JobCard,
}

impl EntityKind {
    /// Remote collection backing this entity.
    #[must_use]
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Customer => "customers",
            Self::Car => "cars",
            Self::Session => "sessions",
            Self::Report => "reports",
            Self::JobCard => "job_cards",
        }
    }
}

/// A key in the cache.
///
/// Documents render as `collection:id`, the same key the realtime layer
/// mirrors remote changes into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Document { collection: String, id: String },
    Query { collection: String, fingerprint: String },
    Custom(String),
}

impl CacheKey {
    #[must_use]
    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Document {
            collection: collection.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn entity(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::document(kind.collection(), id)
    }

    /// Prefix matching every document of a collection.
    #[must_use]
    pub fn collection_prefix(collection: &str) -> String {
        format!("{}:", collection)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document { collection, id } => write!(f, "{}:{}", collection, id),
            Self::Query { collection, fingerprint } => write!(f, "query:{}:{}", collection, fingerprint),
            Self::Custom(key) => f.write_str(key),
        }
    }
}
