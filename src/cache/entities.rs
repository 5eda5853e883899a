//! Entity-scoped cache helpers.
//!
//! Naming sugar over [`Cache::set`] / [`Cache::get`] using the document key
//! (`collection:id`) that the realtime layer also writes to.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Cache;
use crate::keys::{CacheKey, EntityKind};

impl Cache {
    pub async fn cache_entity<T: Serialize + ?Sized>(&self, kind: EntityKind, id: &str, data: &T) {
        self.set(&CacheKey::entity(kind, id).to_string(), data, None).await;
    }

    pub async fn get_cached_entity<T: DeserializeOwned>(&self, kind: EntityKind, id: &str) -> Option<T> {
        self.get(&CacheKey::entity(kind, id).to_string()).await
    }

    pub async fn cache_customer<T: Serialize + ?Sized>(&self, id: &str, customer: &T) {
        self.cache_entity(EntityKind::Customer, id, customer).await;
    }

    pub async fn get_cached_customer<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        self.get_cached_entity(EntityKind::Customer, id).await
    }

    pub async fn cache_car<T: Serialize + ?Sized>(&self, id: &str, car: &T) {
        self.cache_entity(EntityKind::Car, id, car).await;
    }

    pub async fn get_cached_car<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        self.get_cached_entity(EntityKind::Car, id).await
    }

    pub async fn cache_session<T: Serialize + ?Sized>(&self, id: &str, session: &T) {
        self.cache_entity(EntityKind::Session, id, session).await;
    }

    pub async fn get_cached_session<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        self.get_cached_entity(EntityKind::Session, id).await
    }

    pub async fn cache_report<T: Serialize + ?Sized>(&self, id: &str, report: &T) {
        self.cache_entity(EntityKind::Report, id, report).await;
    }

    pub async fn get_cached_report<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        self.get_cached_entity(EntityKind::Report, id).await
    }
}
