// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote document store seam.
//!
//! Documents are JSON objects addressed by `(collection, id)`. Writes and
//! change streams are the only things the sync layer needs from the
//! backend; anything speaking this trait can sit behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

impl ChangeType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Removed => "removed",
        }
    }
}

/// One document change pushed by a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub change_type: ChangeType,
    pub collection: String,
    pub document_id: String,
    /// `None` for removals
    pub data: Option<Value>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Field is an array containing the value
    ArrayContains,
    /// Value is an array containing the field
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Dotted path into the document, e.g. `owner.name`
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Collection query: filters are ANDed, then ordered, then limited.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentQuery {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl DocumentQuery {
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filters.push(Filter { field: field.into(), op, value });
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `document` passes every filter.
    #[must_use]
    pub fn matches(&self, document: &Value) -> bool {
        self.filters.iter().all(|f| {
            let Some(field) = field_at(document, &f.field) else {
                return false;
            };
            match f.op {
                FilterOp::Eq => field == &f.value,
                FilterOp::Ne => field != &f.value,
                FilterOp::Lt => compare(field, &f.value) == Some(Ordering::Less),
                FilterOp::Le => matches!(compare(field, &f.value), Some(Ordering::Less | Ordering::Equal)),
                FilterOp::Gt => compare(field, &f.value) == Some(Ordering::Greater),
                FilterOp::Ge => matches!(compare(field, &f.value), Some(Ordering::Greater | Ordering::Equal)),
                FilterOp::ArrayContains => field.as_array().is_some_and(|items| items.contains(&f.value)),
                FilterOp::In => f.value.as_array().is_some_and(|items| items.contains(field)),
            }
        })
    }

    /// Order `(id, document)` pairs per `order_by` and truncate to `limit`.
    pub fn arrange(&self, documents: &mut Vec<(String, Value)>) {
        if let Some((field, direction)) = &self.order_by {
            documents.sort_by(|(_, a), (_, b)| {
                // Documents without the field sort last in either direction
                match (field_at(a, field), field_at(b, field)) {
                    (Some(x), Some(y)) => {
                        let ordering = compare(x, y).unwrap_or(Ordering::Equal);
                        match direction {
                            Direction::Asc => ordering,
                            Direction::Desc => ordering.reverse(),
                        }
                    }
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            });
        }
        if let Some(limit) = self.limit {
            documents.truncate(limit);
        }
    }
}

fn field_at<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(document, |current, segment| current.get(segment))
}

/// Numbers by value, strings lexically, booleans false < true. Mixed types don't compare.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// One write of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Set {
        collection: String,
        id: String,
        data: Value,
        merge: bool,
    },
    Update {
        collection: String,
        id: String,
        data: Value,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl BatchOp {
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            Self::Set { collection, .. } | Self::Update { collection, .. } | Self::Delete { collection, .. } => {
                collection
            }
        }
    }

    #[must_use]
    pub fn document_id(&self) -> &str {
        match self {
            Self::Set { id, .. } | Self::Update { id, .. } | Self::Delete { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("operation aborted: {0}")]
    Aborted(String),
}

impl RemoteError {
    /// Worth retrying later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Aborted(_))
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, RemoteError>;

    /// Create or overwrite. With `merge`, top-level fields are merged into an existing document.
    async fn set_document(&self, collection: &str, id: &str, data: &Value, merge: bool) -> Result<(), RemoteError>;

    /// Shallow-merge `patch`; fails with `NotFound` if the document is missing.
    async fn update_document(&self, collection: &str, id: &str, patch: &Value) -> Result<(), RemoteError>;

    /// Idempotent.
    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

    /// All or nothing.
    async fn commit_batch(&self, ops: &[BatchOp]) -> Result<(), RemoteError>;

    /// Initial snapshot as `Added` changes, then live changes.
    async fn watch_collection(&self, query: &DocumentQuery) -> Result<mpsc::Receiver<RemoteChange>, RemoteError>;

    async fn watch_document(&self, collection: &str, id: &str) -> Result<mpsc::Receiver<RemoteChange>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filters() {
        let car = json!({"make": "Volvo", "mileage": 120000, "tags": ["estate"], "owner": {"name": "Ines"}});

        assert!(DocumentQuery::new("cars").filter("make", FilterOp::Eq, json!("Volvo")).matches(&car));
        assert!(DocumentQuery::new("cars").filter("mileage", FilterOp::Gt, json!(100000)).matches(&car));
        assert!(DocumentQuery::new("cars").filter("mileage", FilterOp::Le, json!(120000)).matches(&car));
        assert!(DocumentQuery::new("cars").filter("tags", FilterOp::ArrayContains, json!("estate")).matches(&car));
        assert!(DocumentQuery::new("cars").filter("make", FilterOp::In, json!(["Saab", "Volvo"])).matches(&car));
        assert!(DocumentQuery::new("cars").filter("owner.name", FilterOp::Eq, json!("Ines")).matches(&car));

        assert!(!DocumentQuery::new("cars").filter("make", FilterOp::Ne, json!("Volvo")).matches(&car));
        assert!(!DocumentQuery::new("cars").filter("missing", FilterOp::Eq, json!(1)).matches(&car));
        // Mixed types never compare
        assert!(!DocumentQuery::new("cars").filter("make", FilterOp::Lt, json!(5)).matches(&car));
    }

    #[test]
    fn test_arrange_orders_and_limits() {
        let query = DocumentQuery::new("jobs").order_by("priority", Direction::Desc).limit(2);
        let mut docs = vec![
            ("a".to_string(), json!({"priority": 1})),
            ("b".to_string(), json!({"priority": 3})),
            ("c".to_string(), json!({})),
            ("d".to_string(), json!({"priority": 2})),
        ];

        query.arrange(&mut docs);

        let ids: Vec<_> = docs.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d"]);
    }

    #[test]
    fn test_transient_errors() {
        assert!(RemoteError::Unavailable("down".into()).is_transient());
        assert!(RemoteError::Aborted("contention".into()).is_transient());
        assert!(!RemoteError::PermissionDenied("rules".into()).is_transient());
        assert!(!RemoteError::NotFound { collection: "cars".into(), id: "c1".into() }.is_transient());
    }
}
