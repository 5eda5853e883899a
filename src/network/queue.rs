//! FIFO of requests issued while offline.
//!
//! Each entry owns the oneshot responder of the caller still awaiting it.
//! The queue lives in memory only: a restart drops the callers too.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;

use super::client::ApiResponse;
use super::error::RequestError;
use super::transport::{HttpRequest, Method};

pub(crate) type Responder = oneshot::Sender<Result<ApiResponse, RequestError>>;

pub struct QueuedRequest {
    pub id: String,
    pub request: HttpRequest,
    pub timeout: Duration,
    pub created_at_ms: u64,
    pub retries: usize,
    pub max_retries: usize,
    responder: Responder,
}

impl QueuedRequest {
    pub(crate) fn new(
        request: HttpRequest,
        timeout: Duration,
        max_retries: usize,
        created_at_ms: u64,
        responder: Responder,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            timeout,
            created_at_ms,
            retries: 0,
            max_retries,
            responder,
        }
    }

    #[must_use]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }

    /// Settle the caller. Returns `false` if the caller stopped waiting.
    pub(crate) fn resolve(self, result: Result<ApiResponse, RequestError>) -> bool {
        self.responder.send(result).is_ok()
    }

    #[must_use]
    pub fn info(&self) -> QueuedRequestInfo {
        QueuedRequestInfo {
            id: self.id.clone(),
            method: self.request.method,
            url: self.request.url.clone(),
            created_at_ms: self.created_at_ms,
            retries: self.retries,
            max_retries: self.max_retries,
        }
    }
}

impl std::fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("id", &self.id)
            .field("method", &self.request.method)
            .field("url", &self.request.url)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

/// Read-only view of a queued request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedRequestInfo {
    pub id: String,
    pub method: Method,
    pub url: String,
    pub created_at_ms: u64,
    pub retries: usize,
    pub max_retries: usize,
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    items: Mutex<VecDeque<QueuedRequest>>,
}

impl RequestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append and return the new depth.
    pub fn push(&self, item: QueuedRequest) -> usize {
        let mut items = self.items.lock();
        items.push_back(item);
        items.len()
    }

    /// Take everything queued right now, oldest first.
    pub fn take_all(&self) -> Vec<QueuedRequest> {
        self.items.lock().drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    #[must_use]
    pub fn infos(&self) -> Vec<QueuedRequestInfo> {
        self.items.lock().iter().map(QueuedRequest::info).collect()
    }
}
