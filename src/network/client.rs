// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Network-aware request client.
//!
//! # Request path
//!
//! ```text
//! request() ──► online? ──yes──► retry_if(is_retryable, timeout(transport.send))
//!                  │
//!                  no
//!                  ▼
//!            RequestQueue ──► caller awaits oneshot
//!                  ▲
//!                  │ requeue (retries+1)
//!                  │
//! reconnect ──► drain_queue(): one attempt per item per pass,
//!               expired items rejected, 4xx rejected
//! ```
//!
//! A drained request gets `max_retries + 1` attempts in total, the same
//! budget as an online request; the backoff between drain passes comes from
//! the same [`RetryConfig`].

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::RequestError;
use super::monitor::NetworkMonitor;
use super::queue::{QueuedRequest, QueuedRequestInfo, RequestQueue};
use super::transport::{HttpRequest, HttpResponse, Method, Transport};
use crate::clock::Clock;
use crate::config::OfflineConfig;
use crate::events::OfflineEvent;
use crate::metrics::{self, LatencyTimer};
use crate::resilience::retry::{retry_if, RetryConfig};

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub data: ResponseBody,
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
}

impl ApiResponse {
    /// Deserialize a JSON body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        match &self.data {
            ResponseBody::Json(value) => {
                serde_json::from_value(value.clone()).map_err(|e| RequestError::Decode(e.to_string()))
            }
            ResponseBody::Text(_) => Err(RequestError::Decode("response body is not JSON".into())),
            ResponseBody::Empty => Err(RequestError::Decode("response body is empty".into())),
        }
    }
}

/// What to send.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

impl RequestOptions {
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self { method, ..Default::default() }
    }

    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Per-call overrides of the client defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    pub timeout: Option<Duration>,
    pub retries: Option<usize>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub resolved: usize,
    pub requeued: usize,
    /// Includes `expired`
    pub rejected: usize,
    pub expired: usize,
    /// Another drain was already running
    pub skipped: bool,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct NetworkClient {
    transport: Arc<dyn Transport>,
    monitor: Arc<NetworkMonitor>,
    clock: Arc<dyn Clock>,
    queue: RequestQueue,
    base_url: Option<String>,
    default_headers: BTreeMap<String, String>,
    default_timeout: Duration,
    retry: RetryConfig,
    max_queue_age: Duration,
    draining: AtomicBool,
    queued_while_online: Notify,
}

impl NetworkClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        monitor: Arc<NetworkMonitor>,
        clock: Arc<dyn Clock>,
        config: &OfflineConfig,
    ) -> Self {
        let mut default_headers = BTreeMap::new();
        default_headers.insert("accept".to_string(), "application/json".to_string());

        Self {
            transport,
            monitor,
            clock,
            queue: RequestQueue::new(),
            base_url: config.api_base_url.clone(),
            default_headers,
            default_timeout: config.request_timeout(),
            retry: config.retry_config(),
            max_queue_age: config.request_queue_max_age(),
            draining: AtomicBool::new(false),
            queued_while_online: Notify::new(),
        }
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    /// Send now if online, otherwise queue and wait for reconnection.
    pub async fn request(
        &self,
        url: &str,
        options: RequestOptions,
        config: RequestConfig,
    ) -> Result<ApiResponse, RequestError> {
        let timeout = config.timeout.unwrap_or(self.default_timeout);
        let max_retries = config
            .retries
            .unwrap_or_else(|| self.retry.max_retries.unwrap_or_default());
        let request = self.build_request(url, options, config.headers);

        if !self.monitor.is_online_now() {
            return self.enqueue(request, timeout, max_retries).await;
        }

        let retry_config = RetryConfig {
            max_retries: Some(max_retries),
            ..self.retry.clone()
        };
        retry_if("http_request", &retry_config, RequestError::is_retryable, || {
            self.execute_once(&request, timeout)
        })
        .await
    }

    pub async fn get(&self, url: &str) -> Result<ApiResponse, RequestError> {
        self.request(url, RequestOptions::new(Method::Get), RequestConfig::default())
            .await
    }

    pub async fn post(&self, url: &str, body: Value) -> Result<ApiResponse, RequestError> {
        self.request(url, RequestOptions::new(Method::Post).body(body), RequestConfig::default())
            .await
    }

    pub async fn put(&self, url: &str, body: Value) -> Result<ApiResponse, RequestError> {
        self.request(url, RequestOptions::new(Method::Put).body(body), RequestConfig::default())
            .await
    }

    pub async fn delete(&self, url: &str) -> Result<ApiResponse, RequestError> {
        self.request(url, RequestOptions::new(Method::Delete), RequestConfig::default())
            .await
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        match &self.base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/')),
            None => url.to_string(),
        }
    }

    /// Header precedence: client defaults < options < per-call config.
    fn build_request(
        &self,
        url: &str,
        options: RequestOptions,
        overrides: BTreeMap<String, String>,
    ) -> HttpRequest {
        let mut headers = self.default_headers.clone();
        if options.body.is_some() {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }
        for (name, value) in options.headers.into_iter().chain(overrides) {
            headers.insert(name.to_ascii_lowercase(), value);
        }

        HttpRequest {
            method: options.method,
            url: self.resolve_url(url),
            headers,
            body: options.body,
        }
    }

    async fn enqueue(
        &self,
        request: HttpRequest,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<ApiResponse, RequestError> {
        let (tx, rx) = oneshot::channel();
        let item = QueuedRequest::new(request, timeout, max_retries, self.clock.now_ms(), tx);
        let id = item.id.clone();
        let method = item.request.method;
        let url = item.request.url.clone();

        let queue_size = self.queue.push(item);
        metrics::set_request_queue_depth(queue_size);
        OfflineEvent::RequestQueued {
            id: &id,
            method: method.as_str(),
            url: &url,
            queue_size,
        }
        .emit();

        // Went online between the check and the push: make sure a drain follows
        if self.monitor.is_online_now() {
            self.queued_while_online.notify_one();
        }

        rx.await.unwrap_or(Err(RequestError::Cancelled))
    }

    /// One attempt, bounded by `timeout`. Non-2xx becomes [`RequestError::Http`].
    async fn execute_once(&self, request: &HttpRequest, timeout: Duration) -> Result<ApiResponse, RequestError> {
        let _timer = LatencyTimer::new("network", request.method.as_str());

        let outcome = match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Err(_) => {
                metrics::record_timeout("network", request.method.as_str());
                Err(RequestError::Timeout(timeout))
            }
            Ok(Err(e)) => Err(RequestError::Network(e.to_string())),
            Ok(Ok(response)) if !response.is_success() => Err(RequestError::Http {
                status: response.status,
                status_text: response.status_text,
            }),
            Ok(Ok(response)) => parse_response(response),
        };

        match &outcome {
            Ok(_) => metrics::record_operation("network", request.method.as_str(), "success"),
            Err(e) => {
                debug!(url = %request.url, error = %e, "Request attempt failed");
                metrics::record_operation("network", request.method.as_str(), "error");
                metrics::record_error("network", request.method.as_str(), error_kind(e));
            }
        }
        outcome
    }

    /// Replay queued requests.
    ///
    /// Works on a snapshot, oldest first, one attempt per item. Offline items
    /// go back unchanged; retryable failures go back with `retries + 1` until
    /// the budget is spent. Concurrent calls return a skipped report.
    pub async fn drain_queue(&self) -> DrainReport {
        if self.draining.swap(true, Ordering::AcqRel) {
            return DrainReport { skipped: true, ..Default::default() };
        }
        let _guard = DrainGuard(&self.draining);

        let batch = self.queue.take_all();
        let mut report = DrainReport::default();
        if batch.is_empty() {
            return report;
        }
        info!(count = batch.len(), "Draining request queue");

        for mut item in batch {
            let age_ms = item.age_ms(self.clock.now_ms());
            if age_ms > self.max_queue_age.as_millis() as u64 {
                OfflineEvent::RequestExpired { id: &item.id, age_ms }.emit();
                item.resolve(Err(RequestError::Expired { age_ms }));
                report.rejected += 1;
                report.expired += 1;
                continue;
            }

            if !self.monitor.is_online_now() {
                self.queue.push(item);
                report.requeued += 1;
                continue;
            }

            match self.execute_once(&item.request, item.timeout).await {
                Ok(response) => {
                    item.resolve(Ok(response));
                    report.resolved += 1;
                }
                Err(e) if e.is_retryable() && item.retries < item.max_retries => {
                    item.retries += 1;
                    debug!(id = %item.id, retries = item.retries, error = %e, "Requeueing request");
                    self.queue.push(item);
                    report.requeued += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    OfflineEvent::RequestFailed {
                        id: &item.id,
                        status: e.status(),
                        error: &message,
                        retries: item.retries,
                    }
                    .emit();
                    item.resolve(Err(e));
                    report.rejected += 1;
                }
            }
        }

        metrics::record_drain(report.resolved, report.requeued, report.rejected);
        metrics::set_request_queue_depth(self.queue.len());
        report
    }

    /// Drain on every reconnect, backing off between passes while items keep
    /// coming back.
    pub fn spawn_drain_driver(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut reconnected = self.monitor.reconnected();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = reconnected.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = client.queued_while_online.notified() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let mut pass: u32 = 0;
                loop {
                    let report = client.drain_queue().await;
                    if report.requeued == 0 || client.queue.is_empty() || !client.monitor.is_online_now() {
                        break;
                    }

                    pass += 1;
                    let delay = client.retry.delay_for_attempt(pass);
                    debug!(pass, delay_ms = delay.as_millis() as u64, "Backing off before next drain pass");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
            debug!("Request drain driver stopped");
        })
    }

    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn queued_requests(&self) -> Vec<QueuedRequestInfo> {
        self.queue.infos()
    }

    /// Reject every queued request with [`RequestError::QueueCleared`].
    pub fn clear_queue(&self) -> usize {
        let items = self.queue.take_all();
        let count = items.len();
        for item in items {
            item.resolve(Err(RequestError::QueueCleared));
        }
        if count > 0 {
            warn!(count, "Cleared request queue");
        }
        metrics::set_request_queue_depth(self.queue.len());
        count
    }
}

fn parse_response(response: HttpResponse) -> Result<ApiResponse, RequestError> {
    let is_json = response
        .content_type()
        .is_some_and(|ct| ct.contains("json"));

    let data = if response.body.is_empty() {
        ResponseBody::Empty
    } else if is_json {
        let value = serde_json::from_slice(&response.body).map_err(|e| RequestError::Decode(e.to_string()))?;
        ResponseBody::Json(value)
    } else {
        ResponseBody::Text(String::from_utf8_lossy(&response.body).into_owned())
    };

    Ok(ApiResponse {
        data,
        status: response.status,
        status_text: response.status_text,
        headers: response.headers,
    })
}

fn error_kind(e: &RequestError) -> &'static str {
    match e {
        RequestError::Network(_) => "network",
        RequestError::Timeout(_) => "timeout",
        RequestError::Http { .. } => "http",
        RequestError::Expired { .. } => "expired",
        RequestError::QueueCleared => "cleared",
        RequestError::Decode(_) => "decode",
        RequestError::Cancelled => "cancelled",
    }
}
