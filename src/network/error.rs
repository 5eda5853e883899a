use std::time::Duration;
use thiserror::Error;

/// Failure delivered to a request caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {status_text}")]
    Http { status: u16, status_text: String },

    #[error("queued request expired after {age_ms} ms")]
    Expired { age_ms: u64 },

    #[error("request queue was cleared")]
    QueueCleared,

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("request was dropped before completion")]
    Cancelled,
}

impl RequestError {
    /// Network failures, timeouts and 5xx. Everything else, 4xx included, is final.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|s| (400..500).contains(&s))
    }

    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status().is_some_and(|s| (500..600).contains(&s))
    }
}
