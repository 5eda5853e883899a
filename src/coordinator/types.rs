//! Public types for the offline engine.

use std::sync::Arc;
use thiserror::Error;

use crate::cache::CacheStats;
use crate::clock::Clock;
use crate::network::{ConnectivityProbe, Transport};
use crate::realtime::RemoteStore;
use crate::resilience::circuit_breaker::CircuitState;
use crate::storage::{KvBackend, StorageError};

/// Engine lifecycle state.
///
/// Use [`super::OfflineEngine::state()`] to check the current state or
/// [`super::OfflineEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, background tasks not running
    Created,
    /// Restoring queues and spawning tasks
    Starting,
    /// Running normally
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// All tasks joined
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is {actual}, expected {expected}")]
    InvalidState { expected: EngineState, actual: EngineState },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Everything the engine talks to outside the process.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn KvBackend>,
    pub transport: Arc<dyn Transport>,
    pub remote: Arc<dyn RemoteStore>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub clock: Arc<dyn Clock>,
}

/// Point-in-time health snapshot. No I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub state: EngineState,
    pub online: bool,
    pub connection_type: String,
    pub cache: CacheStats,
    pub request_queue: usize,
    pub sync_queue: usize,
    pub unsynced: usize,
    pub subscriptions: usize,
    pub remote_circuit: CircuitState,
    /// Running and the remote circuit is not open
    pub healthy: bool,
}
