// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: start and shutdown.

use std::time::Instant;
use tracing::{debug, info, warn};

use super::{EngineError, EngineState, OfflineEngine};
use crate::metrics;

impl OfflineEngine {
    /// Restore persisted state and spawn the background tasks.
    ///
    /// Only valid from [`EngineState::Created`].
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), EngineError> {
        let actual = self.state();
        if actual != EngineState::Created {
            return Err(EngineError::InvalidState {
                expected: EngineState::Created,
                actual,
            });
        }

        let started = Instant::now();
        self.set_state(EngineState::Starting);

        let restored = self.sync.restore_queue().await;
        let warmed = self.cache.warm_from_store().await;

        // Drivers subscribe to reconnects first, so the status seeded by
        // attach counts as a reconnect if the device came online meanwhile
        let sweeper = self.cache.spawn_sweeper(self.shutdown.subscribe());
        let drain_driver = self.client.spawn_drain_driver(self.shutdown.subscribe());
        let processor = self.sync.spawn_processor(self.shutdown.subscribe());
        let forwarder = self.monitor.attach(self.probe.as_ref(), self.shutdown.subscribe());
        self.tasks.lock().extend([sweeper, drain_driver, processor, forwarder]);

        self.set_state(EngineState::Running);
        metrics::record_startup_total(started.elapsed());
        info!(
            restored,
            warmed,
            online = self.monitor.is_online_now(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Offline engine running"
        );
        Ok(())
    }

    /// Stop background work and flush what must survive.
    ///
    /// Unsubscribes everything, persists the sync queue, rejects queued
    /// requests with `QueueCleared`, then joins the tasks. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        match self.state() {
            EngineState::ShuttingDown | EngineState::Stopped => return,
            EngineState::Created => {
                self.set_state(EngineState::Stopped);
                return;
            }
            EngineState::Starting | EngineState::Running => {}
        }

        info!("Initiating offline engine shutdown...");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown.send(true);

        let unsubscribed = self.sync.unsubscribe_all();
        self.sync.persist_queue().await;
        let rejected = self.client.clear_queue();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        }

        self.set_state(EngineState::Stopped);
        debug!(unsubscribed, rejected, "Background tasks joined");
        info!("Offline engine shutdown complete");
    }
}
