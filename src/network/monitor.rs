// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Network Monitor: single source of truth for connectivity.
//!
//! Listeners run synchronously on every status change. Queue drivers do
//! not register listeners; they wait on [`NetworkMonitor::reconnected`],
//! a counter bumped exactly once per offline → online transition.

use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::status::{ConnectivityProbe, NetworkStatus};
use crate::events::OfflineEvent;
use crate::metrics;

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&NetworkStatus) + Send + Sync>;

pub struct NetworkMonitor {
    status: RwLock<NetworkStatus>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    reconnect_tx: watch::Sender<u64>,
}

impl NetworkMonitor {
    #[must_use]
    pub fn new(initial: NetworkStatus) -> Self {
        metrics::set_online(initial.is_online());
        let (reconnect_tx, _rx) = watch::channel(0);
        Self {
            status: RwLock::new(initial),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            reconnect_tx,
        }
    }

    /// Apply a transport event. Returns `true` if this was an offline → online transition.
    pub fn update(&self, status: NetworkStatus) -> bool {
        let was_online = {
            let mut current = self.status.write();
            if *current == status {
                return false;
            }
            let was_online = current.is_online();
            *current = status.clone();
            was_online
        };

        let now_online = status.is_online();
        if was_online != now_online {
            OfflineEvent::ConnectivityChanged {
                online: now_online,
                connection_type: &status.connection_type,
            }
            .emit();
            metrics::set_online(now_online);
        }

        self.notify(&status);

        let reconnected = !was_online && now_online;
        if reconnected {
            self.reconnect_tx.send_modify(|n| *n += 1);
        }
        reconnected
    }

    fn notify(&self, status: &NetworkStatus) {
        // Snapshot so listeners may add/remove listeners without deadlocking
        let listeners: Vec<(ListenerId, Listener)> = self.listeners.lock().clone();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
                error!(listener = id, "Network listener panicked");
            }
        }
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&NetworkStatus) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Idempotent.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Counter of offline → online transitions.
    #[must_use]
    pub fn reconnected(&self) -> watch::Receiver<u64> {
        self.reconnect_tx.subscribe()
    }

    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        *self.reconnect_tx.borrow()
    }

    #[must_use]
    pub fn is_online_now(&self) -> bool {
        self.status.read().is_online()
    }

    #[must_use]
    pub fn status(&self) -> NetworkStatus {
        self.status.read().clone()
    }

    /// Seed from `probe` and forward its changes into [`update`](Self::update) until shutdown.
    pub fn attach(self: &Arc<Self>, probe: &dyn ConnectivityProbe, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut rx = probe.watch();
        let initial = rx.borrow_and_update().clone();
        self.update(initial);

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            debug!("Connectivity probe closed");
                            break;
                        }
                        let status = rx.borrow_and_update().clone();
                        monitor.update(status);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
