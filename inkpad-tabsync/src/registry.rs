//! Per-tab broadcast task registry.
//!
//! Each tab owns one [`BroadcastRegistry`] mapping resource keys to
//! invalidation handlers. Triggering a key posts a signal to the bus; every
//! *other* tab holding a task under that key runs its handler. The
//! triggering tab's own handler never runs — it already knows it changed
//! the resource. The registry never inspects what a handler does; cache
//! contents stay owned by whatever registered the task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::signal::{Signal, SignalBus};

/// A registered invalidation action.
pub type TaskHandler = Arc<dyn Fn() + Send + Sync>;

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub triggers_sent: u64,
    pub signals_received: u64,
    pub tasks_invoked: u64,
    /// Signals for keys this tab holds no task under
    pub signals_ignored: u64,
}

/// Lock-free counters shared with the listener task.
#[derive(Default)]
struct AtomicRegistryStats {
    triggers_sent: AtomicU64,
    signals_received: AtomicU64,
    tasks_invoked: AtomicU64,
    signals_ignored: AtomicU64,
}

/// One tab's view of the broadcast coordination layer.
pub struct BroadcastRegistry {
    tab_id: Uuid,
    bus: SignalBus,
    tasks: Arc<Mutex<HashMap<String, TaskHandler>>>,
    stats: Arc<AtomicRegistryStats>,
    listener: JoinHandle<()>,
}

impl BroadcastRegistry {
    /// Attach a new tab to the bus. Must be called from within a tokio
    /// runtime: the listener task starts immediately.
    pub fn attach(bus: &SignalBus) -> Self {
        Self::attach_as(bus, Uuid::new_v4())
    }

    /// Attach with an explicit tab id (for testing).
    pub fn attach_as(bus: &SignalBus, tab_id: Uuid) -> Self {
        let tasks: Arc<Mutex<HashMap<String, TaskHandler>>> = Arc::new(Mutex::new(HashMap::new()));
        let stats = Arc::new(AtomicRegistryStats::default());

        let mut rx = bus.subscribe();
        let listener_tasks = tasks.clone();
        let listener_stats = stats.clone();
        let listener = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => {
                        // Our own triggers don't come back to us
                        if signal.tab_id == tab_id {
                            continue;
                        }
                        listener_stats.signals_received.fetch_add(1, Ordering::Relaxed);

                        // Clone the handler out so it runs outside the lock;
                        // a handler may re-enter the registry
                        let handler = listener_tasks.lock().unwrap().get(&signal.key).cloned();
                        match handler {
                            Some(handler) => {
                                handler();
                                listener_stats.tasks_invoked.fetch_add(1, Ordering::Relaxed);
                            }
                            None => {
                                // Normal: this tab holds no task for the key
                                listener_stats.signals_ignored.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("tab {tab_id} lagged by {n} signals");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            tab_id,
            bus: bus.clone(),
            tasks,
            stats,
            listener,
        }
    }

    /// Register a task under `key`, replacing any prior handler for that
    /// key in this tab.
    pub fn register_task(&self, key: impl Into<String>, handler: impl Fn() + Send + Sync + 'static) {
        self.tasks.lock().unwrap().insert(key.into(), Arc::new(handler));
    }

    /// Remove the task under `key`. Idempotent: returns false when no task
    /// was registered.
    pub fn unregister_task(&self, key: &str) -> bool {
        self.tasks.lock().unwrap().remove(key).is_some()
    }

    /// Notify every other tab that the resource under `key` changed.
    /// Fire-and-forget; this tab's own task is not invoked.
    pub fn trigger(&self, key: impl Into<String>) {
        self.stats.triggers_sent.fetch_add(1, Ordering::Relaxed);
        let _ = self.bus.post(Signal {
            tab_id: self.tab_id,
            key: key.into(),
        });
    }

    pub fn has_task(&self, key: &str) -> bool {
        self.tasks.lock().unwrap().contains_key(key)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn tab_id(&self) -> Uuid {
        self.tab_id
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            triggers_sent: self.stats.triggers_sent.load(Ordering::Relaxed),
            signals_received: self.stats.signals_received.load(Ordering::Relaxed),
            tasks_invoked: self.stats.tasks_invoked.load(Ordering::Relaxed),
            signals_ignored: self.stats.signals_ignored.load(Ordering::Relaxed),
        }
    }

    /// Detach from the bus. Registered tasks stay readable but no further
    /// signals are delivered.
    pub fn close(&self) {
        self.listener.abort();
    }
}

impl Drop for BroadcastRegistry {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
