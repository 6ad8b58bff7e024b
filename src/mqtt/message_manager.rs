//! Fan-out of stored messages to in-process listeners.
//!
//! Listeners are registered from any thread and invoked on the session worker. The list
//! is copied under the lock and the lock is released before any listener runs, so a
//! listener may register or unregister listeners itself.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

use super::error::ListenerError;
use crate::persistence::{Message, Topic};

pub type Listener = Arc<dyn Fn(&Topic, &Message) -> Result<(), ListenerError> + Send + Sync>;

/// Handle returned by [`CallbackRegistry::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct CallbackRegistry {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Topic, &Message) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push((id, Arc::new(listener)));
        debug!("Registered message listener {:?}", id);
        id
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        before != listeners.len()
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every listener in registration order. A failing or panicking listener is
    /// logged and skipped. Returns the number of listeners that failed.
    pub fn dispatch(&self, topic: &Topic, message: &Message) -> usize {
        let snapshot: Vec<(ListenerId, Listener)> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut failures = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(topic, message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!("Error in message listener {:?} for {}: {}", id, topic, e);
                }
                Err(_) => {
                    failures += 1;
                    error!("Message listener {:?} panicked for {}", id, topic);
                }
            }
        }
        failures
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
