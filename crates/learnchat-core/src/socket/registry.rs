//! Event listener registry for the shared link
//!
//! Listeners are channel senders keyed by event name. Registration returns a
//! `Subscription`; dropping it detaches the listener, so a listener can never
//! outlive the exchange that owns it.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::trace;

/// An event delivered to a listener
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EventEnvelope {
    pub name: String,
    pub data: Value,
}

struct Listener {
    event: String,
    once: bool,
    sink: mpsc::UnboundedSender<EventEnvelope>,
}

/// Listeners registered against the current link
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    // Ordered by id so listeners fire in registration order.
    listeners: Mutex<BTreeMap<u64, Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Listen for every occurrence of `event`
    pub fn on(
        self: &Arc<Self>,
        event: &str,
        sink: mpsc::UnboundedSender<EventEnvelope>,
    ) -> Subscription {
        self.register(event, false, sink)
    }

    /// Listen for the next occurrence of `event` only
    pub fn once(
        self: &Arc<Self>,
        event: &str,
        sink: mpsc::UnboundedSender<EventEnvelope>,
    ) -> Subscription {
        self.register(event, true, sink)
    }

    fn register(
        self: &Arc<Self>,
        event: &str,
        once: bool,
        sink: mpsc::UnboundedSender<EventEnvelope>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().insert(
            id,
            Listener {
                event: event.to_string(),
                once,
                sink,
            },
        );
        trace!("Registered listener {} for {}", id, event);
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver an event to its listeners; returns how many received it
    pub fn dispatch(&self, name: &str, data: &Value) -> usize {
        let mut listeners = self.listeners.lock();
        let mut delivered = 0;
        let mut finished = Vec::new();

        for (id, listener) in listeners.iter() {
            if listener.event != name {
                continue;
            }
            let envelope = EventEnvelope {
                name: name.to_string(),
                data: data.clone(),
            };
            if listener.sink.send(envelope).is_ok() {
                delivered += 1;
                if listener.once {
                    finished.push(*id);
                }
            } else {
                finished.push(*id);
            }
        }

        for id in finished {
            listeners.remove(&id);
        }
        delivered
    }

    /// Drop every listener; their receivers observe a closed channel
    pub fn clear(&self) {
        let mut listeners = self.listeners.lock();
        if !listeners.is_empty() {
            trace!("Clearing {} listeners", listeners.len());
        }
        listeners.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    fn remove(&self, id: u64) {
        self.listeners.lock().remove(&id);
    }
}

/// Handle for a registered listener; detaches it when dropped
#[derive(Debug)]
pub(crate) struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
