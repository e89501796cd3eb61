//! Local event bus
//!
//! Fan-out of protocol events to locally attached observers (typically a
//! UI layer). This is the only broadcast surface in the system and never
//! crosses the network. Delivery is best-effort and unordered across
//! observers: a panicking observer is isolated and logged, never blocks
//! publication, and receives no backpressure signal.

use crate::protocol::NodeInfo;
use parking_lot::RwLock;
use std::sync::Arc;

/// Events delivered to local observers
#[derive(Debug, Clone)]
pub enum Event {
    /// The node started and is accepting connections
    NodeStarted,

    /// The node stopped
    NodeStopped,

    /// A peer was added to the registry
    UserAdded {
        /// Call-sign of the added peer
        call_sign: String,
        /// IP address of the added peer
        ip: String,
        /// Listening port of the added peer
        port: u16,
    },

    /// A remote peer confirmed that it added this node
    UserAddedBy {
        /// Call-sign of the confirming peer
        call_sign: String,
        /// IP address of the confirming peer
        ip: String,
        /// Listening port of the confirming peer
        port: u16,
    },

    /// A peer left the registry (its link closed or a removal
    /// notification arrived)
    UserRemoved {
        /// Call-sign of the removed peer
        call_sign: String,
    },

    /// A chat message addressed to this node arrived
    MessageReceived {
        /// Call-sign of the author
        sender: String,
        /// Chat text
        content: String,
    },

    /// A locally submitted message could not be relayed
    ///
    /// Emitted exactly once per failed send, to this node's observers
    /// only; there is no retry, queuing, or store-and-forward.
    MessageFailed {
        /// Call-sign of the unreachable recipient
        recipient_call_sign: String,
        /// Why the relay failed
        reason: String,
    },

    /// A `nodes` snapshot reply arrived (response to `register` or
    /// `discover`)
    NodesDiscovered {
        /// Peers known to the responding node
        nodes: Vec<NodeInfo>,
    },
}

/// Handle identifying one subscribed observer
///
/// Dropping the handle does not unsubscribe; call
/// [`EventHandlers::unsubscribe`] explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Type alias for observer callbacks
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// Observer registry with best-effort fan-out
///
/// Cheaply cloneable; clones share the same observer list.
pub struct EventHandlers {
    handlers: Arc<RwLock<Vec<(SubscriptionHandle, EventCallback)>>>,
    next_id: Arc<RwLock<u64>>,
}

impl EventHandlers {
    /// Create an empty observer registry
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(RwLock::new(0)),
        }
    }

    /// Attach an observer
    ///
    /// The callback runs for every published event (unless excluded by
    /// the publisher) until unsubscribed.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut next_id = self.next_id.write();
        let handle = SubscriptionHandle::new(*next_id);
        *next_id += 1;

        self.handlers.write().push((handle, Arc::new(callback)));
        handle
    }

    /// Detach an observer; no-op if the handle is unknown
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.handlers.write().retain(|(h, _)| *h != handle);
    }

    /// Fan an event out to every observer except `exclude`
    ///
    /// The exclusion prevents an observer from seeing an echo of its own
    /// submitted action. Observers are invoked in subscription order; a
    /// panicking observer is caught and logged so the remaining
    /// observers still run.
    pub fn publish(&self, event: Event, exclude: Option<SubscriptionHandle>) {
        let handlers = self.handlers.read();

        for (handle, callback) in handlers.iter() {
            if Some(*handle) == exclude {
                continue;
            }

            let event_clone = event.clone();
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event_clone);
            })) {
                tracing::error!(
                    "event observer {:?} panicked: {:?}",
                    handle,
                    e.downcast_ref::<&str>()
                        .copied()
                        .or_else(|| e.downcast_ref::<String>().map(|s| s.as_str()))
                        .unwrap_or("unknown panic")
                );
            }
        }
    }

    /// Number of attached observers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for EventHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventHandlers {
    fn clone(&self) -> Self {
        Self {
            handlers: Arc::clone(&self.handlers),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_subscribe_and_publish() {
        let handlers = EventHandlers::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let _handle = handlers.subscribe(move |_event| {
            called_clone.store(true, Ordering::SeqCst);
        });

        handlers.publish(Event::NodeStarted, None);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_publish_excludes_origin_observer() {
        let handlers = EventHandlers::new();
        let origin_count = Arc::new(AtomicUsize::new(0));
        let other_count = Arc::new(AtomicUsize::new(0));

        let origin_clone = Arc::clone(&origin_count);
        let origin = handlers.subscribe(move |_event| {
            origin_clone.fetch_add(1, Ordering::SeqCst);
        });

        let other_clone = Arc::clone(&other_count);
        let _other = handlers.subscribe(move |_event| {
            other_clone.fetch_add(1, Ordering::SeqCst);
        });

        handlers.publish(
            Event::UserRemoved {
                call_sign: "alice".to_string(),
            },
            Some(origin),
        );

        // Origin never sees an echo of its own action
        assert_eq!(origin_count.load(Ordering::SeqCst), 0);
        assert_eq!(other_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let handlers = EventHandlers::new();
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let handle = handlers.subscribe(move |_event| {
            called_clone.store(true, Ordering::SeqCst);
        });

        handlers.unsubscribe(handle);
        handlers.publish(Event::NodeStarted, None);
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let handlers = EventHandlers::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _panicking = handlers.subscribe(|_event| {
            panic!("observer panic");
        });

        let count_clone = Arc::clone(&count);
        let _healthy = handlers.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        handlers.publish(Event::NodeStopped, None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_count() {
        let handlers = EventHandlers::new();
        assert_eq!(handlers.handler_count(), 0);

        let h1 = handlers.subscribe(|_| {});
        let h2 = handlers.subscribe(|_| {});
        assert_eq!(handlers.handler_count(), 2);

        handlers.unsubscribe(h1);
        handlers.unsubscribe(h2);
        assert_eq!(handlers.handler_count(), 0);
    }

    #[test]
    fn test_clones_share_observers() {
        let handlers = EventHandlers::new();
        let clone = handlers.clone();

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let _handle = handlers.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        clone.publish(Event::NodeStarted, None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
