//! Typed event bus and lifecycle events.
//!
//! Every component publishes a fixed set of typed events instead of
//! string-keyed emitters. Subscribing returns a [`Subscription`] that
//! removes the handler explicitly.
//!
//! # Example
//!
//! ```ignore
//! let subscription = manager.on(|event| {
//!     if let ClientEvent::ReconnectAttempt { attempt } = event {
//!         println!("attempt {attempt}");
//!     }
//! });
//! subscription.unsubscribe();
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

// ============================================================================
// Types
// ============================================================================

/// Shared handler callback.
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registered handlers in subscription order.
type HandlerList<E> = Mutex<Vec<(u64, Handler<E>)>>;

// ============================================================================
// EventBus
// ============================================================================

/// Multi-subscriber event channel for one event type.
///
/// Handlers run synchronously on the emitting task, outside the internal
/// lock, so a handler may subscribe or unsubscribe re-entrantly.
pub struct EventBus<E> {
    handlers: Arc<HandlerList<E>>,
    next_id: AtomicU64,
}

impl<E: 'static> EventBus<E> {
    /// Creates a bus with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a handler.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().push((id, Arc::new(handler)));

        let weak: Weak<HandlerList<E>> = Arc::downgrade(&self.handlers);
        Subscription::new(move || {
            if let Some(handlers) = weak.upgrade() {
                handlers.lock().retain(|(handler_id, _)| *handler_id != id);
            }
        })
    }

    /// Delivers `event` to every handler registered at call time.
    pub fn emit(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    /// Returns the number of handlers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Returns `true` if nobody is subscribed.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Removes every handler.
    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.lock().len())
            .finish()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle returned by a subscribe call.
///
/// Dropping the handle keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "dropping a Subscription does not unsubscribe; keep it to remove the handler later"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Removes the handler. Idempotent with respect to the bus being gone.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

// ============================================================================
// ClientEvent
// ============================================================================

/// Lifecycle events broadcast by the manager and namespace sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Engine reached `Open`.
    Open,
    /// Engine closed.
    Close {
        /// Close reason (`transport close`, `ping timeout`, ...).
        reason: String,
    },
    /// Namespace connect packet sent or about to be sent.
    Connecting,
    /// Namespace handshake completed.
    Connect,
    /// Namespace disconnected.
    Disconnect {
        /// Why (`io client disconnect`, `io server disconnect`, engine reason).
        reason: String,
    },
    /// Connection attempt failed.
    ConnectError {
        /// Failure description.
        message: String,
    },
    /// Connection attempt timed out.
    ConnectTimeout {
        /// Configured timeout.
        timeout_ms: u64,
    },
    /// A reconnection attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// A reconnection attempt is scheduled (alias of `Reconnecting`).
    ReconnectAttempt {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Reconnection succeeded.
    Reconnect {
        /// Attempt that succeeded.
        attempt: u32,
    },
    /// A reconnection attempt failed.
    ReconnectError {
        /// Failure description.
        message: String,
    },
    /// Every allowed reconnection attempt failed.
    ReconnectFailed,
    /// Engine, decoder or server error.
    Error {
        /// Error description.
        message: String,
    },
    /// Heartbeat ping sent.
    Ping,
    /// Heartbeat pong received.
    Pong {
        /// Round-trip time of the last ping.
        latency_ms: u64,
    },
}

impl ClientEvent {
    /// Returns the wire-compatible event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close { .. } => "close",
            Self::Connecting => "connecting",
            Self::Connect => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::ConnectError { .. } => "connect_error",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::Reconnecting { .. } => "reconnecting",
            Self::ReconnectAttempt { .. } => "reconnect_attempt",
            Self::Reconnect { .. } => "reconnect",
            Self::ReconnectError { .. } => "reconnect_error",
            Self::ReconnectFailed => "reconnect_failed",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}

/// Event names reserved for [`ClientEvent`]s; user events may not use them.
pub const RESERVED_EVENTS: &[&str] = &[
    "connect",
    "connect_error",
    "connect_timeout",
    "connecting",
    "disconnect",
    "error",
    "reconnect",
    "reconnect_attempt",
    "reconnect_failed",
    "reconnect_error",
    "reconnecting",
    "ping",
    "pong",
];

/// Returns `true` if `name` collides with a lifecycle event.
#[inline]
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    RESERVED_EVENTS.contains(&name)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_all_handlers() {
        let bus = EventBus::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let total = Arc::clone(&total);
            let _sub = bus.subscribe(move |n| {
                total.fetch_add(*n as usize, Ordering::SeqCst);
            });
        }

        bus.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
        assert_eq!(bus.len(), 3);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_handler() {
        let bus = EventBus::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let first = {
            let hits = Arc::clone(&hits);
            bus.subscribe(move |()| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _second = {
            let hits = Arc::clone(&hits);
            bus.subscribe(move |()| {
                hits.fetch_add(10, Ordering::SeqCst);
            })
        };

        first.unsubscribe();
        bus.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn test_unsubscribe_after_bus_dropped() {
        let bus = EventBus::<()>::new();
        let sub = bus.subscribe(|()| {});
        drop(bus);
        sub.unsubscribe();
    }

    #[test]
    fn test_reentrant_subscribe_from_handler() {
        let bus = Arc::new(EventBus::<()>::new());
        let inner = Arc::clone(&bus);
        let _sub = bus.subscribe(move |()| {
            let _nested = inner.subscribe(|()| {});
        });
        bus.emit(&());
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(ClientEvent::ReconnectFailed.name(), "reconnect_failed");
        assert_eq!(ClientEvent::Pong { latency_ms: 3 }.name(), "pong");
        assert!(is_reserved("connect"));
        assert!(!is_reserved("chat"));
    }
}
