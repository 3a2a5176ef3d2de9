//! Namespace sockets.
//!
//! A [`Socket`] is the application's view of one namespace multiplexed over
//! a [`Manager`](crate::Manager). Outbound events are handed to the manager
//! actor; inbound events are dispatched to handlers registered with
//! [`Socket::on`].
//!
//! # Acknowledgements
//!
//! | Direction | API |
//! |-----------|-----|
//! | We ask the server | [`Socket::emit_with_ack`], [`Socket::emit_with_ack_timeout`] |
//! | Server asks us | [`IncomingEvent::ack`] carries a one-shot [`Ack`] |
//!
//! # Example
//!
//! ```ignore
//! let socket = manager.socket("/chat");
//! let _sub = socket.on("message", |event| {
//!     if let Some(ack) = &event.ack {
//!         ack.send(vec!["received".into()]);
//!     }
//! })?;
//! socket.emit("join", vec!["lobby".into()])?;
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Per-namespace protocol state owned by the manager actor.
pub(crate) mod state;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::trace;

use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventBus, Subscription, is_reserved};
use crate::identifiers::AckId;
use crate::manager::ManagerCommand;
use crate::protocol::{Packet, Payload};

// ============================================================================
// Types
// ============================================================================

/// Callback invoked with the arguments of an acknowledgement.
pub type AckCallback = Box<dyn FnOnce(Vec<Payload>) + Send>;

// ============================================================================
// IncomingEvent
// ============================================================================

/// An event received from the server.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    /// Event name (first element of the packet data).
    pub name: String,
    /// Remaining arguments.
    pub args: Vec<Payload>,
    /// Present when the server expects an acknowledgement.
    pub ack: Option<Ack>,
}

// ============================================================================
// Ack
// ============================================================================

/// One-shot acknowledgement for an inbound event.
///
/// Clones share the same state; only the first [`Ack::send`] across all
/// clones transmits.
#[derive(Clone)]
pub struct Ack {
    namespace: String,
    id: AckId,
    sent: Arc<AtomicBool>,
    command_tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl Ack {
    pub(crate) fn new(
        namespace: impl Into<String>,
        id: AckId,
        command_tx: mpsc::UnboundedSender<ManagerCommand>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            id,
            sent: Arc::new(AtomicBool::new(false)),
            command_tx,
        }
    }

    /// Returns the id being acknowledged.
    #[inline]
    #[must_use]
    pub fn id(&self) -> AckId {
        self.id
    }

    /// Returns `true` once the acknowledgement went out.
    #[inline]
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    /// Sends the acknowledgement.
    ///
    /// Returns `false` without sending if it was already sent.
    pub fn send(&self, args: Vec<Payload>) -> bool {
        if self.sent.swap(true, Ordering::AcqRel) {
            trace!(id = %self.id, "Acknowledgement already sent");
            return false;
        }
        let packet = Packet::ack(self.namespace.clone(), args, self.id);
        let _ = self.command_tx.send(ManagerCommand::Packet(packet));
        true
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("namespace", &self.namespace)
            .field("id", &self.id)
            .field("sent", &self.is_sent())
            .finish()
    }
}

// ============================================================================
// SocketShared
// ============================================================================

#[derive(Debug, Clone, Default)]
pub(crate) struct SocketStatus {
    pub connected: bool,
    pub id: Option<String>,
}

/// State shared by every handle of one namespace and the manager actor.
pub(crate) struct SocketShared {
    pub namespace: String,
    pub query: Option<String>,
    pub status: RwLock<SocketStatus>,
    pub lifecycle: EventBus<ClientEvent>,
    listeners: Mutex<FxHashMap<String, Arc<EventBus<IncomingEvent>>>>,
    next_ack: Mutex<AckId>,
}

impl SocketShared {
    pub(crate) fn new(namespace: impl Into<String>, query: Option<String>) -> Self {
        Self {
            namespace: namespace.into(),
            query,
            status: RwLock::new(SocketStatus::default()),
            lifecycle: EventBus::new(),
            listeners: Mutex::new(FxHashMap::default()),
            next_ack: Mutex::new(AckId::new(0)),
        }
    }

    fn next_ack_id(&self) -> AckId {
        self.next_ack.lock().post_increment()
    }

    /// Delivers an event to the handlers registered for its name.
    pub(crate) fn dispatch(&self, event: &IncomingEvent) {
        let bus = self.listeners.lock().get(&event.name).cloned();
        match bus {
            Some(bus) => bus.emit(event),
            None => trace!(namespace = %self.namespace, event = %event.name, "No handler for event"),
        }
    }

    fn subscribe<F>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(&IncomingEvent) + Send + Sync + 'static,
    {
        let bus = Arc::clone(
            self.listeners
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(EventBus::new())),
        );
        bus.subscribe(handler)
    }
}

// ============================================================================
// Socket
// ============================================================================

/// Handle to one namespace.
///
/// Cloning is cheap; clones share listeners, buffers and ack ids.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<SocketShared>,
    command_tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl Socket {
    pub(crate) fn new(
        shared: Arc<SocketShared>,
        command_tx: mpsc::UnboundedSender<ManagerCommand>,
    ) -> Self {
        Self { shared, command_tx }
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Returns the namespace path.
    #[inline]
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    /// Returns the socket id (`<nsp>#<sid>`, or the bare session id on
    /// `/`) once connected.
    #[inline]
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.shared.status.read().id.clone()
    }

    /// Returns `true` after the namespace handshake completed.
    #[inline]
    #[must_use]
    pub fn connected(&self) -> bool {
        self.shared.status.read().connected
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Joins the namespace, opening the manager if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the manager has terminated.
    pub fn connect(&self) -> Result<()> {
        self.command(ManagerCommand::OpenSocket(self.shared.namespace.clone()))
    }

    /// Leaves the namespace.
    ///
    /// Sends a `Disconnect` packet when connected. The manager closes once
    /// no namespace is left.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the manager has terminated.
    pub fn disconnect(&self) -> Result<()> {
        self.command(ManagerCommand::CloseSocket(self.shared.namespace.clone()))
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Registers a handler for a server event.
    ///
    /// Handlers run on the manager task and must not block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for reserved lifecycle names; use
    /// [`Socket::on_lifecycle`] for those.
    pub fn on<F>(&self, event: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(&IncomingEvent) + Send + Sync + 'static,
    {
        if is_reserved(event) {
            return Err(Error::config(format!("'{event}' is a reserved event name")));
        }
        Ok(self.shared.subscribe(event, handler))
    }

    /// Registers a handler for connect, disconnect and manager lifecycle
    /// events of this namespace.
    pub fn on_lifecycle<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.shared.lifecycle.subscribe(handler)
    }

    // ========================================================================
    // Emitting
    // ========================================================================

    /// Emits an event.
    ///
    /// Buffered until the namespace is connected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for reserved names and
    /// [`Error::ConnectionClosed`] if the manager has terminated.
    pub fn emit(&self, event: &str, args: Vec<Payload>) -> Result<()> {
        let packet = self.event_packet(event, args, None)?;
        self.command(ManagerCommand::Emit {
            namespace: self.shared.namespace.clone(),
            packet,
            ack: None,
        })
    }

    /// Emits an event and calls `callback` with the server's acknowledgement.
    ///
    /// # Errors
    ///
    /// Same as [`Socket::emit`].
    pub fn emit_with_ack<F>(&self, event: &str, args: Vec<Payload>, callback: F) -> Result<AckId>
    where
        F: FnOnce(Vec<Payload>) + Send + 'static,
    {
        let id = self.shared.next_ack_id();
        let packet = self.event_packet(event, args, Some(id))?;
        self.command(ManagerCommand::Emit {
            namespace: self.shared.namespace.clone(),
            packet,
            ack: Some(Box::new(callback)),
        })?;
        Ok(id)
    }

    /// Emits an event and waits for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AckTimeout`] if no acknowledgement arrives in
    /// time, [`Error::ConnectionClosed`] if the manager drops the callback.
    pub async fn emit_with_ack_timeout(
        &self,
        event: &str,
        args: Vec<Payload>,
        ack_timeout: Duration,
    ) -> Result<Vec<Payload>> {
        let (tx, rx) = oneshot::channel();
        let id = self.emit_with_ack(event, args, move |reply| {
            let _ = tx.send(reply);
        })?;

        match timeout(ack_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                let _ = self.command_tx.send(ManagerCommand::CancelAck {
                    namespace: self.shared.namespace.clone(),
                    id,
                });
                Err(Error::ack_timeout(
                    event,
                    u64::try_from(ack_timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }

    /// Emits a `message` event.
    ///
    /// # Errors
    ///
    /// Same as [`Socket::emit`].
    pub fn send(&self, args: Vec<Payload>) -> Result<()> {
        self.emit("message", args)
    }

    fn event_packet(&self, event: &str, args: Vec<Payload>, id: Option<AckId>) -> Result<Packet> {
        if is_reserved(event) {
            return Err(Error::config(format!("'{event}' is a reserved event name")));
        }
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Payload::from(event));
        data.extend(args);
        Ok(Packet::event(self.shared.namespace.clone(), data, id))
    }

    fn command(&self, command: ManagerCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| Error::ConnectionClosed)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("namespace", &self.shared.namespace)
            .field("connected", &self.connected())
            .field("id", &self.id())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
