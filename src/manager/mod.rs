//! Connection manager.
//!
//! A [`Manager`] owns one engine session at a time, multiplexes namespace
//! sockets over it and reconnects with exponential backoff after
//! unexpected closes.
//!
//! # Lifecycle
//!
//! ```text
//! Closed ──connect()──► Opening ──engine open──► Open
//!   ▲                      │                       │
//!   │                connect error            engine close
//!   │                      ▼                       ▼
//!   └──── attempts exhausted ◄── reconnect (backoff delay) ──┘
//! ```
//!
//! # Events
//!
//! Lifecycle notifications ([`ClientEvent`]) go to handlers registered with
//! [`Manager::on`]. Reconnection events are also forwarded to every
//! namespace socket's lifecycle handlers.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `backoff` | [`Backoff`] delay schedule |
//! | `core` | The manager actor |
//! | `options` | [`ManagerOptions`] |

// ============================================================================
// Submodules
// ============================================================================

/// Reconnection delay schedule.
pub mod backoff;

mod core;

/// Manager configuration.
pub mod options;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use url::Url;

use crate::engine::ReadyState;
use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventBus, Subscription};
use crate::identifiers::{AckId, SessionId};
use crate::protocol::{Packet, ROOT_NAMESPACE};
use crate::socket::{AckCallback, Socket, SocketShared};
use crate::transport::{DefaultTransportFactory, TransportFactory, TransportMemory};

use self::core::ManagerActor;

// ============================================================================
// Re-exports
// ============================================================================

pub use backoff::Backoff;
pub use options::ManagerOptions;

// ============================================================================
// ManagerCommand
// ============================================================================

/// Requests from manager and socket handles to the actor.
pub(crate) enum ManagerCommand {
    /// Open the engine; reply once it is open or failed.
    Connect(Option<oneshot::Sender<Result<()>>>),
    /// Close the engine and stop reconnecting.
    Disconnect,
    /// Track a newly created namespace socket.
    Register(Arc<SocketShared>),
    /// Join a namespace.
    OpenSocket(String),
    /// Leave a namespace.
    CloseSocket(String),
    /// Send an event, buffering until the namespace is connected.
    Emit {
        namespace: String,
        packet: Packet,
        ack: Option<AckCallback>,
    },
    /// Write a packet immediately (acknowledgement replies).
    Packet(Packet),
    /// Drop a pending acknowledgement callback.
    CancelAck { namespace: String, id: AckId },
}

// ============================================================================
// ManagerShared
// ============================================================================

/// Snapshot published by the actor.
#[derive(Debug, Clone, Default)]
pub(crate) struct ManagerStatus {
    pub ready_state: ManagerState,
    pub engine_id: Option<SessionId>,
    pub reconnecting: bool,
}

/// Manager connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ManagerState {
    /// No engine.
    #[default]
    Closed,
    /// Engine handshake in progress.
    Opening,
    /// Engine open.
    Open,
}

impl From<ManagerState> for ReadyState {
    fn from(state: ManagerState) -> Self {
        match state {
            ManagerState::Closed => Self::Closed,
            ManagerState::Opening => Self::Opening,
            ManagerState::Open => Self::Open,
        }
    }
}

/// State shared by manager handles, socket handles and the actor.
pub(crate) struct ManagerShared {
    pub uri: Url,
    pub options: RwLock<ManagerOptions>,
    pub backoff: Mutex<Backoff>,
    pub status: RwLock<ManagerStatus>,
    pub events: EventBus<ClientEvent>,
    pub sockets: Mutex<FxHashMap<String, Arc<SocketShared>>>,
    pub factory: Arc<dyn TransportFactory>,
    pub memory: TransportMemory,
}

// ============================================================================
// Manager
// ============================================================================

/// Handle to a connection manager.
///
/// Cloning is cheap; all clones address the same manager. The actor stops
/// once every manager and socket handle is dropped.
#[derive(Clone)]
pub struct Manager {
    command_tx: mpsc::UnboundedSender<ManagerCommand>,
    shared: Arc<ManagerShared>,
}

impl Manager {
    /// Creates a manager for `uri` with the built-in transports.
    ///
    /// Must be called inside a tokio runtime. Connects immediately when
    /// `auto_connect` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] for an unparsable URI and [`Error::Config`]
    /// for invalid options.
    pub fn new(uri: &str, options: ManagerOptions) -> Result<Self> {
        Self::with_factory(uri, options, Arc::new(DefaultTransportFactory::new()))
    }

    /// Creates a manager using `factory` for transports.
    ///
    /// # Errors
    ///
    /// Same as [`Manager::new`].
    pub fn with_factory(
        uri: &str,
        mut options: ManagerOptions,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let uri = Url::parse(uri)?;
        options.engine.set_uri(&uri)?;
        options.validate()?;

        let auto_connect = options.auto_connect;
        let shared = Arc::new(ManagerShared {
            uri,
            backoff: Mutex::new(options.backoff()),
            options: RwLock::new(options),
            status: RwLock::new(ManagerStatus::default()),
            events: EventBus::new(),
            sockets: Mutex::new(FxHashMap::default()),
            factory,
            memory: TransportMemory::new(),
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let actor = ManagerActor::new(Arc::clone(&shared), command_tx.downgrade());
        tokio::spawn(actor.run(command_rx));

        let manager = Self { command_tx, shared };
        if auto_connect {
            manager.open();
        }
        Ok(manager)
    }

    // ========================================================================
    // Sockets
    // ========================================================================

    /// Returns the socket for `namespace`, creating it on first use.
    ///
    /// A new socket joins immediately when `auto_connect` is set.
    #[must_use]
    pub fn socket(&self, namespace: &str) -> Socket {
        self.socket_inner(namespace, None)
    }

    /// Like [`Manager::socket`], attaching `query` to the namespace
    /// `Connect` packet of a newly created socket.
    #[must_use]
    pub fn socket_with_query(&self, namespace: &str, query: impl Into<String>) -> Socket {
        self.socket_inner(namespace, Some(query.into()))
    }

    fn socket_inner(&self, namespace: &str, query: Option<String>) -> Socket {
        let namespace = normalize_namespace(namespace);
        let (shared, created) = {
            let mut sockets = self.shared.sockets.lock();
            match sockets.get(&namespace) {
                Some(shared) => (Arc::clone(shared), false),
                None => {
                    let shared = Arc::new(SocketShared::new(namespace.clone(), query));
                    sockets.insert(namespace.clone(), Arc::clone(&shared));
                    (shared, true)
                }
            }
        };

        if created {
            debug!(%namespace, "Created namespace socket");
            let _ = self
                .command_tx
                .send(ManagerCommand::Register(Arc::clone(&shared)));
            if self.shared.options.read().auto_connect {
                let _ = self.command_tx.send(ManagerCommand::OpenSocket(namespace));
            }
        }

        Socket::new(shared, self.command_tx.clone())
    }

    /// Returns `true` if a socket for `namespace` was created.
    #[must_use]
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.shared
            .sockets
            .lock()
            .contains_key(&normalize_namespace(namespace))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts connecting without waiting.
    pub fn open(&self) {
        let _ = self.command_tx.send(ManagerCommand::Connect(None));
    }

    /// Connects and waits until the engine is open.
    ///
    /// Resolves immediately when already open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Data`] (`"Connection Error"`) when the attempt
    /// fails, [`Error::ConnectionTimeout`] when it times out and
    /// [`Error::ConnectionClosed`] when [`Manager::disconnect`] interrupts
    /// it.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(ManagerCommand::Connect(Some(tx)))
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await?
    }

    /// Closes the engine and stops reconnecting.
    pub fn disconnect(&self) {
        let _ = self.command_tx.send(ManagerCommand::Disconnect);
    }

    /// Alias of [`Manager::disconnect`].
    #[inline]
    pub fn close(&self) {
        self.disconnect();
    }

    /// Registers a lifecycle handler.
    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(handler)
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Returns the URI the manager connects to.
    #[inline]
    #[must_use]
    pub fn uri(&self) -> &Url {
        &self.shared.uri
    }

    /// Returns the connection state.
    #[inline]
    #[must_use]
    pub fn ready_state(&self) -> ManagerState {
        self.shared.status.read().ready_state
    }

    /// Returns the engine session id while open.
    #[inline]
    #[must_use]
    pub fn engine_id(&self) -> Option<SessionId> {
        self.shared.status.read().engine_id.clone()
    }

    /// Returns `true` while a reconnection delay is pending.
    #[inline]
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.shared.status.read().reconnecting
    }

    /// Returns a copy of the current options.
    #[must_use]
    pub fn options(&self) -> ManagerOptions {
        self.shared.options.read().clone()
    }

    // ========================================================================
    // Reconnection Settings
    // ========================================================================

    /// Enables or disables reconnection.
    pub fn set_reconnection(&self, reconnection: bool) {
        self.shared.options.write().reconnection = reconnection;
    }

    /// Limits reconnection attempts; `None` is unlimited.
    pub fn set_reconnection_attempts(&self, attempts: Option<u32>) {
        self.shared.options.write().reconnection_attempts = attempts;
    }

    /// Sets the base reconnection delay; applies to the next delay.
    pub fn set_reconnection_delay(&self, delay: Duration) {
        self.shared.options.write().reconnection_delay = delay;
        self.shared.backoff.lock().set_min(delay);
    }

    /// Sets the reconnection delay cap; applies to the next delay.
    pub fn set_reconnection_delay_max(&self, delay: Duration) {
        self.shared.options.write().reconnection_delay_max = delay;
        self.shared.backoff.lock().set_max(delay);
    }

    /// Sets the jitter factor, clamped to `[0, 1]`.
    pub fn set_randomization_factor(&self, factor: f64) {
        let factor = factor.clamp(0.0, 1.0);
        self.shared.options.write().randomization_factor = factor;
        self.shared.backoff.lock().set_jitter(factor);
    }

    /// Sets or disables the connection timeout for later attempts.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.shared.options.write().timeout = timeout;
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.shared.status.read();
        f.debug_struct("Manager")
            .field("uri", &self.shared.uri.as_str())
            .field("ready_state", &status.ready_state)
            .field("engine_id", &status.engine_id)
            .field("reconnecting", &status.reconnecting)
            .finish()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Ensures a leading slash; the empty namespace is the root.
pub(crate) fn normalize_namespace(namespace: &str) -> String {
    if namespace.is_empty() {
        ROOT_NAMESPACE.to_string()
    } else if namespace.starts_with('/') {
        namespace.to_string()
    } else {
        format!("/{namespace}")
    }
}
