//! Transport session state machine.
//!
//! The engine owns exactly one active transport, performs the `open`
//! handshake, probes and upgrades to better transports, runs the heartbeat
//! and buffers outbound frames until the transport is writable.
//!
//! # Lifecycle
//!
//! ```text
//! Opening ──handshake──► Open ──close()──► Closing ──drain/upgrade──► Closed
//!    │                    │                                            ▲
//!    └──error/timeout─────┴──────── transport close / ping timeout ────┘
//! ```
//!
//! # Upgrade Probe
//!
//! | Step | Probe transport | Active transport |
//! |------|-----------------|------------------|
//! | 1 | `open()` | keeps flowing |
//! | 2 | send `ping "probe"` | keeps flowing |
//! | 3 | receive `pong "probe"` | `pause()` |
//! | 4 | becomes active, sends `upgrade` | released |
//!
//! Candidates are probed one at a time; a failed probe leaves the active
//! transport untouched.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | The engine actor |
//! | `handshake` | [`Handshake`] payload |
//! | `options` | [`EngineOptions`] |

// ============================================================================
// Submodules
// ============================================================================

mod core;

/// Handshake payload.
pub mod handshake;

/// Engine configuration.
pub mod options;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::{Data, SessionPacket};
use crate::transport::{DefaultTransportFactory, TransportFactory, TransportKind, TransportMemory};

use self::core::EngineActor;

// ============================================================================
// Re-exports
// ============================================================================

pub use handshake::Handshake;
pub use options::EngineOptions;

// ============================================================================
// ReadyState
// ============================================================================

/// Engine connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadyState {
    /// Waiting for the handshake.
    #[default]
    Opening,
    /// Handshake done; frames flow.
    Open,
    /// `close()` called; waiting for drain or upgrade.
    Closing,
    /// Terminal.
    Closed,
}

impl ReadyState {
    /// Returns the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// EngineEvent
// ============================================================================

/// Notification from the engine to its owner.
#[derive(Debug)]
pub enum EngineEvent {
    /// Handshake completed; the session is open.
    Open,
    /// Handshake payload received.
    Handshake(Handshake),
    /// Application message.
    Message(Data),
    /// Heartbeat ping sent.
    Ping,
    /// Heartbeat pong received.
    Pong,
    /// Probe answered; the active transport is pausing.
    Upgrading(TransportKind),
    /// The probe transport became active.
    Upgrade(TransportKind),
    /// A probe failed; the session is unaffected.
    UpgradeError(Error),
    /// Write buffer fully flushed.
    Drain,
    /// Fatal error; a `Close` follows.
    Error(Error),
    /// Session closed. Terminal.
    Close {
        /// `transport close`, `transport error`, `ping timeout` or `forced close`.
        reason: String,
        /// Underlying error text, if any.
        description: Option<String>,
    },
}

/// Receiving half of an engine's event channel.
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

// ============================================================================
// EngineStatus
// ============================================================================

/// Snapshot published by the actor.
#[derive(Debug, Clone, Default)]
pub(crate) struct EngineStatus {
    pub ready_state: ReadyState,
    pub id: Option<SessionId>,
    pub transport: Option<TransportKind>,
    pub upgrading: bool,
}

// ============================================================================
// EngineCommand
// ============================================================================

/// Requests from handles to the actor.
pub(crate) enum EngineCommand {
    /// Append frames to the write buffer.
    Send(Vec<SessionPacket>),
    /// Close after pending writes and upgrades settle.
    Close,
}

// ============================================================================
// Engine
// ============================================================================

/// Handle to a running engine session.
///
/// Cloning is cheap; all clones address the same session. The session is
/// closed when [`Engine::close`] is called or every handle is dropped.
#[derive(Clone)]
pub struct Engine {
    command_tx: mpsc::UnboundedSender<EngineCommand>,
    status: Arc<RwLock<EngineStatus>>,
}

impl Engine {
    /// Opens a session with the built-in transports.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options are invalid.
    pub fn new(options: EngineOptions) -> Result<(Self, EngineEventReceiver)> {
        Self::open(
            options,
            Arc::new(DefaultTransportFactory::new()),
            TransportMemory::new(),
        )
    }

    /// Opens a session using `factory` for transports.
    ///
    /// Must be called inside a tokio runtime. Transport failures are
    /// reported as [`EngineEvent::Error`] followed by [`EngineEvent::Close`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options are invalid.
    pub fn open(
        options: EngineOptions,
        factory: Arc<dyn TransportFactory>,
        memory: TransportMemory,
    ) -> Result<(Self, EngineEventReceiver)> {
        options.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(EngineStatus::default()));

        let actor = EngineActor::new(options, factory, memory, Arc::clone(&status), event_tx);
        tokio::spawn(actor.run(command_rx));

        Ok((Self { command_tx, status }, event_rx))
    }

    /// Queues one `message` frame.
    ///
    /// Frames sent while closing or closed are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the engine has terminated.
    pub fn send(&self, data: impl Into<Data>) -> Result<()> {
        self.send_all(vec![data.into()])
    }

    /// Queues several `message` frames contiguously.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the engine has terminated.
    pub fn send_all(&self, data: Vec<Data>) -> Result<()> {
        let packets = data.into_iter().map(SessionPacket::message).collect();
        self.command_tx
            .send(EngineCommand::Send(packets))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Closes the session once pending writes and upgrades settle.
    ///
    /// Idempotent.
    pub fn close(&self) {
        let _ = self.command_tx.send(EngineCommand::Close);
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.status.read().ready_state
    }

    /// Returns the session id once the handshake completed.
    #[inline]
    #[must_use]
    pub fn id(&self) -> Option<SessionId> {
        self.status.read().id.clone()
    }

    /// Returns the active transport.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> Option<TransportKind> {
        self.status.read().transport
    }

    /// Returns `true` while an upgrade is switching transports.
    #[inline]
    #[must_use]
    pub fn is_upgrading(&self) -> bool {
        self.status.read().upgrading
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status.read();
        f.debug_struct("Engine")
            .field("ready_state", &status.ready_state)
            .field("id", &status.id)
            .field("transport", &status.transport)
            .finish()
    }
}
