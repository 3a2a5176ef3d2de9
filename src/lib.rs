//! sockio - Real-time messaging client.
//!
//! This library maintains a long-lived logical connection to a socket.io
//! (protocol revision 3) server over interchangeable transports, upgrades
//! from HTTP long-polling to WebSocket without losing in-flight data, and
//! multiplexes acknowledgement-capable event namespaces over one session.
//!
//! # Architecture
//!
//! ```text
//! Socket ──► Manager ──► Engine ──► Transport ──► network
//!  (namespace)  (codec, reconnect)  (session, upgrade, heartbeat)
//! ```
//!
//! Key design principles:
//!
//! - Each [`Engine`] and [`Manager`] is an actor: one task owns all state
//! - Handles are cheap `Clone` wrappers around a command channel
//! - Timers are deadlines checked in the actor loop; cancelling clears them
//! - Malformed input becomes an error event, never a panic
//!
//! # Quick Start
//!
//! ```no_run
//! use sockio::{Manager, ManagerOptions, Payload, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = Manager::new("http://localhost:3000", ManagerOptions::new())?;
//!     let socket = manager.socket("/chat");
//!
//!     let _sub = socket.on("message", |event| {
//!         println!("{}: {:?}", event.name, event.args);
//!     })?;
//!
//!     manager.connect().await?;
//!     socket.emit("join", vec![Payload::from("lobby")])?;
//!
//!     let reply = socket
//!         .emit_with_ack_timeout("ping", vec![], std::time::Duration::from_secs(5))
//!         .await?;
//!     println!("ack: {reply:?}");
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Per-origin manager cache |
//! | [`engine`] | Transport session state machine |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`events`] | Event bus and lifecycle events |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`manager`] | Reconnection and namespace multiplexing |
//! | [`protocol`] | Session and application packet codecs |
//! | [`socket`] | Namespace sockets and acknowledgements |
//! | [`transport`] | WebSocket and long-polling transports |

// ============================================================================
// Modules
// ============================================================================

/// Select-loop helpers shared by the actors.
pub(crate) mod actor;

/// Per-origin manager cache.
pub mod client;

/// Transport session state machine.
///
/// Use [`Engine::new`] for a raw session without namespaces.
pub mod engine;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Event bus and lifecycle events.
pub mod events;

/// Type-safe identifiers.
pub mod identifiers;

/// Connection manager.
///
/// Owns the engine, reconnects with backoff and multiplexes namespaces.
pub mod manager;

/// Wire protocol codecs.
pub mod protocol;

/// Namespace sockets.
pub mod socket;

/// Byte transports.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{Client, connect};

// Engine types
pub use engine::{Engine, EngineEvent, EngineOptions, Handshake, ReadyState};

// Error types
pub use error::{Error, Result};

// Event types
pub use events::{ClientEvent, EventBus, Subscription};

// Identifier types
pub use identifiers::{AckId, SessionId};

// Manager types
pub use manager::{Backoff, Manager, ManagerOptions, ManagerState};

// Protocol types
pub use protocol::{Data, Packet, PacketKind, Payload};

// Socket types
pub use socket::{Ack, IncomingEvent, Socket};

// Transport types
pub use transport::{TransportFactory, TransportKind};
