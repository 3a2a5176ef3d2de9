//! Wire protocol codecs.
//!
//! Two nested framings travel over every transport:
//!
//! | Layer | Module | Unit |
//! |-------|--------|------|
//! | Session framing | `session` | [`SessionPacket`] (`open`, `ping`, `message`, ...) |
//! | Application framing | `packet` | [`Packet`] (`event`, `ack`, ...) carried inside `message` frames |
//! | Binary attachments | `binary` | [`Payload`] with out-of-band binary leaves |
//!
//! # Data Flow
//!
//! ```text
//! Socket.emit ─► Packet ─► Encoder ─► [text header, attachment...]
//!                                          │ one `message` SessionPacket each
//!                                          ▼
//!                               encode_packet / encode_payload ─► Transport
//! ```
//!
//! All decode functions return explicit results; malformed input never
//! panics.

// ============================================================================
// Submodules
// ============================================================================

/// Binary placeholder deconstruction and reconstruction.
pub mod binary;

/// Application-level packet codec.
pub mod packet;

/// Session-level packet codec and batch framing.
pub mod session;

// ============================================================================
// Re-exports
// ============================================================================

pub use binary::{BinaryPlaceholder, Payload, deconstruct, reconstruct};
pub use packet::{
    Decoder, Encoder, Packet, PacketKind, ROOT_NAMESPACE, decode_string, encode_string,
};
pub use session::{
    SessionPacket, SessionPacketKind, decode_packet, decode_payload, encode_packet,
    encode_payload,
};

// ============================================================================
// Constants
// ============================================================================

/// Session protocol revision advertised as the `EIO` query parameter.
pub const PROTOCOL_VERSION: u8 = 3;

// ============================================================================
// Data
// ============================================================================

/// A single frame body: either UTF-8 text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl Data {
    /// Returns the text content, if this is a text frame.
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    /// Returns `true` for binary frames.
    #[inline]
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Returns the frame length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Returns `true` if the frame carries no bytes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Data {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}
