//! Application-level packet codec.
//!
//! Text header grammar:
//!
//! ```text
//! <kind>[<attachments>-][<namespace>,][<ack id>][<json>]
//! ```
//!
//! The attachment count is present only for binary kinds, the namespace
//! only when it differs from `/`. A binary packet is followed by exactly
//! `attachments` binary frames, which [`Decoder`] buffers until the packet
//! is complete.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::fmt::Write as _;

use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::AckId;

use super::Data;
use super::binary::{Payload, deconstruct, reconstruct};

// ============================================================================
// Constants
// ============================================================================

/// Root namespace.
pub const ROOT_NAMESPACE: &str = "/";

/// Header sent in place of a packet that cannot be encoded.
const ENCODE_ERROR_PACKET: &str = "4\"encode error\"";

// ============================================================================
// PacketKind
// ============================================================================

/// Application packet kind, encoded as a single digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Namespace join.
    Connect,
    /// Namespace leave.
    Disconnect,
    /// Named event with JSON arguments.
    Event,
    /// Acknowledgement reply.
    Ack,
    /// Error report.
    Error,
    /// Event carrying binary attachments.
    BinaryEvent,
    /// Acknowledgement carrying binary attachments.
    BinaryAck,
}

impl PacketKind {
    /// All kinds, ordered by wire code.
    pub const ALL: [Self; 7] = [
        Self::Connect,
        Self::Disconnect,
        Self::Event,
        Self::Ack,
        Self::Error,
        Self::BinaryEvent,
        Self::BinaryAck,
    ];

    /// Returns the wire code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Connect => 0,
            Self::Disconnect => 1,
            Self::Event => 2,
            Self::Ack => 3,
            Self::Error => 4,
            Self::BinaryEvent => 5,
            Self::BinaryAck => 6,
        }
    }

    /// Looks a kind up by wire code.
    #[inline]
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    /// Returns `true` for kinds followed by attachments.
    #[inline]
    #[must_use]
    pub const fn is_binary(self) -> bool {
        matches!(self, Self::BinaryEvent | Self::BinaryAck)
    }

    /// Returns the binary variant of `Event`/`Ack`, or `self`.
    #[inline]
    #[must_use]
    pub const fn with_binary(self) -> Self {
        match self {
            Self::Event => Self::BinaryEvent,
            Self::Ack => Self::BinaryAck,
            other => other,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "CONNECT",
            Self::Disconnect => "DISCONNECT",
            Self::Event => "EVENT",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::BinaryEvent => "BINARY_EVENT",
            Self::BinaryAck => "BINARY_ACK",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Packet
// ============================================================================

/// One application packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Packet kind.
    pub kind: PacketKind,
    /// Target namespace, `/` by default.
    pub namespace: String,
    /// Acknowledgement id, if the sender expects or answers an ack.
    pub id: Option<AckId>,
    /// Arguments (an array for events and acks) or error payload.
    pub data: Option<Payload>,
    /// Number of binary attachments following the header.
    pub attachments: usize,
    /// Query string appended to the namespace of `Connect` packets.
    pub query: Option<String>,
}

impl Packet {
    /// Creates a packet with no id or data.
    #[must_use]
    pub fn new(kind: PacketKind, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            id: None,
            data: None,
            attachments: 0,
            query: None,
        }
    }

    /// Creates a `Connect` packet.
    #[must_use]
    pub fn connect(namespace: impl Into<String>, query: Option<String>) -> Self {
        Self {
            query,
            ..Self::new(PacketKind::Connect, namespace)
        }
    }

    /// Creates a `Disconnect` packet.
    #[must_use]
    pub fn disconnect(namespace: impl Into<String>) -> Self {
        Self::new(PacketKind::Disconnect, namespace)
    }

    /// Creates an event; picks the binary kind when `args` carry bytes.
    #[must_use]
    pub fn event(namespace: impl Into<String>, args: Vec<Payload>, id: Option<AckId>) -> Self {
        Self::with_args(PacketKind::Event, namespace, args, id)
    }

    /// Creates an ack reply; picks the binary kind when `args` carry bytes.
    #[must_use]
    pub fn ack(namespace: impl Into<String>, args: Vec<Payload>, id: AckId) -> Self {
        Self::with_args(PacketKind::Ack, namespace, args, Some(id))
    }

    fn with_args(
        kind: PacketKind,
        namespace: impl Into<String>,
        args: Vec<Payload>,
        id: Option<AckId>,
    ) -> Self {
        let data = Payload::Array(args);
        let kind = if data.has_binary() {
            kind.with_binary()
        } else {
            kind
        };
        Self {
            id,
            data: Some(data),
            ..Self::new(kind, namespace)
        }
    }

    /// Creates a local parser-error packet.
    #[must_use]
    pub fn parser_error(message: &str) -> Self {
        Self {
            data: Some(Payload::String(format!("parser error: {message}"))),
            ..Self::new(PacketKind::Error, ROOT_NAMESPACE)
        }
    }

    /// Returns the arguments of an event or ack.
    #[must_use]
    pub fn args(&self) -> &[Payload] {
        self.data
            .as_ref()
            .and_then(Payload::as_array)
            .unwrap_or_default()
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Stateless application packet encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

impl Encoder {
    /// Creates an encoder.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encodes a packet into its text header and attachment frames.
    ///
    /// The first element is always the text header; each attachment
    /// follows as a binary frame.
    #[must_use]
    pub fn encode(&self, packet: &Packet) -> Vec<Data> {
        let data = packet.data.clone();
        let has_binary = data.as_ref().is_some_and(Payload::has_binary);
        let kind = if has_binary {
            packet.kind.with_binary()
        } else {
            packet.kind
        };

        if has_binary && !kind.is_binary() {
            debug!(kind = %packet.kind, "Binary data in non-binary packet");
            return vec![Data::Text(ENCODE_ERROR_PACKET.to_string())];
        }

        let (json, attachments) = match data {
            Some(payload) => {
                let (json, attachments) = deconstruct(payload);
                (Some(json), attachments)
            }
            None => (None, Vec::new()),
        };

        let namespace = match (&packet.query, kind) {
            (Some(query), PacketKind::Connect) => format!("{}?{query}", packet.namespace),
            _ => packet.namespace.clone(),
        };

        let header = encode_string(kind, attachments.len(), &namespace, packet.id, json.as_ref());
        trace!(%kind, %header, attachments = attachments.len(), "Encoded packet");

        let mut frames = Vec::with_capacity(attachments.len() + 1);
        frames.push(Data::Text(header));
        frames.extend(attachments.into_iter().map(Data::Binary));
        frames
    }
}

/// Renders a text header.
#[must_use]
pub fn encode_string(
    kind: PacketKind,
    attachments: usize,
    namespace: &str,
    id: Option<AckId>,
    json: Option<&Value>,
) -> String {
    let mut out = kind.code().to_string();

    if kind.is_binary() {
        let _ = write!(out, "{attachments}-");
    }
    if !namespace.is_empty() && namespace != ROOT_NAMESPACE {
        out.push_str(namespace);
        out.push(',');
    }
    if let Some(id) = id {
        let _ = write!(out, "{id}");
    }
    if let Some(json) = json {
        out.push_str(&json.to_string());
    }

    out
}

// ============================================================================
// Header Decoding
// ============================================================================

/// Text header before attachment substitution.
#[derive(Debug)]
struct Header {
    kind: PacketKind,
    namespace: String,
    id: Option<AckId>,
    attachments: usize,
    json: Option<Value>,
}

impl Header {
    fn into_packet(self, data: Option<Payload>) -> Packet {
        Packet {
            kind: self.kind,
            namespace: self.namespace,
            id: self.id,
            data,
            attachments: self.attachments,
            query: None,
        }
    }
}

/// Outcome of header parsing.
enum HeaderResult {
    Header(Header),
    /// Recoverable grammar error, surfaced as a parser-error packet.
    Invalid(String),
}

fn decode_header(input: &str) -> HeaderResult {
    let Some(kind) = input
        .chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .and_then(|d| u8::try_from(d).ok())
        .and_then(PacketKind::from_code)
    else {
        return HeaderResult::Invalid(format!(
            "Unknown packet type: {}",
            input.chars().next().unwrap_or_default()
        ));
    };

    let mut rest = &input[1..];

    let mut attachments = 0;
    if kind.is_binary() {
        let Some((count, tail)) = rest.split_once('-') else {
            return HeaderResult::Invalid("Illegal attachments".to_string());
        };
        let Ok(count) = count.parse::<usize>() else {
            return HeaderResult::Invalid("Illegal attachments".to_string());
        };
        attachments = count;
        rest = tail;
    }

    let mut namespace = ROOT_NAMESPACE.to_string();
    if rest.starts_with('/') {
        let (nsp, tail) = rest.split_once(',').unwrap_or((rest, ""));
        namespace = nsp.to_string();
        rest = tail;
    }

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let mut id = None;
    if digits > 0 {
        match rest[..digits].parse::<u64>() {
            Ok(value) => id = Some(AckId::new(value)),
            Err(_) => return HeaderResult::Invalid("Invalid id".to_string()),
        }
        rest = &rest[digits..];
    }

    let mut json = None;
    if !rest.is_empty() {
        match serde_json::from_str::<Value>(rest) {
            Ok(value) if kind == PacketKind::Error || value.is_array() => json = Some(value),
            Ok(_) => {}
            Err(_) => return HeaderResult::Invalid("Invalid payload".to_string()),
        }
    }

    HeaderResult::Header(Header {
        kind,
        namespace,
        id,
        attachments,
        json,
    })
}

/// Decodes a text header into a packet.
///
/// Grammar violations yield an `Error` packet whose data is
/// `parser error: <reason>`. Placeholders in binary packets are left in
/// place.
#[must_use]
pub fn decode_string(input: &str) -> Packet {
    match decode_header(input) {
        HeaderResult::Header(header) => {
            let data = header.json.clone().map(Payload::from);
            header.into_packet(data)
        }
        HeaderResult::Invalid(message) => Packet::parser_error(&message),
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Binary packet awaiting its attachments.
#[derive(Debug)]
struct Reconstruction {
    header: Header,
    buffers: Vec<Vec<u8>>,
}

/// Stateful application packet decoder.
///
/// Feed every `message` frame to [`Decoder::add`]; completed packets are
/// returned in order.
#[derive(Debug, Default)]
pub struct Decoder {
    reconstruction: Option<Reconstruction>,
}

impl Decoder {
    /// Creates an idle decoder.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while attachments are pending.
    #[inline]
    #[must_use]
    pub fn is_reconstructing(&self) -> bool {
        self.reconstruction.is_some()
    }

    /// Drops any partially reconstructed packet.
    pub fn reset(&mut self) {
        if self.reconstruction.take().is_some() {
            debug!("Discarded partial binary packet");
        }
    }

    /// Feeds one frame.
    ///
    /// Returns the completed packet, or `None` while attachments are still
    /// expected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolDecode`] for text while reconstructing or
    /// binary while idle, and [`Error::IllegalAttachments`] when a
    /// placeholder is out of range.
    pub fn add(&mut self, data: Data) -> Result<Option<Packet>> {
        match data {
            Data::Text(text) => {
                if self.reconstruction.is_some() {
                    return Err(Error::protocol_decode(
                        "got plaintext data when reconstructing a packet",
                    ));
                }
                self.add_text(&text)
            }
            Data::Binary(bytes) => {
                let Some(reconstruction) = self.reconstruction.as_mut() else {
                    return Err(Error::protocol_decode(
                        "got binary data when not reconstructing a packet",
                    ));
                };
                reconstruction.buffers.push(bytes);
                if reconstruction.buffers.len() < reconstruction.header.attachments {
                    return Ok(None);
                }
                match self.reconstruction.take() {
                    Some(Reconstruction { header, buffers }) => finish(header, &buffers).map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    fn add_text(&mut self, text: &str) -> Result<Option<Packet>> {
        let header = match decode_header(text) {
            HeaderResult::Header(header) => header,
            HeaderResult::Invalid(message) => {
                debug!(%message, "Undecodable packet header");
                return Ok(Some(Packet::parser_error(&message)));
            }
        };

        if header.kind.is_binary() && header.attachments > 0 {
            trace!(attachments = header.attachments, "Awaiting attachments");
            self.reconstruction = Some(Reconstruction {
                header,
                buffers: Vec::new(),
            });
            return Ok(None);
        }

        finish(header, &[]).map(Some)
    }
}

fn finish(mut header: Header, buffers: &[Vec<u8>]) -> Result<Packet> {
    let data = header
        .json
        .take()
        .map(|json| reconstruct(json, buffers))
        .transpose()?;
    Ok(header.into_packet(data))
}

// ============================================================================
// Tests
// ============================================================================
