//! Session-level packet codec.
//!
//! Every frame is `<kind-digit><payload>` on text channels or
//! `<kind-byte><payload-bytes>` on binary channels. Binary payloads on a
//! text-only channel are sent as `b<kind-digit><base64>`.
//!
//! Non-streaming transports (long-polling) batch several frames per HTTP
//! body:
//!
//! | Batch | Layout per frame |
//! |-------|------------------|
//! | Text | `<byteLength>:<frame>` |
//! | Binary | `<0|1><len digits as bytes>0xFF<frame bytes>` |
//!
//! Batch decoding stops at the first malformed frame and reports it as an
//! `Err` entry; frames decoded before it are kept.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{Error, Result};

use super::Data;

// ============================================================================
// Constants
// ============================================================================

/// Prefix marking a base64-encoded binary frame on a text channel.
const BASE64_PREFIX: char = 'b';

/// Terminator of a binary batch length header.
const LENGTH_TERMINATOR: u8 = 0xFF;

/// Longest accepted length header, in digits.
const MAX_LENGTH_DIGITS: usize = 310;

/// Payload of the upgrade probe ping/pong pair.
pub const PROBE: &str = "probe";

// ============================================================================
// SessionPacketKind
// ============================================================================

/// Session frame kind, encoded as a single digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPacketKind {
    /// Handshake from the server.
    Open,
    /// Session close.
    Close,
    /// Heartbeat request.
    Ping,
    /// Heartbeat reply.
    Pong,
    /// Application data.
    Message,
    /// Transport switch confirmation.
    Upgrade,
    /// No operation.
    Noop,
}

impl SessionPacketKind {
    /// All kinds, ordered by wire code.
    pub const ALL: [Self; 7] = [
        Self::Open,
        Self::Close,
        Self::Ping,
        Self::Pong,
        Self::Message,
        Self::Upgrade,
        Self::Noop,
    ];

    /// Returns the wire code.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Close => 1,
            Self::Ping => 2,
            Self::Pong => 3,
            Self::Message => 4,
            Self::Upgrade => 5,
            Self::Noop => 6,
        }
    }

    /// Looks a kind up by wire code.
    #[inline]
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    /// Returns the protocol name of the kind.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Message => "message",
            Self::Upgrade => "upgrade",
            Self::Noop => "noop",
        }
    }

    /// Parses the digit at the head of a text frame.
    fn from_digit(c: char) -> Option<Self> {
        c.to_digit(10)
            .and_then(|d| u8::try_from(d).ok())
            .and_then(Self::from_code)
    }
}

impl fmt::Display for SessionPacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SessionPacket
// ============================================================================

/// One session frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPacket {
    /// Frame kind.
    pub kind: SessionPacketKind,
    /// Optional text or binary payload.
    pub data: Option<Data>,
}

impl SessionPacket {
    /// Creates a frame without payload.
    #[inline]
    #[must_use]
    pub const fn new(kind: SessionPacketKind) -> Self {
        Self { kind, data: None }
    }

    /// Creates a frame with a payload.
    #[inline]
    #[must_use]
    pub fn with_data(kind: SessionPacketKind, data: impl Into<Data>) -> Self {
        Self {
            kind,
            data: Some(data.into()),
        }
    }

    /// Creates a `message` frame.
    #[inline]
    #[must_use]
    pub fn message(data: impl Into<Data>) -> Self {
        Self::with_data(SessionPacketKind::Message, data)
    }

    /// Returns the payload as text, if it is text.
    #[inline]
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.data.as_ref().and_then(Data::as_text)
    }

    /// Returns `true` if this is the given kind carrying the probe marker.
    #[inline]
    #[must_use]
    pub fn is_probe(&self, kind: SessionPacketKind) -> bool {
        self.kind == kind && self.text() == Some(PROBE)
    }
}

// ============================================================================
// Single Frame Encoding
// ============================================================================

/// Encodes one frame.
///
/// Binary payloads become a binary frame when `supports_binary` is set,
/// otherwise a `b`-prefixed base64 text frame.
#[must_use]
pub fn encode_packet(packet: &SessionPacket, supports_binary: bool) -> Data {
    let code = packet.kind.code();
    match &packet.data {
        Some(Data::Binary(bytes)) if supports_binary => {
            let mut frame = Vec::with_capacity(bytes.len() + 1);
            frame.push(code);
            frame.extend_from_slice(bytes);
            Data::Binary(frame)
        }
        Some(Data::Binary(bytes)) => {
            Data::Text(format!("{BASE64_PREFIX}{code}{}", BASE64.encode(bytes)))
        }
        Some(Data::Text(text)) => Data::Text(format!("{code}{text}")),
        None => Data::Text(code.to_string()),
    }
}

// ============================================================================
// Single Frame Decoding
// ============================================================================

/// Decodes one frame of either representation.
///
/// # Errors
///
/// Returns [`Error::ProtocolDecode`] for an empty frame or unknown kind,
/// [`Error::Base64`] for a broken base64 body.
pub fn decode_packet(data: &Data) -> Result<SessionPacket> {
    match data {
        Data::Text(text) => decode_text(text),
        Data::Binary(bytes) => decode_binary(bytes),
    }
}

/// Decodes a text frame.
fn decode_text(frame: &str) -> Result<SessionPacket> {
    let mut chars = frame.chars();
    let head = chars
        .next()
        .ok_or_else(|| Error::protocol_decode("empty frame"))?;

    if head == BASE64_PREFIX {
        let kind = chars
            .next()
            .and_then(SessionPacketKind::from_digit)
            .ok_or_else(|| Error::protocol_decode("invalid base64 frame kind"))?;
        let bytes = BASE64.decode(chars.as_str())?;
        return Ok(SessionPacket::with_data(kind, bytes));
    }

    let kind = SessionPacketKind::from_digit(head)
        .ok_or_else(|| Error::protocol_decode(format!("unknown frame kind '{head}'")))?;
    let rest = chars.as_str();

    if rest.is_empty() && kind != SessionPacketKind::Message {
        Ok(SessionPacket::new(kind))
    } else {
        Ok(SessionPacket::with_data(kind, rest))
    }
}

/// Decodes a binary frame.
fn decode_binary(frame: &[u8]) -> Result<SessionPacket> {
    let (&code, rest) = frame
        .split_first()
        .ok_or_else(|| Error::protocol_decode("empty binary frame"))?;
    let kind = SessionPacketKind::from_code(code)
        .ok_or_else(|| Error::protocol_decode(format!("unknown binary frame kind {code}")))?;
    Ok(SessionPacket::with_data(kind, rest.to_vec()))
}

// ============================================================================
// Batch Encoding
// ============================================================================

/// Encodes a batch for a non-streaming transport.
#[must_use]
pub fn encode_payload(packets: &[SessionPacket], supports_binary: bool) -> Data {
    if supports_binary {
        Data::Binary(encode_payload_as_binary(packets))
    } else {
        Data::Text(encode_payload_as_text(packets))
    }
}

/// Encodes a batch as `<len>:<frame>` pairs.
#[must_use]
pub fn encode_payload_as_text(packets: &[SessionPacket]) -> String {
    if packets.is_empty() {
        return "0:".to_string();
    }

    let mut out = String::new();
    for packet in packets {
        // Text encoding never yields a binary frame.
        if let Data::Text(frame) = encode_packet(packet, false) {
            out.push_str(&frame.len().to_string());
            out.push(':');
            out.push_str(&frame);
        }
    }
    out
}

/// Encodes a batch with binary length headers.
#[must_use]
pub fn encode_payload_as_binary(packets: &[SessionPacket]) -> Vec<u8> {
    let mut out = Vec::new();
    for packet in packets {
        let (flag, bytes) = match encode_packet(packet, true) {
            Data::Text(text) => (0u8, text.into_bytes()),
            Data::Binary(bytes) => (1u8, bytes),
        };

        out.push(flag);
        out.extend(bytes.len().to_string().bytes().map(|digit| digit - b'0'));
        out.push(LENGTH_TERMINATOR);
        out.extend_from_slice(&bytes);
    }
    out
}

// ============================================================================
// Batch Decoding
// ============================================================================

/// Decodes a batch produced by [`encode_payload`].
///
/// Decoding stops at the first malformed frame, which is reported as the
/// final `Err` entry.
#[must_use]
pub fn decode_payload(data: &Data) -> Vec<Result<SessionPacket>> {
    match data {
        Data::Text(text) => decode_payload_as_text(text),
        Data::Binary(bytes) => decode_payload_as_binary(bytes),
    }
}

/// Decodes a `<len>:<frame>` batch.
fn decode_payload_as_text(data: &str) -> Vec<Result<SessionPacket>> {
    let mut packets = Vec::new();
    if data.is_empty() {
        packets.push(Err(Error::protocol_decode("empty payload")));
        return packets;
    }

    let mut rest = data;
    while !rest.is_empty() {
        let Some(colon) = rest.find(':') else {
            packets.push(Err(Error::protocol_decode("missing length separator")));
            break;
        };

        let length = match rest[..colon].parse::<usize>() {
            Ok(length) if colon > 0 => length,
            _ => {
                packets.push(Err(Error::protocol_decode(format!(
                    "invalid length prefix '{}'",
                    &rest[..colon]
                ))));
                break;
            }
        };

        let body = &rest[colon + 1..];
        let Some(frame) = body.get(..length) else {
            packets.push(Err(Error::protocol_decode(format!(
                "declared length {length} exceeds {} available bytes",
                body.len()
            ))));
            break;
        };

        if !frame.is_empty() {
            match decode_text(frame) {
                Ok(packet) => packets.push(Ok(packet)),
                Err(e) => {
                    packets.push(Err(e));
                    break;
                }
            }
        }

        rest = &body[length..];
    }

    packets
}

/// Decodes a binary-header batch.
fn decode_payload_as_binary(data: &[u8]) -> Vec<Result<SessionPacket>> {
    let mut packets = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        match split_binary_frame(rest) {
            Ok((frame, tail)) => {
                let decoded = match frame {
                    BinaryBatchFrame::Text(text) => decode_text(text),
                    BinaryBatchFrame::Binary(bytes) => decode_binary(bytes),
                };
                let failed = decoded.is_err();
                packets.push(decoded);
                if failed {
                    break;
                }
                rest = tail;
            }
            Err(e) => {
                packets.push(Err(e));
                break;
            }
        }
    }

    packets
}

/// A frame sliced out of a binary batch.
enum BinaryBatchFrame<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

/// Splits the first frame off a binary batch.
fn split_binary_frame(data: &[u8]) -> Result<(BinaryBatchFrame<'_>, &[u8])> {
    let is_text = match data[0] {
        0 => true,
        1 => false,
        other => {
            return Err(Error::protocol_decode(format!(
                "invalid frame type marker {other}"
            )));
        }
    };

    let header = &data[1..];
    let terminator = header
        .iter()
        .take(MAX_LENGTH_DIGITS + 1)
        .position(|&b| b == LENGTH_TERMINATOR)
        .ok_or_else(|| Error::protocol_decode("unterminated length header"))?;

    let digits = &header[..terminator];
    if digits.is_empty() || digits.iter().any(|&d| d > 9) {
        return Err(Error::protocol_decode("invalid length header"));
    }

    let length = digits
        .iter()
        .try_fold(0usize, |acc, &d| {
            acc.checked_mul(10)?.checked_add(usize::from(d))
        })
        .ok_or_else(|| Error::protocol_decode("length header overflow"))?;

    let body = &header[terminator + 1..];
    if body.len() < length {
        return Err(Error::protocol_decode(format!(
            "declared length {length} exceeds {} available bytes",
            body.len()
        )));
    }

    let (frame, tail) = body.split_at(length);
    let frame = if is_text {
        let text = std::str::from_utf8(frame)
            .map_err(|e| Error::protocol_decode(format!("invalid utf-8 frame: {e}")))?;
        BinaryBatchFrame::Text(text)
    } else {
        BinaryBatchFrame::Binary(frame)
    };

    Ok((frame, tail))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    fn ok_packets(results: Vec<Result<SessionPacket>>) -> Vec<SessionPacket> {
        results
            .into_iter()
            .map(|r| r.expect("frame should decode"))
            .collect()
    }

    #[test]
    fn test_encode_text_frames() {
        let ping = SessionPacket::with_data(SessionPacketKind::Ping, PROBE);
        assert_eq!(encode_packet(&ping, true), Data::Text("2probe".into()));

        let upgrade = SessionPacket::new(SessionPacketKind::Upgrade);
        assert_eq!(encode_packet(&upgrade, false), Data::Text("5".into()));
    }

    #[test]
    fn test_encode_binary_frame() {
        let packet = SessionPacket::message(vec![1u8, 2, 3]);
        assert_eq!(encode_packet(&packet, true), Data::Binary(vec![4, 1, 2, 3]));
    }

    #[test]
    fn test_encode_binary_as_base64() {
        let packet = SessionPacket::message(vec![1u8, 2, 3]);
        assert_eq!(encode_packet(&packet, false), Data::Text("b4AQID".into()));

        let decoded = decode_packet(&Data::Text("b4AQID".into())).expect("decode");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_decode_without_payload() {
        let decoded = decode_packet(&Data::Text("3".into())).expect("decode");
        assert_eq!(decoded, SessionPacket::new(SessionPacketKind::Pong));
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let err = decode_packet(&Data::Text("9hello".into())).unwrap_err();
        assert!(err.is_decode_error());

        let err = decode_packet(&Data::Binary(vec![42, 1])).unwrap_err();
        assert!(err.is_decode_error());
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert!(decode_packet(&Data::Text(String::new())).is_err());
        assert!(decode_packet(&Data::Binary(Vec::new())).is_err());
    }

    #[test]
    fn test_text_batch_layout() {
        let packets = vec![
            SessionPacket::message("hello"),
            SessionPacket::new(SessionPacketKind::Ping),
        ];
        assert_eq!(encode_payload_as_text(&packets), "6:4hello1:2");
    }

    #[test]
    fn test_text_batch_counts_bytes() {
        let packets = vec![SessionPacket::message("é")];
        let encoded = encode_payload_as_text(&packets);
        assert_eq!(encoded, "3:4é");

        let decoded = ok_packets(decode_payload(&Data::Text(encoded)));
        assert_eq!(decoded, packets);
    }

    #[test]
    fn test_empty_batch() {
        assert_eq!(encode_payload_as_text(&[]), "0:");
        assert!(decode_payload(&Data::Text("0:".into())).is_empty());
        assert!(encode_payload_as_binary(&[]).is_empty());
    }

    #[test]
    fn test_text_batch_round_trip() {
        let packets = vec![
            SessionPacket::message("2[\"chat\",\"hi\"]"),
            SessionPacket::message(vec![0u8, 255, 7]),
            SessionPacket::new(SessionPacketKind::Noop),
        ];
        let encoded = encode_payload(&packets, false);
        assert_eq!(ok_packets(decode_payload(&encoded)), packets);
    }

    #[test]
    fn test_binary_batch_layout() {
        let packets = vec![SessionPacket::message("hi")];
        assert_eq!(
            encode_payload_as_binary(&packets),
            vec![0, 3, LENGTH_TERMINATOR, b'4', b'h', b'i']
        );
    }

    #[test]
    fn test_binary_batch_round_trip() {
        let packets = vec![
            SessionPacket::message("hello"),
            SessionPacket::message(vec![9u8; 12]),
            SessionPacket::with_data(SessionPacketKind::Ping, PROBE),
        ];
        let encoded = encode_payload(&packets, true);
        assert!(encoded.is_binary());
        assert_eq!(ok_packets(decode_payload(&encoded)), packets);
    }

    #[test]
    fn test_truncated_text_batch_yields_error() {
        let packets = vec![
            SessionPacket::message("first"),
            SessionPacket::message("second"),
        ];
        let mut encoded = encode_payload_as_text(&packets);
        encoded.pop();

        let decoded = decode_payload(&Data::Text(encoded));
        assert_eq!(decoded.len(), 2);
        assert_eq!(
            decoded[0].as_ref().expect("first frame"),
            &SessionPacket::message("first")
        );
        assert!(decoded[1].as_ref().unwrap_err().is_decode_error());
    }

    #[test]
    fn test_malformed_length_prefix() {
        let decoded = decode_payload(&Data::Text("x:4hi".into()));
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].is_err());

        let decoded = decode_payload(&Data::Text(":4hi".into()));
        assert!(decoded[0].is_err());

        let decoded = decode_payload(&Data::Text("3:4hi7".into()));
        assert_eq!(decoded.len(), 2);
        assert!(decoded[1].is_err());
    }

    #[test]
    fn test_length_inside_multibyte_char() {
        let decoded = decode_payload(&Data::Text("2:4é".into()));
        assert!(decoded[0].is_err());
    }

    #[test]
    fn test_truncated_binary_batch_yields_error() {
        let packets = vec![SessionPacket::message(vec![1u8, 2, 3, 4])];
        let mut encoded = encode_payload_as_binary(&packets);
        encoded.pop();

        let decoded = decode_payload(&Data::Binary(encoded));
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].as_ref().unwrap_err().is_decode_error());
    }

    #[test]
    fn test_binary_batch_rejects_bad_header() {
        assert!(decode_payload(&Data::Binary(vec![2, 1, LENGTH_TERMINATOR, 4]))[0].is_err());
        assert!(decode_payload(&Data::Binary(vec![0, 12, LENGTH_TERMINATOR, 4]))[0].is_err());
        assert!(decode_payload(&Data::Binary(vec![0; MAX_LENGTH_DIGITS + 4]))[0].is_err());
    }

    fn arb_packet() -> impl Strategy<Value = SessionPacket> {
        let kind = (0u8..7).prop_map(|code| {
            SessionPacketKind::from_code(code).expect("valid code")
        });
        let data = prop_oneof![
            Just(None),
            "[^\u{0}]{0,24}".prop_map(|s| Some(Data::Text(s))),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(|b| Some(Data::Binary(b))),
        ];
        (kind, data).prop_map(|(kind, data)| canonical(SessionPacket { kind, data }))
    }

    /// An empty text body and no body share one encoding: messages always
    /// decode with text, other kinds without.
    fn canonical(packet: SessionPacket) -> SessionPacket {
        let is_message = packet.kind == SessionPacketKind::Message;
        let empty = packet.data.as_ref().is_none_or(|data| data.as_text() == Some(""));
        match (is_message, empty) {
            (true, true) => SessionPacket::message(""),
            (false, true) => SessionPacket::new(packet.kind),
            _ => packet,
        }
    }

    #[test]
    fn test_empty_message_keeps_text_body() {
        let packet = SessionPacket::message("");
        let encoded = encode_packet(&packet, false);
        assert_eq!(encoded, Data::Text("4".to_string()));
        assert_eq!(decode_packet(&encoded).expect("decode"), packet);

        let ping = decode_packet(&Data::Text("2".to_string())).expect("decode");
        assert_eq!(ping, SessionPacket::new(SessionPacketKind::Ping));
    }

    proptest! {
        #[test]
        fn prop_frame_round_trip(packet in arb_packet(), supports_binary in any::<bool>()) {
            let decoded = decode_packet(&encode_packet(&packet, supports_binary))
                .expect("round trip");
            prop_assert_eq!(decoded, packet);
        }

        #[test]
        fn prop_batch_round_trip(
            packets in prop::collection::vec(arb_packet(), 1..8),
            supports_binary in any::<bool>(),
        ) {
            let decoded: Vec<SessionPacket> = decode_payload(&encode_payload(&packets, supports_binary))
                .into_iter()
                .collect::<Result<_>>()
                .expect("round trip");
            prop_assert_eq!(decoded, packets);
        }
    }
}
