//! Byte transports carrying session frames.
//!
//! A transport is a duplex channel with an open/close lifecycle. The
//! engine drives it through the synchronous [`Transport`] trait; every
//! asynchronous outcome is reported back as a [`TransportEvent`] on the
//! channel handed to the [`TransportFactory`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   open / send / pause / close   ┌───────────────────┐
//! │ Engine actor │ ───────────────────────────────►│ Box<dyn Transport>│
//! │              │◄─────────────────────────────── │  (spawned I/O)    │
//! └──────────────┘   TransportEvent (mpsc)         └───────────────────┘
//! ```
//!
//! # Contract
//!
//! - `Packet` is never emitted before `Open`.
//! - After `close()`, no further `Packet` or `Drain` is emitted.
//! - `send()` is only valid while the transport reports writable.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `polling` | HTTP long-polling over an injected [`HttpClient`] |
//! | `websocket` | WebSocket via tokio-tungstenite |

// ============================================================================
// Submodules
// ============================================================================

/// HTTP long-polling transport.
pub mod polling;

/// WebSocket transport.
pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::SessionPacket;

// ============================================================================
// Re-exports
// ============================================================================

pub use polling::{HttpClient, HttpResponse, PollingTransport, ReqwestHttpClient};
pub use websocket::WebSocketTransport;

// ============================================================================
// TransportKind
// ============================================================================

/// Transport variant, named as in the `transport` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// HTTP long-polling.
    Polling,
    /// WebSocket.
    WebSocket,
}

impl TransportKind {
    /// Returns the protocol name.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "polling" => Ok(Self::Polling),
            "websocket" => Ok(Self::WebSocket),
            other => Err(Error::config(format!("unknown transport '{other}'"))),
        }
    }
}

// ============================================================================
// TransportEvent
// ============================================================================

/// Notification from a transport to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// Channel established.
    Open,
    /// One decoded session frame.
    Packet(SessionPacket),
    /// Previous `send` fully written.
    Drain,
    /// `pause` completed; no reads or writes are in flight.
    Paused,
    /// I/O or decode failure.
    Error(Error),
    /// Channel closed.
    Close,
}

/// Sending half of a transport's event channel.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of a transport's event channel.
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

// ============================================================================
// Transport
// ============================================================================

/// Capability interface of a byte transport.
///
/// All methods return immediately; I/O runs on spawned tasks and reports
/// through [`TransportEvent`]s.
pub trait Transport: Send {
    /// Returns the transport variant.
    fn kind(&self) -> TransportKind;

    /// Returns `true` if frames may carry raw bytes.
    fn supports_binary(&self) -> bool;

    /// Returns `true` if the transport can pause for an upgrade.
    fn supports_pause(&self) -> bool {
        false
    }

    /// Returns `true` if `send` may be called.
    fn is_writable(&self) -> bool;

    /// Begins connecting.
    fn open(&mut self);

    /// Writes a batch of frames.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the transport is not open.
    fn send(&mut self, packets: Vec<SessionPacket>) -> Result<()>;

    /// Stops reading and writing; emits [`TransportEvent::Paused`] once idle.
    fn pause(&mut self) {}

    /// Undoes a `pause`.
    fn resume(&mut self) {}

    /// Records the session id for subsequent requests.
    fn set_session_id(&mut self, sid: &SessionId);

    /// Closes the channel.
    fn close(&mut self);
}

// ============================================================================
// TransportFactory
// ============================================================================

/// Constructs transports for the engine.
pub trait TransportFactory: Send + Sync {
    /// Creates a transport reporting to `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the variant cannot be constructed.
    fn create(
        &self,
        kind: TransportKind,
        options: TransportOptions,
        events: TransportEventSender,
    ) -> Result<Box<dyn Transport>>;
}

/// Factory for the built-in WebSocket and polling transports.
#[derive(Clone)]
pub struct DefaultTransportFactory {
    http: Arc<dyn HttpClient>,
}

impl DefaultTransportFactory {
    /// Creates a factory with a reqwest-backed polling client.
    #[must_use]
    pub fn new() -> Self {
        Self::with_http_client(Arc::new(ReqwestHttpClient::new()))
    }

    /// Creates a factory with a custom polling client.
    #[must_use]
    pub fn with_http_client(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }
}

impl Default for DefaultTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DefaultTransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultTransportFactory").finish_non_exhaustive()
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        kind: TransportKind,
        options: TransportOptions,
        events: TransportEventSender,
    ) -> Result<Box<dyn Transport>> {
        Ok(match kind {
            TransportKind::Polling => Box::new(PollingTransport::new(
                options,
                Arc::clone(&self.http),
                events,
            )),
            TransportKind::WebSocket => Box::new(WebSocketTransport::new(options, events)),
        })
    }
}

// ============================================================================
// TransportOptions
// ============================================================================

/// Connection parameters handed to each transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Server host name or address.
    pub hostname: String,
    /// Server port; `None` uses the scheme default.
    pub port: Option<u16>,
    /// Use TLS schemes (`https`/`wss`).
    pub secure: bool,
    /// Request path, ending with `/`.
    pub path: String,
    /// Ordered query parameters.
    pub query: Vec<(String, String)>,
    /// Append a timestamp token; `None` uses the transport default.
    pub timestamp_requests: Option<bool>,
    /// Name of the timestamp parameter.
    pub timestamp_param: String,
    /// Never send raw binary frames.
    pub force_base64: bool,
    /// Extra request headers.
    pub extra_headers: Vec<(String, String)>,
}

impl TransportOptions {
    /// Sets a query parameter, replacing an existing value.
    pub fn set_query(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.query.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.query.push((key.to_string(), value)),
        }
    }

    /// Returns a query parameter.
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Builds the request URI for `kind`.
    ///
    /// The port is omitted when it is the scheme default; IPv6 hosts are
    /// bracketed.
    #[must_use]
    pub fn uri(&self, kind: TransportKind, supports_binary: bool, timestamp: Option<&str>) -> String {
        let scheme = match (kind, self.secure) {
            (TransportKind::Polling, false) => "http",
            (TransportKind::Polling, true) => "https",
            (TransportKind::WebSocket, false) => "ws",
            (TransportKind::WebSocket, true) => "wss",
        };
        let default_port = if self.secure { 443 } else { 80 };

        let port = match self.port {
            Some(port) if port != default_port => format!(":{port}"),
            _ => String::new(),
        };

        let host = if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        };

        let mut query = self.query.clone();
        if let Some(token) = timestamp {
            query.retain(|(k, _)| k != &self.timestamp_param);
            query.push((self.timestamp_param.clone(), token.to_string()));
        }
        if !supports_binary {
            query.push(("b64".to_string(), "1".to_string()));
        }

        let query = encode_query(&query);
        let separator = if query.is_empty() { "" } else { "?" };

        format!("{scheme}://{host}{port}{}{separator}{query}", self.path)
    }
}

/// Percent-encodes ordered query pairs.
#[must_use]
pub fn encode_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ============================================================================
// Timestamp
// ============================================================================

/// Alphabet of the timestamp token.
const TIMESTAMP_ALPHABET: &[u8; 64] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-_";

/// Anti-caching token generator.
///
/// Encodes the current millisecond time in a base-64 alphabet; repeated
/// calls within the same millisecond append `.<seed>`.
#[derive(Debug, Default)]
pub struct Timestamp {
    prev: String,
    seed: u64,
}

impl Timestamp {
    /// Creates a generator.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token for the current time.
    pub fn next(&mut self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self.next_at(millis)
    }

    /// Returns the token for `millis`.
    pub fn next_at(&mut self, millis: u64) -> String {
        let now = Self::encode(millis);
        if now != self.prev {
            self.seed = 0;
            self.prev.clone_from(&now);
            return now;
        }
        let seed = self.seed;
        self.seed += 1;
        format!("{now}.{}", Self::encode(seed))
    }

    /// Encodes a number in the token alphabet.
    #[must_use]
    pub fn encode(mut value: u64) -> String {
        let mut digits = Vec::new();
        loop {
            digits.push(TIMESTAMP_ALPHABET[(value % 64) as usize]);
            value /= 64;
            if value == 0 {
                break;
            }
        }
        digits.reverse();
        String::from_utf8_lossy(&digits).into_owned()
    }

    /// Decodes a token produced by [`Timestamp::encode`].
    #[must_use]
    pub fn decode(token: &str) -> Option<u64> {
        token.bytes().try_fold(0u64, |acc, b| {
            let digit = TIMESTAMP_ALPHABET.iter().position(|&c| c == b)?;
            acc.checked_mul(64)?.checked_add(digit as u64)
        })
    }
}

// ============================================================================
// TransportMemory
// ============================================================================

/// Whether a WebSocket session last succeeded.
///
/// Shared by every engine a manager creates; with `remember_upgrade` the
/// next engine starts on WebSocket directly.
#[derive(Debug, Clone, Default)]
pub struct TransportMemory(Arc<AtomicBool>);

impl TransportMemory {
    /// Creates an empty memory.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if WebSocket last succeeded.
    #[inline]
    #[must_use]
    pub fn prior_websocket_success(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Records the outcome.
    #[inline]
    pub fn set_prior_websocket_success(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> TransportOptions {
        TransportOptions {
            hostname: "example.com".to_string(),
            port: Some(80),
            secure: false,
            path: "/socket.io/".to_string(),
            query: vec![
                ("EIO".to_string(), "3".to_string()),
                ("transport".to_string(), "polling".to_string()),
            ],
            timestamp_requests: None,
            timestamp_param: "t".to_string(),
            force_base64: false,
            extra_headers: Vec::new(),
        }
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [TransportKind::Polling, TransportKind::WebSocket] {
            assert_eq!(kind.as_str().parse::<TransportKind>().expect("parse"), kind);
        }
        assert!("jsonp".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_uri_default_port_omitted() {
        let uri = options().uri(TransportKind::Polling, true, None);
        assert_eq!(uri, "http://example.com/socket.io/?EIO=3&transport=polling");
    }

    #[test]
    fn test_uri_custom_port_and_flags() {
        let mut opts = options();
        opts.port = Some(3000);
        opts.set_query("sid", "abc");
        let uri = opts.uri(TransportKind::WebSocket, false, Some("Mxyz"));
        assert_eq!(
            uri,
            "ws://example.com:3000/socket.io/?EIO=3&transport=polling&sid=abc&t=Mxyz&b64=1"
        );
    }

    #[test]
    fn test_uri_secure_ipv6() {
        let mut opts = options();
        opts.secure = true;
        opts.port = Some(443);
        opts.hostname = "::1".to_string();
        let uri = opts.uri(TransportKind::WebSocket, true, None);
        assert!(uri.starts_with("wss://[::1]/socket.io/?"));
    }

    #[test]
    fn test_query_encoding() {
        let pairs = vec![("token".to_string(), "a b&c".to_string())];
        assert_eq!(encode_query(&pairs), "token=a%20b%26c");
    }

    #[test]
    fn test_set_query_replaces() {
        let mut opts = options();
        opts.set_query("transport", "websocket");
        assert_eq!(opts.query_value("transport"), Some("websocket"));
        assert_eq!(opts.query.len(), 2);
    }

    #[test]
    fn test_timestamp_encoding() {
        assert_eq!(Timestamp::encode(0), "0");
        assert_eq!(Timestamp::encode(64), "10");
        let encoded = Timestamp::encode(1_700_000_000_000);
        assert_eq!(Timestamp::decode(&encoded), Some(1_700_000_000_000));
    }

    #[test]
    fn test_timestamp_seed_within_same_millisecond() {
        let mut ts = Timestamp::new();
        let first = ts.next_at(1000);
        assert_eq!(ts.next_at(1000), format!("{first}.0"));
        assert_eq!(ts.next_at(1000), format!("{first}.1"));
        assert_eq!(ts.next_at(1001), Timestamp::encode(1001));
    }

    #[test]
    fn test_transport_memory_shared() {
        let memory = TransportMemory::new();
        let clone = memory.clone();
        clone.set_prior_websocket_success(true);
        assert!(memory.prior_websocket_success());
    }
}
