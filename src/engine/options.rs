//! Engine connection options.
//!
//! # Example
//!
//! ```ignore
//! use sockio::engine::EngineOptions;
//! use sockio::transport::TransportKind;
//!
//! let options = EngineOptions::from_uri("https://chat.example.com")?
//!     .with_path("/socket.io")
//!     .with_query("token", "abc")
//!     .with_transports([TransportKind::WebSocket]);
//! ```

// ============================================================================
// Imports
// ============================================================================

use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::PROTOCOL_VERSION;
use crate::transport::{TransportKind, TransportOptions};

// ============================================================================
// Constants
// ============================================================================

/// Default engine request path.
pub const DEFAULT_PATH: &str = "/engine.io";

/// Default timestamp query parameter.
pub const DEFAULT_TIMESTAMP_PARAM: &str = "t";

// ============================================================================
// EngineOptions
// ============================================================================

/// Configuration for one engine session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Server host name or address.
    pub hostname: String,

    /// Server port; `None` uses the scheme default.
    pub port: Option<u16>,

    /// Use `https`/`wss`.
    pub secure: bool,

    /// Request path, always ending with `/`.
    pub path: String,

    /// Caller-supplied query parameters, in order.
    pub query: Vec<(String, String)>,

    /// Transports to try, in preference order.
    pub transports: Vec<TransportKind>,

    /// Probe for better transports after the handshake.
    pub upgrade: bool,

    /// Start on WebSocket if it succeeded last time.
    pub remember_upgrade: bool,

    /// Reject upgrades that would lose binary support.
    pub only_binary_upgrades: bool,

    /// Never send raw binary frames.
    pub force_base64: bool,

    /// Append a timestamp token; `None` uses each transport's default.
    pub timestamp_requests: Option<bool>,

    /// Name of the timestamp parameter.
    pub timestamp_param: String,

    /// Extra request headers.
    pub extra_headers: Vec<(String, String)>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl EngineOptions {
    /// Creates options for `localhost` with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: None,
            secure: false,
            path: normalize_path(DEFAULT_PATH),
            query: Vec::new(),
            transports: vec![TransportKind::Polling, TransportKind::WebSocket],
            upgrade: true,
            remember_upgrade: false,
            only_binary_upgrades: false,
            force_base64: false,
            timestamp_requests: None,
            timestamp_param: DEFAULT_TIMESTAMP_PARAM.to_string(),
            extra_headers: Vec::new(),
        }
    }

    /// Creates options from a connection URI.
    ///
    /// Scheme, host, port and query are taken from the URI; the URI path is
    /// not the request path (see [`EngineOptions::with_path`]).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] if the URI does not parse, or
    /// [`Error::Config`] if it has no host.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let mut options = Self::new();
        options.set_uri(&Url::parse(uri)?)?;
        Ok(options)
    }

    /// Applies scheme, host, port and query from a parsed URI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URI has no host.
    pub fn set_uri(&mut self, uri: &Url) -> Result<()> {
        let host = uri
            .host_str()
            .ok_or_else(|| Error::config(format!("URI '{uri}' has no host")))?;

        self.hostname = host.trim_start_matches('[').trim_end_matches(']').to_string();
        self.secure = matches!(uri.scheme(), "https" | "wss");
        self.port = uri.port();
        self.query
            .extend(uri.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())));
        Ok(())
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl EngineOptions {
    /// Sets the host.
    #[inline]
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Sets the port.
    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enables TLS schemes.
    #[inline]
    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets the request path; a trailing `/` is added.
    #[inline]
    #[must_use]
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = normalize_path(path);
        self
    }

    /// Adds a query parameter.
    #[inline]
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets the transport preference list.
    #[inline]
    #[must_use]
    pub fn with_transports(mut self, transports: impl IntoIterator<Item = TransportKind>) -> Self {
        self.transports = transports.into_iter().collect();
        self
    }

    /// Enables or disables upgrade probing.
    #[inline]
    #[must_use]
    pub fn with_upgrade(mut self, upgrade: bool) -> Self {
        self.upgrade = upgrade;
        self
    }

    /// Starts on WebSocket when it succeeded previously.
    #[inline]
    #[must_use]
    pub fn with_remember_upgrade(mut self, remember: bool) -> Self {
        self.remember_upgrade = remember;
        self
    }

    /// Rejects upgrades to transports without binary support.
    #[inline]
    #[must_use]
    pub fn with_only_binary_upgrades(mut self, only_binary: bool) -> Self {
        self.only_binary_upgrades = only_binary;
        self
    }

    /// Forces base64 encoding of binary frames.
    #[inline]
    #[must_use]
    pub fn with_force_base64(mut self, force: bool) -> Self {
        self.force_base64 = force;
        self
    }

    /// Overrides request timestamping.
    #[inline]
    #[must_use]
    pub fn with_timestamp_requests(mut self, enabled: bool) -> Self {
        self.timestamp_requests = Some(enabled);
        self
    }

    /// Adds an extra request header.
    #[inline]
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }
}

// ============================================================================
// Conversion Methods
// ============================================================================

impl EngineOptions {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty host, transport list or
    /// timestamp parameter name.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(Error::config("hostname must not be empty"));
        }
        if self.transports.is_empty() {
            return Err(Error::config("at least one transport is required"));
        }
        if self.timestamp_param.is_empty() {
            return Err(Error::config("timestamp parameter name must not be empty"));
        }
        Ok(())
    }

    /// Returns `true` if `kind` is configured.
    #[inline]
    #[must_use]
    pub fn allows(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }

    /// Builds the options handed to a transport of `kind`.
    #[must_use]
    pub fn transport_options(&self, kind: TransportKind, sid: Option<&SessionId>) -> TransportOptions {
        let mut options = TransportOptions {
            hostname: self.hostname.clone(),
            port: self.port,
            secure: self.secure,
            path: self.path.clone(),
            query: self.query.clone(),
            timestamp_requests: self.timestamp_requests,
            timestamp_param: self.timestamp_param.clone(),
            force_base64: self.force_base64,
            extra_headers: self.extra_headers.clone(),
        };
        options.set_query("EIO", PROTOCOL_VERSION.to_string());
        options.set_query("transport", kind.as_str());
        if let Some(sid) = sid {
            options.set_query("sid", sid.as_str());
        }
        options
    }
}

/// Ensures a single trailing slash.
fn normalize_path(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

// ============================================================================
// Tests
// ============================================================================
