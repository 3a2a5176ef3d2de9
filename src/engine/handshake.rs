//! Handshake payload carried by the first `open` frame.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::protocol::Data;
use crate::transport::TransportKind;

/// Session parameters announced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Session id.
    pub sid: SessionId,
    /// Transports the session may upgrade to.
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between client pings.
    pub ping_interval: u64,
    /// Milliseconds to wait for a pong.
    pub ping_timeout: u64,
}

impl Handshake {
    /// Parses the body of an `open` frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the body is missing, binary, or not
    /// a valid handshake object.
    pub fn parse(data: Option<&Data>) -> Result<Self> {
        let text = data
            .and_then(Data::as_text)
            .ok_or_else(|| Error::handshake("missing handshake payload"))?;
        serde_json::from_str(text).map_err(|e| Error::handshake(e.to_string()))
    }

    /// Returns the ping interval.
    #[inline]
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval)
    }

    /// Returns the pong deadline.
    #[inline]
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout)
    }

    /// Returns advertised upgrades that are also in `allowed`, in server
    /// order. Unknown names are skipped.
    #[must_use]
    pub fn filter_upgrades(&self, allowed: &[TransportKind]) -> Vec<TransportKind> {
        self.upgrades
            .iter()
            .filter_map(|name| name.parse::<TransportKind>().ok())
            .filter(|kind| allowed.contains(kind))
            .collect()
    }
}
