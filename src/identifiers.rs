//! Type-safe identifiers.
//!
//! Newtype wrappers keep the server-assigned session id and the
//! per-namespace acknowledgement ids from being mixed with plain strings
//! and integers.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// SessionId
// ============================================================================

/// Session id assigned by the server in the `Open` handshake (`sid`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps a raw session id.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// AckId
// ============================================================================

/// Acknowledgement id carried by `Event`/`Ack` packets.
///
/// Unique within one namespace socket, allocated in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AckId(u64);

impl AckId {
    /// Creates an ack id from its wire value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the wire value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns this id and advances the counter.
    #[inline]
    pub fn post_increment(&mut self) -> Self {
        let current = *self;
        self.0 += 1;
        current
    }
}

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        let sid = SessionId::new("abc");
        assert_eq!(sid.to_string(), "abc");
        assert_eq!(sid.as_str(), "abc");
    }

    #[test]
    fn test_session_id_serde_transparent() {
        let sid: SessionId = serde_json::from_str("\"xyz\"").expect("deserialize");
        assert_eq!(sid, SessionId::from("xyz"));
    }

    #[test]
    fn test_ack_id_post_increment() {
        let mut counter = AckId::new(0);
        assert_eq!(counter.post_increment(), AckId::new(0));
        assert_eq!(counter.post_increment(), AckId::new(1));
        assert_eq!(counter.as_u64(), 2);
    }
}
