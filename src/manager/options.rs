//! Manager configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use sockio::ManagerOptions;
//!
//! let options = ManagerOptions::new()
//!     .with_reconnection_attempts(5)
//!     .with_reconnection_delay(Duration::from_millis(500))
//!     .with_timeout(Some(Duration::from_secs(10)));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::engine::EngineOptions;
use crate::error::{Error, Result};
use crate::transport::TransportKind;

use super::Backoff;

// ============================================================================
// Constants
// ============================================================================

/// Default request path of the manager's engine.
pub const DEFAULT_PATH: &str = "/socket.io";

/// Default base reconnection delay.
pub const DEFAULT_RECONNECTION_DELAY: Duration = Duration::from_millis(1000);

/// Default reconnection delay cap.
pub const DEFAULT_RECONNECTION_DELAY_MAX: Duration = Duration::from_millis(5000);

/// Default jitter factor.
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

/// Default connection timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(20_000);

// ============================================================================
// ManagerOptions
// ============================================================================

/// Reconnection, timeout and engine settings of a [`Manager`](super::Manager).
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerOptions {
    /// Options for each engine the manager opens.
    pub engine: EngineOptions,

    /// Reconnect after unexpected closes.
    pub reconnection: bool,

    /// Maximum reconnection attempts; `None` is unlimited.
    pub reconnection_attempts: Option<u32>,

    /// Base reconnection delay.
    pub reconnection_delay: Duration,

    /// Reconnection delay cap.
    pub reconnection_delay_max: Duration,

    /// Jitter factor in `[0, 1]`.
    pub randomization_factor: f64,

    /// Connection timeout; `None` disables it.
    pub timeout: Option<Duration>,

    /// Connect as soon as the manager or a socket is created.
    pub auto_connect: bool,

    /// Always create a new manager in [`Client`](crate::client::Client).
    pub force_new: bool,

    /// Share one manager per origin in [`Client`](crate::client::Client).
    pub multiplex: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ManagerOptions {
    /// Creates options with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            engine: EngineOptions::new().with_path(DEFAULT_PATH),
            reconnection: true,
            reconnection_attempts: None,
            reconnection_delay: DEFAULT_RECONNECTION_DELAY,
            reconnection_delay_max: DEFAULT_RECONNECTION_DELAY_MAX,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            timeout: Some(DEFAULT_TIMEOUT),
            auto_connect: true,
            force_new: false,
            multiplex: true,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ManagerOptions {
    /// Replaces the engine options.
    #[inline]
    #[must_use]
    pub fn with_engine(mut self, engine: EngineOptions) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the engine request path.
    #[inline]
    #[must_use]
    pub fn with_path(mut self, path: &str) -> Self {
        self.engine = self.engine.with_path(path);
        self
    }

    /// Adds an engine query parameter.
    #[inline]
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.engine = self.engine.with_query(key, value);
        self
    }

    /// Sets the transport preference list.
    #[inline]
    #[must_use]
    pub fn with_transports(mut self, transports: impl IntoIterator<Item = TransportKind>) -> Self {
        self.engine = self.engine.with_transports(transports);
        self
    }

    /// Enables or disables reconnection.
    #[inline]
    #[must_use]
    pub fn with_reconnection(mut self, reconnection: bool) -> Self {
        self.reconnection = reconnection;
        self
    }

    /// Limits reconnection attempts.
    #[inline]
    #[must_use]
    pub fn with_reconnection_attempts(mut self, attempts: u32) -> Self {
        self.reconnection_attempts = Some(attempts);
        self
    }

    /// Sets the base reconnection delay.
    #[inline]
    #[must_use]
    pub fn with_reconnection_delay(mut self, delay: Duration) -> Self {
        self.reconnection_delay = delay;
        self
    }

    /// Sets the reconnection delay cap.
    #[inline]
    #[must_use]
    pub fn with_reconnection_delay_max(mut self, delay: Duration) -> Self {
        self.reconnection_delay_max = delay;
        self
    }

    /// Sets the jitter factor.
    #[inline]
    #[must_use]
    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor;
        self
    }

    /// Sets or disables the connection timeout.
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables auto-connect.
    #[inline]
    #[must_use]
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Forces a dedicated manager.
    #[inline]
    #[must_use]
    pub fn with_force_new(mut self, force_new: bool) -> Self {
        self.force_new = force_new;
        self
    }

    /// Enables or disables manager sharing.
    #[inline]
    #[must_use]
    pub fn with_multiplex(mut self, multiplex: bool) -> Self {
        self.multiplex = multiplex;
        self
    }
}

// ============================================================================
// Conversion Methods
// ============================================================================

impl ManagerOptions {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid engine options or a
    /// randomization factor outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(Error::config(format!(
                "randomization factor {} outside [0, 1]",
                self.randomization_factor
            )));
        }
        Ok(())
    }

    /// Builds the backoff schedule described by these options.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.reconnection_delay,
            self.reconnection_delay_max,
            self.randomization_factor,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
