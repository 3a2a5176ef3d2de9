//! Exponential backoff with jitter for reconnection attempts.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use sockio::manager::Backoff;
//!
//! let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(5000), 0.0);
//! assert_eq!(backoff.duration(), Duration::from_millis(1000));
//! assert_eq!(backoff.duration(), Duration::from_millis(2000));
//! backoff.reset();
//! assert_eq!(backoff.attempts(), 0);
//! ```

use std::time::Duration;

/// Growth factor between attempts.
const DEFAULT_FACTOR: f64 = 2.0;

/// Reconnection delay schedule.
///
/// `duration()` returns `min * factor^attempts`, randomized by up to
/// `jitter * delay` in either direction, then clamped to
/// `[min(min, max), max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    attempts: u32,
}

impl Backoff {
    /// Creates a schedule with factor 2.
    ///
    /// `jitter` is clamped to `[0, 1]`.
    #[must_use]
    pub fn new(min: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            min,
            max,
            factor: DEFAULT_FACTOR,
            jitter: jitter.clamp(0.0, 1.0),
            attempts: 0,
        }
    }

    /// Overrides the growth factor.
    #[inline]
    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Returns the next delay and counts the attempt.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn duration(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        let min_ms = self.min.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;

        let mut ms = min_ms * self.factor.powi(exponent);
        self.attempts = self.attempts.saturating_add(1);

        if self.jitter > 0.0 {
            let rand: f64 = rand::random();
            let deviation = (rand * self.jitter * ms).floor();
            ms = if ((rand * 10.0).floor() as u64) & 1 == 0 {
                ms - deviation
            } else {
                ms + deviation
            };
        }

        if ms.is_nan() {
            ms = max_ms;
        }
        Duration::from_millis(ms.clamp(min_ms.min(max_ms), max_ms) as u64)
    }

    /// Resets the attempt counter.
    #[inline]
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Returns the number of delays handed out since the last reset.
    #[inline]
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sets the base delay.
    #[inline]
    pub fn set_min(&mut self, min: Duration) {
        self.min = min;
    }

    /// Sets the delay cap.
    #[inline]
    pub fn set_max(&mut self, max: Duration) {
        self.max = max;
    }

    /// Sets the randomization factor, clamped to `[0, 1]`.
    #[inline]
    pub fn set_jitter(&mut self, jitter: f64) {
        self.jitter = jitter.clamp(0.0, 1.0);
    }

    /// Returns the base delay.
    #[inline]
    #[must_use]
    pub const fn min(&self) -> Duration {
        self.min
    }

    /// Returns the delay cap.
    #[inline]
    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }

    /// Returns the randomization factor.
    #[inline]
    #[must_use]
    pub const fn jitter(&self) -> f64 {
        self.jitter
    }
}

impl Default for Backoff {
    /// 1s base, 5s cap, ±50% jitter.
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(5000), 0.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_delays_double_without_jitter() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(60), 0.0);
        let delays: Vec<_> = (0..4).map(|_| backoff.duration().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
        assert_eq!(backoff.attempts(), 4);
    }

    #[test]
    fn test_respects_max_delay() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(5000), 0.0);
        let delays: Vec<_> = (0..5).map(|_| backoff.duration().as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_reset_clears_attempts() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30), 0.0);
        let _ = backoff.duration();
        let _ = backoff.duration();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_setters_apply_to_next_delay() {
        let mut backoff = Backoff::default();
        backoff.set_min(Duration::from_millis(10));
        backoff.set_max(Duration::from_millis(15));
        backoff.set_jitter(0.0);
        assert_eq!(backoff.duration(), Duration::from_millis(10));
        assert_eq!(backoff.duration(), Duration::from_millis(15));
    }

    #[test]
    fn test_jitter_clamped() {
        let backoff = Backoff::new(Duration::ZERO, Duration::ZERO, 3.0);
        assert!((backoff.jitter() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_min_above_max_yields_max() {
        let mut backoff = Backoff::new(Duration::from_millis(900), Duration::from_millis(300), 0.5);
        for _ in 0..10 {
            assert_eq!(backoff.duration(), Duration::from_millis(300));
        }
    }

    proptest! {
        #[test]
        fn prop_duration_within_bounds(
            min in 0u64..10_000,
            max in 0u64..20_000,
            jitter in 0.0f64..=1.0,
            calls in 1usize..40,
        ) {
            let mut backoff = Backoff::new(Duration::from_millis(min), Duration::from_millis(max), jitter);
            let floor = Duration::from_millis(min.min(max));
            let cap = Duration::from_millis(max);
            for _ in 0..calls {
                let delay = backoff.duration();
                prop_assert!(delay >= floor);
                prop_assert!(delay <= cap);
            }
        }

        #[test]
        fn prop_zero_jitter_is_exact(min in 1u64..5_000, max in 1u64..100_000, n in 0u32..20) {
            let mut backoff = Backoff::new(Duration::from_millis(min), Duration::from_millis(max), 0.0);
            for _ in 0..n {
                let _ = backoff.duration();
            }
            let expected = (min as f64 * 2f64.powi(n as i32)).min(max as f64).max(min.min(max) as f64);
            prop_assert_eq!(backoff.duration(), Duration::from_millis(expected as u64));
        }
    }
}
