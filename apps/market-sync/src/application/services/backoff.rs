//! Backoff Scheduler
//!
//! Exponential backoff for feed reconnection.
//!
//! The delay is a pure function of the attempt count:
//!
//! ```text
//! delay(attempt) = min(initial_delay × multiplier^(attempt - 1), max_delay)
//! ```
//!
//! Jitter is opt-in. With `jitter_factor == 0.0` the delay sequence is
//! monotonically non-decreasing.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Failed cycles after which reconnection gives up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    /// Set the jitter factor.
    #[must_use]
    pub const fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Un-jittered delay before reconnection attempt `attempt` (1-based).
    ///
    /// Attempt 0 is treated as attempt 1.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let max_nanos = self.max_delay.as_nanos() as f64;
        #[allow(clippy::cast_precision_loss)]
        let nanos = (self.initial_delay.as_nanos() as f64 * factor).round();

        if !nanos.is_finite() || nanos >= max_nanos {
            return self.max_delay;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nanos_u64 = nanos as u64;
        Duration::from_nanos(nanos_u64)
    }
}

/// Reconnection policy tracking failed connection cycles.
///
/// # Example
///
/// ```rust
/// use market_sync::application::services::backoff::{BackoffConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(BackoffConfig::default());
///
/// assert_eq!(policy.record_failure(), Some(Duration::from_secs(1)));
/// assert_eq!(policy.record_failure(), Some(Duration::from_secs(2)));
///
/// // Successful connection
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: BackoffConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Get the policy configuration.
    #[must_use]
    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Record one failed connection cycle.
    ///
    /// Returns the delay before the next attempt, or `None` once the
    /// failure count has reached `max_attempts`.
    #[must_use]
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempt_count = self.attempt_count.saturating_add(1);

        if self.is_exhausted() {
            return None;
        }

        Some(self.apply_jitter(self.config.delay_for(self.attempt_count)))
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check whether the attempt budget is spent.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn config(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: u32) -> BackoffConfig {
        BackoffConfig::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
            multiplier,
            max_attempts,
        )
    }

    #[test]
    fn default_config_values() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter_factor.abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let config = config(1000, 30_000, 2.0, 0);
        assert_eq!(config.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.delay_for(2), Duration::from_secs(2));
        assert_eq!(config.delay_for(3), Duration::from_secs(4));
        assert_eq!(config.delay_for(4), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let config = config(1000, 30_000, 2.0, 0);
        assert_eq!(config.delay_for(6), Duration::from_secs(30));
        assert_eq!(config.delay_for(60), Duration::from_secs(30));
        assert_eq!(config.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn attempt_zero_uses_initial_delay() {
        let config = config(250, 10_000, 2.0, 0);
        assert_eq!(config.delay_for(0), Duration::from_millis(250));
    }

    #[test]
    fn record_failure_follows_schedule() {
        let mut policy = ReconnectPolicy::new(config(100, 10_000, 2.0, 0));
        assert_eq!(policy.record_failure(), Some(Duration::from_millis(100)));
        assert_eq!(policy.record_failure(), Some(Duration::from_millis(200)));
        assert_eq!(policy.record_failure(), Some(Duration::from_millis(400)));
        assert_eq!(policy.attempt_count(), 3);
    }

    #[test]
    fn reaching_max_attempts_is_terminal() {
        let mut policy = ReconnectPolicy::new(config(100, 1000, 2.0, 3));

        assert!(policy.record_failure().is_some());
        assert!(policy.record_failure().is_some());
        assert!(!policy.is_exhausted());

        assert!(policy.record_failure().is_none());
        assert!(policy.is_exhausted());
        assert_eq!(policy.attempt_count(), 3);
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut policy = ReconnectPolicy::new(config(100, 10_000, 2.0, 3));
        let _ = policy.record_failure();
        let _ = policy.record_failure();
        assert_eq!(policy.attempt_count(), 2);

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert!(!policy.is_exhausted());
        assert_eq!(policy.record_failure(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(config(1000, 10_000, 2.0, 0).with_jitter(0.1));
            let millis = policy.record_failure().unwrap().as_millis();
            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }

    #[test]
    fn unlimited_attempts() {
        let mut policy = ReconnectPolicy::new(config(10, 100, 2.0, 0));
        for _ in 0..1000 {
            assert!(policy.record_failure().is_some());
        }
    }

    proptest! {
        #[test]
        fn delays_never_decrease_without_jitter(
            initial_ms in 1_u64..5_000,
            max_ms in 1_u64..120_000,
            multiplier in 1.0_f64..4.0,
            attempts in 1_u32..64,
        ) {
            let config = config(initial_ms, max_ms, multiplier, 0);
            let mut previous = Duration::ZERO;
            for attempt in 1..=attempts {
                let delay = config.delay_for(attempt);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= config.max_delay.max(config.initial_delay));
                previous = delay;
            }
        }
    }
}
