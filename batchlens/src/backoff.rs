//! Delay policies applied between analysis attempts.
//!
//! Three curves are provided, constant, linear and exponential, each of which can be clamped and
//! optionally modified by applying [`Jitter`]. All of the constructors and configuration
//! functions are `const`, so a strategy can live in a `const` item or in
//! [`crate::config::DispatcherConfig`].
//!
//! # Example
//!
//! ```
//! # use batchlens::prelude::*;
//! # use std::time::Duration;
//! let strategy = BackoffStrategy::linear(Duration::from_secs(20))
//!     .with_max(Duration::from_secs(60))
//!     .with_jitter(Jitter::Absolute(Duration::from_secs(10)));
//!
//! assert!(strategy.backoff(1) >= Duration::from_secs(10));
//! assert!(strategy.backoff(1) <= Duration::from_secs(30));
//! // The max is applied before the jitter
//! assert!(strategy.backoff(10) <= Duration::from_secs(70));
//! ```
use std::time::Duration;

use rand::Rng;

/// A policy returning the delay before the next attempt of a failed job.
pub trait Strategy {
    /// `attempt` is the number of the attempt that just failed, starting at 1.
    fn backoff(&self, attempt: u32) -> Duration;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Curve {
    Constant(Duration),
    Linear(Duration),
    Exponential(Duration),
}

impl Curve {
    fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Constant(delay) => delay,
            Self::Linear(factor) => factor.saturating_mul(attempt),
            Self::Exponential(base) => {
                let multiplier = 2u32
                    .checked_pow(attempt.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                base.saturating_mul(multiplier)
            }
        }
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter in the range `-delta..=delta`.
    Absolute(Duration),
    /// A random jitter of up to the given proportion of the backoff, in either direction.
    Relative(f64),
}

impl Jitter {
    fn apply(&self, value: Duration) -> Duration {
        let spread = match self {
            Self::Absolute(delta) => delta.as_millis() as i64,
            Self::Relative(ratio) => (value.as_millis() as f64 * ratio).round() as i64,
        };
        if spread <= 0 {
            return value;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let millis = (value.as_millis() as i64).saturating_add(offset).max(0);
        Duration::from_millis(millis as u64)
    }
}

/// The [`Strategy`] built from one of the provided curves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy {
    curve: Curve,
    max: Option<Duration>,
    min: Duration,
    jitter: Option<Jitter>,
}

impl BackoffStrategy {
    const fn new(curve: Curve) -> Self {
        Self {
            curve,
            max: None,
            min: Duration::ZERO,
            jitter: None,
        }
    }

    /// Always waits `delay`.
    ///
    /// ```
    /// # use batchlens::prelude::*;
    /// # use std::time::Duration;
    /// let strategy = BackoffStrategy::constant(Duration::from_secs(10));
    ///
    /// assert_eq!(strategy.backoff(1), Duration::from_secs(10));
    /// assert_eq!(strategy.backoff(3), Duration::from_secs(10));
    /// ```
    pub const fn constant(delay: Duration) -> Self {
        Self::new(Curve::Constant(delay))
    }

    /// Waits `factor × attempt`.
    ///
    /// ```
    /// # use batchlens::prelude::*;
    /// # use std::time::Duration;
    /// let strategy = BackoffStrategy::linear(Duration::from_secs(5));
    ///
    /// assert_eq!(strategy.backoff(1), Duration::from_secs(5));
    /// assert_eq!(strategy.backoff(2), Duration::from_secs(10));
    /// assert_eq!(strategy.backoff(3), Duration::from_secs(15));
    /// ```
    pub const fn linear(factor: Duration) -> Self {
        Self::new(Curve::Linear(factor))
    }

    /// Waits `base × 2^(attempt - 1)`. Setting a maximum with [`BackoffStrategy::with_max`] is
    /// advisable.
    ///
    /// ```
    /// # use batchlens::prelude::*;
    /// # use std::time::Duration;
    /// let strategy =
    ///     BackoffStrategy::exponential(Duration::from_secs(2)).with_max(Duration::from_secs(30));
    ///
    /// assert_eq!(strategy.backoff(1), Duration::from_secs(2));
    /// assert_eq!(strategy.backoff(2), Duration::from_secs(4));
    /// assert_eq!(strategy.backoff(4), Duration::from_secs(16));
    /// assert_eq!(strategy.backoff(5), Duration::from_secs(30));
    /// ```
    pub const fn exponential(base: Duration) -> Self {
        Self::new(Curve::Exponential(base))
    }

    /// Clamps the curve to `max` before jitter is applied.
    pub const fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    /// Never wait less than `min`, even after jitter.
    pub const fn with_min(mut self, min: Duration) -> Self {
        self.min = min;
        self
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }
}

impl Strategy for BackoffStrategy {
    fn backoff(&self, attempt: u32) -> Duration {
        let mut backoff = self.curve.delay(attempt);
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        if let Some(jitter) = self.jitter {
            backoff = jitter.apply(backoff);
        }
        backoff.max(self.min)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn constant_backoff() {
        let delay = SECOND * 60;
        let strategy = BackoffStrategy::constant(delay);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), delay);
        }
    }

    #[test]
    fn linear_backoff() {
        let factor = SECOND * 5;
        let strategy = BackoffStrategy::linear(factor);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), factor * i);
        }
    }

    #[test]
    fn linear_backoff_with_max() {
        let max = SECOND * 12;
        let strategy = BackoffStrategy::linear(SECOND * 5).with_max(max);

        assert_eq!(strategy.backoff(2), SECOND * 10);
        for i in 3..100 {
            assert_eq!(strategy.backoff(i), max);
        }
    }

    #[test]
    fn exponential_backoff() {
        let strategy = BackoffStrategy::exponential(SECOND);

        for i in 1..10 {
            assert_eq!(strategy.backoff(i), SECOND * 2u32.pow(i - 1));
        }
    }

    #[test]
    fn exponential_backoff_saturates() {
        let strategy = BackoffStrategy::exponential(SECOND).with_max(SECOND * 600);

        assert_eq!(strategy.backoff(u32::MAX), SECOND * 600);
        assert_eq!(strategy.backoff(64), SECOND * 600);
    }

    #[test]
    fn absolute_jitter_stays_in_range() {
        let delay = SECOND * 60;
        let jitter = SECOND * 10;
        let strategy = BackoffStrategy::constant(delay).with_jitter(Jitter::Absolute(jitter));

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= delay - jitter);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn relative_jitter_stays_in_range() {
        let factor = SECOND * 10;
        let strategy = BackoffStrategy::linear(factor).with_jitter(Jitter::Relative(0.1));

        for i in 1..50 {
            let backoff = strategy.backoff(i);
            let jitter = SECOND * i;
            assert!(backoff >= factor * i - jitter);
            assert!(backoff <= factor * i + jitter);
        }
    }

    #[test]
    fn min_applies_after_jitter() {
        let min = SECOND * 5;
        let strategy = BackoffStrategy::constant(SECOND * 20)
            .with_jitter(Jitter::Absolute(SECOND * 20))
            .with_min(min);

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= min);
            assert!(backoff <= SECOND * 40);
        }
    }

    #[test]
    fn zero_attempt_has_no_delay_for_growing_curves() {
        assert_eq!(BackoffStrategy::linear(SECOND).backoff(0), Duration::ZERO);
        assert_eq!(BackoffStrategy::exponential(SECOND).backoff(0), SECOND);
    }
}
