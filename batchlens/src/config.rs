//! Tuning knobs of the dispatcher.
use std::time::Duration;

use crate::{backoff::BackoffStrategy, limiter::clamp_capacity};

/// The default backoff between attempts of a failed analysis: 5 seconds times the retry count.
pub const DEFAULT_BACKOFF_STRATEGY: BackoffStrategy =
    BackoffStrategy::linear(Duration::from_secs(5));

/// Configuration for [`crate::Batchlens`].
///
/// All the builder functions are `const`, so a configuration can be declared as a constant:
///
/// ```
/// # use batchlens::prelude::*;
/// # use std::time::Duration;
/// const CONFIG: DispatcherConfig = DispatcherConfig::new()
///     .with_max_concurrency(5)
///     .with_tick_interval(Duration::from_secs(1))
///     .with_analysis_timeout(Duration::from_secs(30));
///
/// assert_eq!(CONFIG.max_concurrency, 5);
/// assert_eq!(CONFIG.batch_size, 10);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Maximum number of simultaneous analyzer calls.
    pub max_concurrency: usize,
    /// Maximum number of pending jobs selected per dispatch tick.
    pub batch_size: usize,
    /// Pause between two dispatch ticks.
    pub tick_interval: Duration,
    /// Pause after a dispatch tick failed, before trying again.
    pub fault_cooldown: Duration,
    /// Number of failed attempts after which a job is permanently failed.
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    /// Upper bound for a single analyzer call. `None` waits indefinitely.
    pub analysis_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherConfig {
    pub const fn new() -> Self {
        Self {
            max_concurrency: 3,
            batch_size: 10,
            tick_interval: Duration::from_secs(5),
            fault_cooldown: Duration::from_secs(10),
            max_retries: 3,
            backoff: DEFAULT_BACKOFF_STRATEGY,
            analysis_timeout: None,
        }
    }

    /// Values below 1 are treated as 1, values above [`tokio::sync::Semaphore::MAX_PERMITS`]
    /// as that maximum.
    pub const fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = clamp_capacity(max_concurrency);
        self
    }

    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub const fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub const fn with_fault_cooldown(mut self, fault_cooldown: Duration) -> Self {
        self.fault_cooldown = fault_cooldown;
        self
    }

    /// Values below 1 are treated as 1: every job gets at least one attempt.
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = if max_retries == 0 { 1 } else { max_retries };
        self
    }

    pub const fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub const fn with_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.analysis_timeout = Some(timeout);
        self
    }
}
