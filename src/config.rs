//! Engine configuration
use std::time::Duration;

use derive_builder::Builder;

pub const DEFAULT_LONG_POLL_TIMEOUT_MILLIS: u64 = 20_000;
pub const DEFAULT_SESSION_TIMEOUT_MILLIS: u64 = 60_000;
pub const DEFAULT_BACKLOG_CAPACITY: usize = 100;
pub const DEFAULT_SWEEP_INTERVAL_MILLIS: u64 = 5_000;

/// Timeouts and limits for the [Dispatcher](crate::dispatcher::Dispatcher)
///
/// # Example
/// ```rust
/// # use std::time::Duration;
/// # use bayeux_rs::config::BayeuxConfigBuilder;
/// let config = BayeuxConfigBuilder::default()
///     .long_poll_timeout(Duration::from_secs(10))
///     .backlog_capacity(50)
///     .build()
///     .unwrap();
/// assert_eq!(config.backlog_capacity, 50);
/// assert_eq!(config.session_timeout, Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(default, build_fn(validate = "Self::validate"))]
pub struct BayeuxConfig {
    /// How long a connect is held when there is nothing to deliver
    pub long_poll_timeout: Duration,

    /// Sessions not seen for longer than this are dropped
    pub session_timeout: Duration,

    /// Messages buffered per session between connects. Past this, the oldest
    /// are dropped.
    pub backlog_capacity: usize,

    /// How often expired sessions are looked for
    pub sweep_interval: Duration,
}

impl Default for BayeuxConfig {
    fn default() -> Self {
        BayeuxConfig {
            long_poll_timeout: Duration::from_millis(DEFAULT_LONG_POLL_TIMEOUT_MILLIS),
            session_timeout: Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MILLIS),
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MILLIS),
        }
    }
}

impl BayeuxConfig {
    pub fn new() -> BayeuxConfig {
        Self::default()
    }

    /// Checks the limits the engine relies on. The fields are public, so a
    /// config built by hand must go through this before it is used.
    pub fn validate(&self) -> Result<(), String> {
        if self.backlog_capacity == 0 {
            return Err("backlog capacity must be at least 1".to_string());
        }
        if self.sweep_interval.is_zero() {
            return Err("sweep interval must be greater than zero".to_string());
        }
        if self.long_poll_timeout >= self.session_timeout {
            return Err(format!(
                "long-poll timeout ({:?}) must be shorter than the session timeout ({:?})",
                self.long_poll_timeout, self.session_timeout
            ));
        }
        Ok(())
    }
}

impl BayeuxConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let defaults = BayeuxConfig::default();
        BayeuxConfig {
            long_poll_timeout: self.long_poll_timeout.unwrap_or(defaults.long_poll_timeout),
            session_timeout: self.session_timeout.unwrap_or(defaults.session_timeout),
            backlog_capacity: self.backlog_capacity.unwrap_or(defaults.backlog_capacity),
            sweep_interval: self.sweep_interval.unwrap_or(defaults.sweep_interval),
        }
        .validate()
    }
}
