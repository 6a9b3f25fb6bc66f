//! Configuration types for the listener container
//!
//! [`ContainerConfig`] holds the plain-data settings: names, waits and the
//! connection recovery policy. Collaborators (connection provider, executors,
//! error handler, initial listener bindings) are supplied on
//! [`ContainerBuilder`](crate::ContainerBuilder).

use std::time::Duration;

use crate::error::ContainerError;

/// Delay policy between connection recovery attempts.
///
/// The delay for attempt `n` (0-indexed) is `first × factor^n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecoveryBackoff {
    /// Delay before the first retry
    pub first: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Multiplicative growth factor, `1.0` for a constant interval
    pub factor: f64,
}

impl Default for RecoveryBackoff {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl RecoveryBackoff {
    /// Constant interval between attempts
    pub fn fixed(interval: Duration) -> Self {
        Self {
            first: interval,
            max: interval,
            factor: 1.0,
        }
    }

    /// Exponentially growing interval, capped at `max`
    pub fn exponential(first: Duration, max: Duration, factor: f64) -> Self {
        Self { first, max, factor }
    }

    /// Delay before recovery attempt `attempt`
    pub fn next(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = self.first.as_millis() as f64 * self.factor.powi(exponent);
        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(millis as u64)
    }
}

/// Configuration for a [`ListenerContainer`](crate::ListenerContainer)
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Container name, used for thread names and log messages
    /// Default: "listener-container"
    pub name: String,

    /// Upper bound on how long `start()` waits for the subscription to be confirmed
    /// Default: 2 seconds
    pub max_subscription_registration_waiting_time: Duration,

    /// Delay policy between connection recovery attempts
    /// Default: constant 5 seconds
    pub recovery: RecoveryBackoff,

    /// Give up recovering after this many consecutive failures (None = never)
    /// Default: None
    pub max_recovery_attempts: Option<u32>,

    /// How long `stop()` waits for the subscription task to finish after teardown
    /// Default: 5 seconds
    pub max_teardown_wait: Duration,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: "listener-container".to_string(),
            max_subscription_registration_waiting_time: Duration::from_secs(2),
            recovery: RecoveryBackoff::default(),
            max_recovery_attempts: None,
            max_teardown_wait: Duration::from_secs(5),
        }
    }
}

impl ContainerConfig {
    /// Create a new ContainerConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Short waits, for tests and local demos
    pub fn fast_start() -> Self {
        Self {
            max_subscription_registration_waiting_time: Duration::from_millis(500),
            recovery: RecoveryBackoff::fixed(Duration::from_millis(50)),
            max_teardown_wait: Duration::from_secs(1),
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), ContainerError> {
        if self.name.trim().is_empty() {
            return Err(ContainerError::Configuration(
                "Container name must not be empty".to_string(),
            ));
        }

        if self.max_subscription_registration_waiting_time == Duration::ZERO {
            return Err(ContainerError::Configuration(
                "Max subscription registration waiting time must be greater than 0".to_string(),
            ));
        }

        if self.recovery.first == Duration::ZERO {
            return Err(ContainerError::Configuration(
                "Recovery interval must be greater than 0".to_string(),
            ));
        }

        if self.recovery.max < self.recovery.first {
            return Err(ContainerError::Configuration(
                "Invalid recovery backoff: max must not be less than first".to_string(),
            ));
        }

        if !(self.recovery.factor >= 1.0) {
            return Err(ContainerError::Configuration(
                "Recovery backoff factor must be at least 1.0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_subscription_registration_waiting_time(mut self, wait: Duration) -> Self {
        self.max_subscription_registration_waiting_time = wait;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryBackoff) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery = RecoveryBackoff::fixed(interval);
        self
    }

    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = Some(attempts);
        self
    }

    pub fn with_max_teardown_wait(mut self, wait: Duration) -> Self {
        self.max_teardown_wait = wait;
        self
    }
}
