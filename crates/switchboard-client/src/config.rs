//! Runtime configuration for the transport and dispatcher.

use std::time::Duration;

use switchboard_core::config::{ClientConfig, ReconnectConfig};

/// Configuration for the client's connection to the broker.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Broker WebSocket URL (e.g., "ws://127.0.0.1:3055").
    pub url: String,

    /// How long one connection attempt may take before it is abandoned.
    pub connect_timeout: Duration,

    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Exponential backoff followed by a fixed persistent interval.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between quick reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Quick attempts before switching to `persistent_interval`.
    pub max_attempts: u32,
    /// Fixed delay once the quick attempts are used up.
    pub persistent_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
            persistent_interval: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    /// Calculate the backoff delay for a given attempt number (0-indexed).
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether `attempt` still belongs to the quick backoff phase.
    pub fn in_backoff(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Timing knobs for the command dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Wait applied to a command when the caller does not pass one.
    pub command_timeout: Duration,
    /// Deadline extensions granted to an unanswered command.
    pub max_extensions: u32,
    /// Growth of the wait on each extension.
    pub extension_factor: f64,
    /// Deadline granted by each progress frame.
    pub progress_window: Duration,
    /// How long a send waits for a lazily opened connection.
    pub connect_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            max_extensions: 3,
            extension_factor: 1.5,
            progress_window: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_secs),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
            persistent_interval: Duration::from_secs(config.persistent_interval_secs),
        }
    }
}

impl From<&ClientConfig> for TransportConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            url: config.url.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            reconnect: ReconnectPolicy::from(&config.reconnect),
        }
    }
}

impl From<&ClientConfig> for DispatcherConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            max_extensions: config.max_extensions,
            extension_factor: config.extension_factor,
            progress_window: Duration::from_secs(config.progress_window_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}
