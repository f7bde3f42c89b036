//! Event-loop configuration.
//!
//! [`LoopConfig`] carries the tuning knobs for an
//! [`EventLoop`](crate::runtime::EventLoop) and validates the guardrail
//! invariants before the loop is built.

use std::time::Duration;

/// Error returned when a [`LoopConfig`] fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The loop name is empty.
    EmptyName,
    /// The callback queue capacity hint is zero.
    ZeroCallbackCapacity,
    /// The idle park interval is outside the accepted range.
    IdleParkOutOfRange,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "event loop name must not be empty"),
            Self::ZeroCallbackCapacity => write!(f, "callback capacity must be at least 1"),
            Self::IdleParkOutOfRange => {
                write!(f, "idle park interval must be between 1ms and 10s")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Tuning knobs for an event loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Name used in diagnostics and carrier-thread names.
    pub name: String,
    /// Initial capacity of the deferred-callback heap.
    pub callback_capacity: usize,
    /// How long the loop parks at a time while idle before re-checking
    /// for runnable work.
    pub idle_park: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            name: "coopsync-loop".to_string(),
            callback_capacity: 16,
            idle_park: Duration::from_millis(50),
        }
    }
}

impl LoopConfig {
    /// Creates a config with the given name and default tuning.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Validates the configuration for basic sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.callback_capacity == 0 {
            return Err(ConfigError::ZeroCallbackCapacity);
        }
        if self.idle_park < Duration::from_millis(1) || self.idle_park > Duration::from_secs(10) {
            return Err(ConfigError::IdleParkOutOfRange);
        }
        Ok(())
    }
}
