//! Configuration for the assembled link pipeline.

use std::time::Duration;

use rand::Rng;

/// Pipeline-level configuration.
///
/// Controls operation timeouts, retry back-off and the optional links.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Timeout applied when an operation does not set `timeoutMs` in its context.
    pub default_timeout_ms: u64,
    /// Back-off policy for the retry link.
    pub retry: RetryConfig,
    /// Share in-flight results between identical concurrent operations.
    pub dedup: bool,
    /// Send persisted-query hashes instead of full documents.
    pub persisted_queries: bool,
    /// Number of document hashes kept by the persisted-query link.
    pub persisted_hash_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            dedup: true,
            persisted_queries: false,
            persisted_hash_capacity: 1024,
        }
    }
}

impl PipelineConfig {
    /// Rejects values that would make the pipeline unusable.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.persisted_queries && self.persisted_hash_capacity == 0 {
            return Err(ConfigError::ZeroHashCapacity);
        }
        self.retry.validate()
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Exponential back-off policy.
///
/// The delay before retry `n` (1-based) is `initial_delay_ms * 2^(n-1)`,
/// capped at `max_delay_ms`. With `jitter`, a uniformly random delay between
/// zero and that value is used instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 300,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError`] for zero attempts or inverted delay bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::DelayBounds {
                initial_ms: self.initial_delay_ms,
                max_ms: self.max_delay_ms,
            });
        }
        Ok(())
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let ceiling = self
            .initial_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms);
        let millis = if self.jitter && ceiling > 0 {
            rand::rng().random_range(0..=ceiling)
        } else {
            ceiling
        };
        Duration::from_millis(millis)
    }
}

/// Invalid pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("default operation timeout must be greater than zero")]
    ZeroTimeout,
    #[error("retry policy must allow at least one attempt")]
    ZeroAttempts,
    #[error("initial retry delay {initial_ms}ms exceeds maximum delay {max_ms}ms")]
    DelayBounds { initial_ms: u64, max_ms: u64 },
    #[error("persisted-query hash cache capacity must be greater than zero")]
    ZeroHashCapacity,
}
