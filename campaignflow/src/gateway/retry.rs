//! Backoff for transient derivation failures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy to spread out concurrent retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
}

/// How the gateway retries engine failures flagged as transient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum engine calls per derivation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_strategy: BackoffStrategy::default(),
            jitter_strategy: JitterStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that never retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Returns true if another attempt is allowed after `attempt` calls.
    #[must_use]
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Calculates the delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;

        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(attempt)).min(max)
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match self.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(config.jitter_strategy, JitterStrategy::Full);
    }

    #[test]
    fn test_disabled_allows_no_retry() {
        let config = RetryConfig::disabled();
        assert!(!config.allows_retry(1));
    }

    #[test]
    fn test_max_attempts_floor() {
        assert_eq!(RetryConfig::new().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn test_exponential_no_jitter() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(1_000)
            .with_jitter(JitterStrategy::None);

        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
        assert_eq!(config.delay_for(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_linear_and_constant() {
        let linear = RetryConfig::new()
            .with_base_delay_ms(50)
            .with_backoff(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::None);
        assert_eq!(linear.delay_for(2), Duration::from_millis(150));

        let constant = linear.with_backoff(BackoffStrategy::Constant);
        assert_eq!(constant.delay_for(5), Duration::from_millis(50));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let config = RetryConfig::new().with_base_delay_ms(100).with_jitter(JitterStrategy::Full);
        for attempt in 0..5 {
            assert!(config.delay_for(attempt) <= Duration::from_millis(config.max_delay_ms));
        }
    }

    #[test]
    fn test_equal_jitter_lower_bound() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::Equal);
        let delay = config.delay_for(0);
        assert!(delay >= Duration::from_millis(50));
        assert!(delay <= Duration::from_millis(100));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 200);
    }
}
