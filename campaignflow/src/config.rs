//! Configuration for the pipeline and the derivation gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::gateway::RetryConfig;

/// What the gateway does when a derive request arrives for a
/// `(campaign, stage)` pair that already has one in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Cancel the outstanding request and run the new one.
    #[default]
    Supersede,
    /// Refuse the new request with `DerivationError::Busy`.
    Reject,
}

/// Configuration for the derivation gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Handling of concurrent requests for the same stage.
    #[serde(default)]
    pub busy_policy: BusyPolicy,
    /// Retry of transient engine failures.
    #[serde(default)]
    pub retry: RetryConfig,
    /// How long derived artifacts stay in the idempotency cache.
    /// `None` keeps them until the campaign is deleted.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: Option<f64>,
}

fn default_cache_ttl() -> Option<f64> {
    Some(3600.0)
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            busy_policy: BusyPolicy::default(),
            retry: RetryConfig::default(),
            cache_ttl_seconds: default_cache_ttl(),
        }
    }
}

impl GatewayConfig {
    /// Creates a gateway configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the busy policy.
    #[must_use]
    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the cache TTL.
    #[must_use]
    pub fn with_cache_ttl_seconds(mut self, ttl: Option<f64>) -> Self {
        self.cache_ttl_seconds = ttl;
        self
    }

    /// Returns the cache TTL as a duration. Negative values count as zero.
    #[must_use]
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_seconds
            .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Top-level configuration for a campaign registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Deadline for each derivation, in milliseconds.
    #[serde(default = "default_derive_timeout_ms")]
    pub derive_timeout_ms: u64,
    /// Gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_derive_timeout_ms() -> u64 {
    30_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            derive_timeout_ms: default_derive_timeout_ms(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a pipeline configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a field has the wrong type.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Sets the derivation deadline.
    #[must_use]
    pub fn with_derive_timeout(mut self, timeout: Duration) -> Self {
        self.derive_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the gateway configuration.
    #[must_use]
    pub fn with_gateway(mut self, gateway: GatewayConfig) -> Self {
        self.gateway = gateway;
        self
    }

    /// Returns the derivation deadline.
    #[must_use]
    pub fn derive_timeout(&self) -> Duration {
        Duration::from_millis(self.derive_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.derive_timeout(), Duration::from_secs(30));
        assert_eq!(config.gateway.busy_policy, BusyPolicy::Supersede);
        assert_eq!(config.gateway.cache_ttl(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_from_json_partial() {
        let config = PipelineConfig::from_json_str(
            r#"{"derive_timeout_ms": 1500, "gateway": {"busy_policy": "reject", "cache_ttl_seconds": null}}"#,
        )
        .unwrap();

        assert_eq!(config.derive_timeout_ms, 1500);
        assert_eq!(config.gateway.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.gateway.cache_ttl(), None);
        assert_eq!(config.gateway.retry, RetryConfig::default());
    }

    #[test]
    fn test_from_json_rejects_bad_type() {
        assert!(PipelineConfig::from_json_str(r#"{"derive_timeout_ms": "soon"}"#).is_err());
    }

    #[test]
    fn test_builders() {
        let config = PipelineConfig::new()
            .with_derive_timeout(Duration::from_millis(250))
            .with_gateway(GatewayConfig::new().with_retry(RetryConfig::disabled()));

        assert_eq!(config.derive_timeout_ms, 250);
        assert_eq!(config.gateway.retry.max_attempts, 1);
    }
}
