//! Typed configuration for the resilience core.
//!
//! Discovering, merging and watching configuration sources is the job of
//! the surrounding service; this module only defines the typed shape it
//! must produce, with serde support and a YAML convenience for the common
//! case of a dedicated resilience section.

use crate::backpressure::BackpressureConfig;
use crate::circuit::CircuitBreakerConfig;
use crate::rate_limit::{RateLimitConfig, RateLimitRule};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Serde helper: durations written as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Global defaults plus per-dependency overrides for every component the
/// [`crate::ResilienceManager`] owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Template for breakers created lazily on first use.
    pub circuit_breaker_defaults: CircuitBreakerConfig,
    /// Named breakers created at startup, keyed by dependency name.
    pub circuit_breakers: HashMap<String, CircuitBreakerConfig>,
    /// Config applied when no rule matches a request.
    pub rate_limit_default: RateLimitConfig,
    /// Ordered admission rules; first match governs.
    pub rate_limit_rules: Vec<RateLimitRule>,
    /// Template for handlers created lazily on first use.
    pub backpressure_defaults: BackpressureConfig,
    /// Named handlers created at startup, keyed by resource name.
    pub backpressure: HashMap<String, BackpressureConfig>,
}

impl ResilienceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML resilience section.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|err| {
            Error::configuration_with_context(
                format!("invalid resilience config: {}", err),
                ErrorContext::new().with_source("config_yaml"),
            )
        })
    }

    pub fn with_circuit_breaker_defaults(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_defaults = config;
        self
    }

    pub fn with_circuit_breaker(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.circuit_breakers.insert(name.into(), config);
        self
    }

    pub fn with_rate_limit_default(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit_default = config;
        self
    }

    pub fn with_rate_limit_rule(mut self, rule: RateLimitRule) -> Self {
        self.rate_limit_rules.push(rule);
        self
    }

    pub fn with_backpressure_defaults(mut self, config: BackpressureConfig) -> Self {
        self.backpressure_defaults = config;
        self
    }

    pub fn with_backpressure(mut self, name: impl Into<String>, config: BackpressureConfig) -> Self {
        self.backpressure.insert(name.into(), config);
        self
    }

    /// Effective breaker config for a dependency: the named override when
    /// present, otherwise the defaults stamped with the dependency name.
    pub fn breaker_config_for(&self, name: &str) -> CircuitBreakerConfig {
        match self.circuit_breakers.get(name) {
            Some(config) => config.clone().with_name(name),
            None => self.circuit_breaker_defaults.clone().with_name(name),
        }
    }

    /// Effective backpressure config for a resource, as above.
    pub fn backpressure_config_for(&self, name: &str) -> BackpressureConfig {
        let mut config = self
            .backpressure
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.backpressure_defaults.clone());
        config.name = name.to_string();
        config
    }
}
