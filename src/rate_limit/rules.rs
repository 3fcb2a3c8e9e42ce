//! Rate limit rules and first-match routing.

use crate::{Error, ErrorContext, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a calling client is classified by the surrounding service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    External,
    Internal,
    Trusted,
}

impl ClientType {
    /// Internal/trusted traffic bypasses rate limiting entirely.
    pub fn bypasses_limits(&self) -> bool {
        matches!(self, ClientType::Internal | ClientType::Trusted)
    }
}

/// The three interchangeable throttling algorithms.
///
/// Tradeoffs: sliding window is precise (no boundary burst) but keeps a
/// timestamp set per key; token bucket allows short bursts while bounding
/// the sustained average; fixed window is the cheapest but adjacent
/// windows can jointly admit up to twice the limit at the boundary, which
/// is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    SlidingWindow,
    TokenBucket,
    FixedWindow,
}

/// The tracked granularity windows. A request must pass every granularity
/// its rule configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub fn window(&self) -> Duration {
        match self {
            Granularity::Minute => Duration::from_secs(60),
            Granularity::Hour => Duration::from_secs(3600),
            Granularity::Day => Duration::from_secs(86_400),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minute" => Some(Granularity::Minute),
            "hour" => Some(Granularity::Hour),
            "day" => Some(Granularity::Day),
            _ => None,
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which constraint decided a rate limit outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    Minute,
    Hour,
    Day,
    /// Trusted/internal traffic, never limited.
    BypassInternal,
    /// The matched rule configures no granularity at all.
    Unlimited,
}

impl From<Granularity> for LimitType {
    fn from(g: Granularity) -> Self {
        match g {
            Granularity::Minute => LimitType::Minute,
            Granularity::Hour => LimitType::Hour,
            Granularity::Day => LimitType::Day,
        }
    }
}

impl std::fmt::Display for LimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LimitType::Minute => "minute",
            LimitType::Hour => "hour",
            LimitType::Day => "day",
            LimitType::BypassInternal => "bypass_internal",
            LimitType::Unlimited => "unlimited",
        };
        f.write_str(s)
    }
}

/// Limits bound to one rule. Unset granularities are not tracked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: Option<u32>,
    pub requests_per_hour: Option<u32>,
    pub requests_per_day: Option<u32>,
    pub algorithm: RateLimitAlgorithm,
    /// Token bucket capacity for the minute bucket; defaults to
    /// `requests_per_minute` (no extra burst headroom).
    pub burst_limit: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: Some(60),
            requests_per_hour: Some(1_000),
            requests_per_day: Some(10_000),
            algorithm: RateLimitAlgorithm::SlidingWindow,
            burst_limit: None,
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// No granularity tracked at all.
    pub fn unlimited() -> Self {
        Self {
            requests_per_minute: None,
            requests_per_hour: None,
            requests_per_day: None,
            algorithm: RateLimitAlgorithm::SlidingWindow,
            burst_limit: None,
        }
    }

    pub fn with_requests_per_minute(mut self, limit: u32) -> Self {
        self.requests_per_minute = Some(limit);
        self
    }

    pub fn with_requests_per_hour(mut self, limit: u32) -> Self {
        self.requests_per_hour = Some(limit);
        self
    }

    pub fn with_requests_per_day(mut self, limit: u32) -> Self {
        self.requests_per_day = Some(limit);
        self
    }

    pub fn with_algorithm(mut self, algorithm: RateLimitAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_burst_limit(mut self, burst: u32) -> Self {
        self.burst_limit = Some(burst);
        self
    }

    /// The granularities this config tracks, with their limits.
    pub fn granularities(&self) -> Vec<(Granularity, u32)> {
        let mut out = Vec::new();
        if let Some(limit) = self.requests_per_minute {
            out.push((Granularity::Minute, limit));
        }
        if let Some(limit) = self.requests_per_hour {
            out.push((Granularity::Hour, limit));
        }
        if let Some(limit) = self.requests_per_day {
            out.push((Granularity::Day, limit));
        }
        out
    }

    pub fn limit_for(&self, granularity: Granularity) -> Option<u32> {
        match granularity {
            Granularity::Minute => self.requests_per_minute,
            Granularity::Hour => self.requests_per_hour,
            Granularity::Day => self.requests_per_day,
        }
    }

    /// Token bucket capacity for a granularity: `burst_limit` applies to
    /// the minute bucket only, coarser buckets cap at their own limit.
    pub fn bucket_capacity(&self, granularity: Granularity, limit: u32) -> u32 {
        match granularity {
            Granularity::Minute => self.burst_limit.unwrap_or(limit).max(1),
            _ => limit.max(1),
        }
    }
}

/// One admission rule: a path pattern with optional method and client-type
/// discriminators, bound to a [`RateLimitConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Request path pattern; `*` matches any run of characters.
    pub path_pattern: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub client_type: Option<ClientType>,
    #[serde(default)]
    pub config: RateLimitConfig,
}

impl RateLimitRule {
    pub fn new(path_pattern: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            path_pattern: path_pattern.into(),
            method: None,
            client_type: None,
            config,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_client_type(mut self, client_type: ClientType) -> Self {
        self.client_type = Some(client_type);
        self
    }
}

struct CompiledRule {
    rule: RateLimitRule,
    pattern: Regex,
}

/// An ordered rule list with compiled patterns; first match governs, no
/// match falls back to the default config.
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    default_config: RateLimitConfig,
}

impl RuleSet {
    pub fn new(rules: Vec<RateLimitRule>, default_config: RateLimitConfig) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for (idx, rule) in rules.into_iter().enumerate() {
            let pattern = compile_pattern(&rule.path_pattern).map_err(|err| {
                Error::configuration_with_context(
                    format!("invalid path pattern '{}': {}", rule.path_pattern, err),
                    ErrorContext::new()
                        .with_field_path(format!("rules[{}].path_pattern", idx))
                        .with_source("rule_set"),
                )
            })?;
            compiled.push(CompiledRule { rule, pattern });
        }
        Ok(Self {
            rules: compiled,
            default_config,
        })
    }

    pub fn default_config(&self) -> &RateLimitConfig {
        &self.default_config
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First-match resolution of the governing config for a request.
    pub fn resolve(
        &self,
        path: &str,
        method: Option<&str>,
        client_type: ClientType,
    ) -> &RateLimitConfig {
        for compiled in &self.rules {
            if !compiled.pattern.is_match(path) {
                continue;
            }
            if let Some(ref rule_method) = compiled.rule.method {
                match method {
                    Some(m) if rule_method.eq_ignore_ascii_case(m) => {}
                    _ => continue,
                }
            }
            if let Some(rule_client) = compiled.rule.client_type {
                if rule_client != client_type {
                    continue;
                }
            }
            return &compiled.rule.config;
        }
        &self.default_config
    }
}

fn compile_pattern(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited(per_minute: u32) -> RateLimitConfig {
        RateLimitConfig::unlimited().with_requests_per_minute(per_minute)
    }

    #[test]
    fn test_first_match_governs() {
        let rules = RuleSet::new(
            vec![
                RateLimitRule::new("/v1/calls/*", limited(10)),
                RateLimitRule::new("/v1/*", limited(100)),
            ],
            limited(1000),
        )
        .unwrap();

        let cfg = rules.resolve("/v1/calls/abc", None, ClientType::External);
        assert_eq!(cfg.requests_per_minute, Some(10));

        let cfg = rules.resolve("/v1/agents", None, ClientType::External);
        assert_eq!(cfg.requests_per_minute, Some(100));
    }

    #[test]
    fn test_no_match_falls_back_to_default() {
        let rules = RuleSet::new(vec![RateLimitRule::new("/v1/*", limited(10))], limited(42)).unwrap();
        let cfg = rules.resolve("/healthz", None, ClientType::External);
        assert_eq!(cfg.requests_per_minute, Some(42));
    }

    #[test]
    fn test_method_discriminator() {
        let rules = RuleSet::new(
            vec![RateLimitRule::new("/v1/calls", limited(5)).with_method("POST")],
            limited(100),
        )
        .unwrap();

        assert_eq!(
            rules
                .resolve("/v1/calls", Some("post"), ClientType::External)
                .requests_per_minute,
            Some(5)
        );
        assert_eq!(
            rules
                .resolve("/v1/calls", Some("GET"), ClientType::External)
                .requests_per_minute,
            Some(100)
        );
        assert_eq!(
            rules
                .resolve("/v1/calls", None, ClientType::External)
                .requests_per_minute,
            Some(100)
        );
    }

    #[test]
    fn test_client_type_discriminator() {
        let rules = RuleSet::new(
            vec![RateLimitRule::new("/v1/*", limited(5)).with_client_type(ClientType::External)],
            limited(100),
        )
        .unwrap();

        assert_eq!(
            rules
                .resolve("/v1/x", None, ClientType::External)
                .requests_per_minute,
            Some(5)
        );
        assert_eq!(
            rules
                .resolve("/v1/x", None, ClientType::Trusted)
                .requests_per_minute,
            Some(100)
        );
    }

    #[test]
    fn test_pattern_is_anchored_and_escaped() {
        let rules = RuleSet::new(vec![RateLimitRule::new("/v1/a.b", limited(5))], limited(100)).unwrap();
        // '.' is literal, and the pattern must cover the whole path.
        assert_eq!(
            rules
                .resolve("/v1/axb", None, ClientType::External)
                .requests_per_minute,
            Some(100)
        );
        assert_eq!(
            rules
                .resolve("/v1/a.b/extra", None, ClientType::External)
                .requests_per_minute,
            Some(100)
        );
        assert_eq!(
            rules
                .resolve("/v1/a.b", None, ClientType::External)
                .requests_per_minute,
            Some(5)
        );
    }

    #[test]
    fn test_granularities_listing() {
        let cfg = RateLimitConfig::unlimited()
            .with_requests_per_minute(10)
            .with_requests_per_day(500);
        let grans = cfg.granularities();
        assert_eq!(
            grans,
            vec![(Granularity::Minute, 10), (Granularity::Day, 500)]
        );
    }

    #[test]
    fn test_bucket_capacity_burst_applies_to_minute_only() {
        let cfg = RateLimitConfig::new().with_burst_limit(20);
        assert_eq!(cfg.bucket_capacity(Granularity::Minute, 60), 20);
        assert_eq!(cfg.bucket_capacity(Granularity::Hour, 1000), 1000);
    }

    #[test]
    fn test_client_type_bypass() {
        assert!(ClientType::Internal.bypasses_limits());
        assert!(ClientType::Trusted.bypasses_limits());
        assert!(!ClientType::External.bypasses_limits());
    }
}
