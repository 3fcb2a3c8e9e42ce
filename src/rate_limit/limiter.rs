//! Rule-routed, store-backed rate limiting.

use super::algorithms::{self, GranularityDecision};
use super::rules::{ClientType, Granularity, LimitType, RateLimitAlgorithm, RateLimitConfig, RuleSet};
use crate::store::{now_ms, FailoverStore, StateStore, StoreKey};
use crate::Result;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a client's key index survives without traffic.
const INDEX_TTL: Duration = Duration::from_secs(86_400);

/// Outcome of one rate limit check.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub current_usage: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds when the deciding granularity resets.
    pub reset_time: u64,
    /// Seconds to wait before retrying; set iff denied.
    pub retry_after: Option<u64>,
    /// Which granularity decided the outcome, or `bypass_internal`.
    pub limit_type: LimitType,
}

impl RateLimitResult {
    /// Convert a denial into [`crate::Error::RateLimited`] for callers that
    /// prefer error propagation over inspecting the result.
    pub fn ensure_allowed(&self) -> Result<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(crate::Error::RateLimited {
                retry_after: self.retry_after.unwrap_or(1),
                limit_type: self.limit_type.to_string(),
            })
        }
    }

    fn bypass(now_secs: u64) -> Self {
        Self {
            allowed: true,
            current_usage: 0,
            limit: 0,
            remaining: 0,
            reset_time: now_secs,
            retry_after: None,
            limit_type: LimitType::BypassInternal,
        }
    }

    fn unlimited(now_secs: u64) -> Self {
        Self {
            allowed: true,
            current_usage: 0,
            limit: 0,
            remaining: 0,
            reset_time: now_secs,
            retry_after: None,
            limit_type: LimitType::Unlimited,
        }
    }
}

/// Usage of one tracked counter, for admin stats.
#[derive(Debug, Clone, Serialize)]
pub struct ClientUsage {
    pub path: String,
    pub granularity: Granularity,
    pub current_usage: u64,
    pub limit: u64,
}

/// Operation counters for health/metrics output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimiterStats {
    pub checks: u64,
    pub allowed: u64,
    pub denied: u64,
    pub bypassed: u64,
    pub errors: u64,
}

#[derive(Default)]
struct AtomicStats {
    checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    bypassed: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn to_stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            checks: self.checks.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Evaluates admission rules against client+path+granularity keys in the
/// shared store.
///
/// A request is admitted only if it passes every granularity its matched
/// rule configures; each granularity is checked and charged independently
/// under its own key, so a denial at the hour level leaves the minute
/// charge in place. Internal/trusted traffic bypasses limiting entirely.
pub struct RateLimiter {
    store: FailoverStore,
    rules: ArcSwap<RuleSet>,
    stats: AtomicStats,
}

impl RateLimiter {
    pub fn new(rules: RuleSet, store: Arc<dyn StateStore>) -> Self {
        Self {
            store: FailoverStore::new(store),
            rules: ArcSwap::from_pointee(rules),
            stats: AtomicStats::default(),
        }
    }

    /// Swap in a new rule set; checks in flight finish against the old one.
    pub fn update_rules(&self, rules: RuleSet) {
        self.rules.store(Arc::new(rules));
    }

    /// True while counters are synchronized through the shared store.
    pub fn is_synchronized(&self) -> bool {
        self.store.is_synchronized()
    }

    pub fn stats(&self) -> RateLimiterStats {
        self.stats.to_stats()
    }

    /// Check (and charge) the limits governing one request.
    pub async fn check_rate_limit(
        &self,
        client_id: &str,
        path: &str,
        method: Option<&str>,
        client_type: ClientType,
    ) -> RateLimitResult {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);
        let now = now_ms();
        let now_secs = now / 1000;

        if client_type.bypasses_limits() {
            self.stats.bypassed.fetch_add(1, Ordering::Relaxed);
            return RateLimitResult::bypass(now_secs);
        }

        let rules = self.rules.load_full();
        let config = rules.resolve(path, method, client_type).clone();
        let granularities = config.granularities();
        if granularities.is_empty() {
            self.stats.allowed.fetch_add(1, Ordering::Relaxed);
            return RateLimitResult::unlimited(now_secs);
        }

        let mut binding: Option<(Granularity, GranularityDecision)> = None;
        for (granularity, limit) in granularities {
            self.record_index(client_id, path, granularity, now).await;

            let decision = match self
                .check_granularity(&config, client_id, path, granularity, limit, now)
                .await
            {
                Ok(decision) => decision,
                Err(err) => {
                    // Residual bookkeeping failure: fail open rather than
                    // deny live traffic over a counter.
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        client = client_id,
                        path,
                        granularity = granularity.as_str(),
                        error = %err,
                        "rate limit check failed, failing open"
                    );
                    continue;
                }
            };

            if !decision.allowed {
                self.stats.denied.fetch_add(1, Ordering::Relaxed);
                let retry_after = decision
                    .reset_time_ms
                    .saturating_sub(now)
                    .div_ceil(1000)
                    .max(1);
                debug!(
                    client = client_id,
                    path,
                    granularity = granularity.as_str(),
                    usage = decision.current_usage,
                    limit = decision.limit,
                    retry_after,
                    "rate limit exceeded"
                );
                return RateLimitResult {
                    allowed: false,
                    current_usage: decision.current_usage,
                    limit: decision.limit,
                    remaining: 0,
                    reset_time: decision.reset_time_ms.div_ceil(1000),
                    retry_after: Some(retry_after),
                    limit_type: granularity.into(),
                };
            }

            // The binding constraint is the granularity with the least room.
            let tighter = match &binding {
                Some((_, current)) => decision.remaining < current.remaining,
                None => true,
            };
            if tighter {
                binding = Some((granularity, decision));
            }
        }

        self.stats.allowed.fetch_add(1, Ordering::Relaxed);
        match binding {
            Some((granularity, decision)) => RateLimitResult {
                allowed: true,
                current_usage: decision.current_usage,
                limit: decision.limit,
                remaining: decision.remaining,
                reset_time: decision.reset_time_ms.div_ceil(1000),
                retry_after: None,
                limit_type: granularity.into(),
            },
            None => RateLimitResult::unlimited(now_secs),
        }
    }

    /// Usage across all counters a client has touched.
    pub async fn get_client_stats(&self, client_id: &str) -> Result<Vec<ClientUsage>> {
        let now = now_ms();
        let rules = self.rules.load_full();
        let index = self.store.hash_get_all(&StoreKey::client_index(client_id)).await?;

        let mut usage = Vec::with_capacity(index.len());
        for field in index.keys() {
            let Some((path, granularity)) = parse_index_field(field) else {
                continue;
            };
            let config = rules.resolve(&path, None, ClientType::External);
            let Some(limit) = config.limit_for(granularity) else {
                continue;
            };
            let capacity = config.bucket_capacity(granularity, limit);
            let current_usage = algorithms::read_usage(
                &self.store,
                config.algorithm,
                client_id,
                &path,
                granularity,
                capacity,
                now,
            )
            .await
            .unwrap_or(0);
            usage.push(ClientUsage {
                path,
                granularity,
                current_usage,
                limit: limit as u64,
            });
        }
        usage.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(usage)
    }

    /// Clear a client's counters, optionally scoped to one path. Returns
    /// the number of counters cleared.
    pub async fn reset_client_limits(&self, client_id: &str, path: Option<&str>) -> Result<u64> {
        let now = now_ms();
        let index_key = StoreKey::client_index(client_id);
        let index = self.store.hash_get_all(&index_key).await?;

        let mut cleared = 0;
        for field in index.keys() {
            let Some((entry_path, granularity)) = parse_index_field(field) else {
                continue;
            };
            if let Some(scope) = path {
                if entry_path != scope {
                    continue;
                }
            }

            let counter = StoreKey::rate_counter(client_id, &entry_path, granularity.as_str());
            if self.store.delete(&counter).await? {
                cleared += 1;
            }
            // Fixed window counters live under the aligned-window key.
            let window_ms = granularity.window().as_millis() as u64;
            let window_start = now - (now % window_ms);
            let window_key =
                StoreKey::rate_window(client_id, &entry_path, granularity.as_str(), window_start);
            if self.store.delete(&window_key).await? {
                cleared += 1;
            }
            self.store.hash_delete(&index_key, field).await?;
        }

        if path.is_none() {
            self.store.delete(&index_key).await?;
        }
        debug!(client = client_id, ?path, cleared, "reset client rate limits");
        Ok(cleared)
    }

    async fn check_granularity(
        &self,
        config: &RateLimitConfig,
        client_id: &str,
        path: &str,
        granularity: Granularity,
        limit: u32,
        now: u64,
    ) -> Result<GranularityDecision> {
        match config.algorithm {
            RateLimitAlgorithm::SlidingWindow => {
                algorithms::sliding_window(&self.store, client_id, path, granularity, limit, now).await
            }
            RateLimitAlgorithm::TokenBucket => {
                let capacity = config.bucket_capacity(granularity, limit);
                algorithms::token_bucket(
                    &self.store,
                    client_id,
                    path,
                    granularity,
                    limit,
                    capacity,
                    now,
                )
                .await
            }
            RateLimitAlgorithm::FixedWindow => {
                algorithms::fixed_window(&self.store, client_id, path, granularity, limit, now).await
            }
        }
    }

    /// Best-effort record of a touched counter in the client's index hash,
    /// so admin operations can enumerate keys without a store scan.
    async fn record_index(&self, client_id: &str, path: &str, granularity: Granularity, now: u64) {
        let key = StoreKey::client_index(client_id);
        let field = format!("{}|{}", path, granularity.as_str());
        if let Err(err) = self.store.hash_set(&key, &field, now.to_string().as_bytes()).await {
            debug!(client = client_id, error = %err, "failed to record client index entry");
            return;
        }
        let _ = self.store.expire(&key, INDEX_TTL).await;
    }
}

fn parse_index_field(field: &str) -> Option<(String, Granularity)> {
    let (path, granularity) = field.rsplit_once('|')?;
    Some((path.to_string(), Granularity::parse(granularity)?))
}
