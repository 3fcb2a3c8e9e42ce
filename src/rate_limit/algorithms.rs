//! The three throttling algorithms, as pure functions over a store.
//!
//! Every function takes `now_ms` from the caller so window arithmetic is
//! testable with synthetic clocks, and performs its read-modify-write in a
//! single atomic store round trip (`fetch_update` or `incr_by`), never a
//! separate get-then-set.

use super::rules::Granularity;
use crate::store::{StateStore, StoreKey};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Outcome of checking one granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GranularityDecision {
    pub allowed: bool,
    /// Requests charged in the current window, including this one if allowed.
    pub current_usage: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Unix millis when this granularity frees a slot (denied) or fully
    /// resets (allowed).
    pub reset_time_ms: u64,
}

/// Per-key token bucket record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenBucket {
    tokens: f64,
    last_refill_ms: u64,
}

/// Sliding window: keep the set of request timestamps, discard entries
/// older than the window, allow iff the survivors are under the limit,
/// then record the new timestamp. The prune is written back even on
/// denial so the set never grows past `limit`.
pub async fn sliding_window(
    store: &dyn StateStore,
    client_id: &str,
    path: &str,
    granularity: Granularity,
    limit: u32,
    now_ms: u64,
) -> Result<GranularityDecision> {
    let key = StoreKey::rate_counter(client_id, path, granularity.as_str());
    let window = granularity.window();
    let window_ms = window.as_millis() as u64;
    let limit = limit as u64;
    let mut decision = GranularityDecision {
        allowed: false,
        current_usage: 0,
        limit,
        remaining: 0,
        reset_time_ms: now_ms + window_ms,
    };

    store
        .fetch_update(&key, Some(window), &mut |current| {
            let mut stamps: Vec<u64> = current
                .and_then(|bytes| serde_json::from_slice(bytes).ok())
                .unwrap_or_default();
            stamps.retain(|&t| t.saturating_add(window_ms) > now_ms);

            let survivors = stamps.len() as u64;
            if survivors < limit {
                stamps.push(now_ms);
                let oldest = *stamps.first().unwrap_or(&now_ms);
                decision = GranularityDecision {
                    allowed: true,
                    current_usage: survivors + 1,
                    limit,
                    remaining: limit - survivors - 1,
                    reset_time_ms: oldest + window_ms,
                };
            } else {
                let oldest = *stamps.first().unwrap_or(&now_ms);
                decision = GranularityDecision {
                    allowed: false,
                    current_usage: survivors,
                    limit,
                    remaining: 0,
                    reset_time_ms: oldest + window_ms,
                };
            }
            serde_json::to_vec(&stamps).ok()
        })
        .await?;

    Ok(decision)
}

/// Token bucket: `capacity` tokens refilled continuously at `limit` per
/// window; one atomic round trip refills, then withdraws a token iff at
/// least one is available.
pub async fn token_bucket(
    store: &dyn StateStore,
    client_id: &str,
    path: &str,
    granularity: Granularity,
    limit: u32,
    capacity: u32,
    now_ms: u64,
) -> Result<GranularityDecision> {
    let key = StoreKey::rate_counter(client_id, path, granularity.as_str());
    let window = granularity.window();
    let window_ms = window.as_millis() as u64;
    let capacity = capacity.max(1) as f64;
    let rate_per_ms = limit.max(1) as f64 / window_ms as f64;
    let mut decision = GranularityDecision {
        allowed: false,
        current_usage: 0,
        limit: limit as u64,
        remaining: 0,
        reset_time_ms: now_ms,
    };

    store
        .fetch_update(&key, Some(window), &mut |current| {
            let mut bucket: TokenBucket = current
                .and_then(|bytes| serde_json::from_slice(bytes).ok())
                .unwrap_or(TokenBucket {
                    tokens: capacity,
                    last_refill_ms: now_ms,
                });

            let elapsed_ms = now_ms.saturating_sub(bucket.last_refill_ms) as f64;
            bucket.tokens = (bucket.tokens + elapsed_ms * rate_per_ms).min(capacity);
            bucket.last_refill_ms = now_ms;

            let allowed = bucket.tokens >= 1.0;
            if allowed {
                bucket.tokens -= 1.0;
            }
            let used = (capacity - bucket.tokens).ceil().max(0.0) as u64;
            let missing = if allowed { capacity - bucket.tokens } else { 1.0 - bucket.tokens };
            decision = GranularityDecision {
                allowed,
                current_usage: used,
                limit: limit as u64,
                remaining: bucket.tokens.floor().max(0.0) as u64,
                reset_time_ms: now_ms + (missing.max(0.0) / rate_per_ms).ceil() as u64,
            };
            serde_json::to_vec(&bucket).ok()
        })
        .await?;

    Ok(decision)
}

/// Fixed window: one counter per aligned window, bumped atomically; an
/// increment past the limit is rolled back and the request denied.
/// Adjacent windows can jointly admit up to twice the limit at the
/// boundary, which is the accepted cost of the cheap counter.
pub async fn fixed_window(
    store: &dyn StateStore,
    client_id: &str,
    path: &str,
    granularity: Granularity,
    limit: u32,
    now_ms: u64,
) -> Result<GranularityDecision> {
    let window = granularity.window();
    let window_ms = window.as_millis() as u64;
    let window_start = now_ms - (now_ms % window_ms);
    let key = StoreKey::rate_window(client_id, path, granularity.as_str(), window_start);
    let limit = limit as u64;

    let count = store.incr_by(&key, 1, Some(window)).await? as u64;
    if count > limit {
        store.incr_by(&key, -1, None).await?;
        return Ok(GranularityDecision {
            allowed: false,
            current_usage: limit,
            limit,
            remaining: 0,
            reset_time_ms: window_start + window_ms,
        });
    }

    Ok(GranularityDecision {
        allowed: true,
        current_usage: count,
        limit,
        remaining: limit - count,
        reset_time_ms: window_start + window_ms,
    })
}

/// Non-mutating usage read for admin stats.
pub async fn read_usage(
    store: &dyn StateStore,
    algorithm: super::rules::RateLimitAlgorithm,
    client_id: &str,
    path: &str,
    granularity: Granularity,
    capacity: u32,
    now_ms: u64,
) -> Result<u64> {
    use super::rules::RateLimitAlgorithm::*;
    let window_ms = granularity.window().as_millis() as u64;
    match algorithm {
        SlidingWindow => {
            let key = StoreKey::rate_counter(client_id, path, granularity.as_str());
            let stamps: Vec<u64> = store
                .get(&key)
                .await?
                .and_then(|bytes| serde_json::from_slice(&bytes).ok())
                .unwrap_or_default();
            Ok(stamps
                .iter()
                .filter(|&&t| t.saturating_add(window_ms) > now_ms)
                .count() as u64)
        }
        TokenBucket => {
            let key = StoreKey::rate_counter(client_id, path, granularity.as_str());
            let bucket: Option<self::TokenBucket> = store
                .get(&key)
                .await?
                .and_then(|bytes| serde_json::from_slice(&bytes).ok());
            Ok(bucket
                .map(|b| (capacity.max(1) as f64 - b.tokens).ceil().max(0.0) as u64)
                .unwrap_or(0))
        }
        FixedWindow => {
            let window_start = now_ms - (now_ms % window_ms);
            let key = StoreKey::rate_window(client_id, path, granularity.as_str(), window_start);
            let count = store
                .get(&key)
                .await?
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            Ok(count)
        }
    }
}
