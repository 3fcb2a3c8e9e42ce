//! Primary-store failover.
//!
//! Availability is chosen over strict cross-process consistency: when the
//! shared store errors, the component it backs keeps working against a
//! process-local [`MemoryStore`] instead of raising to callers. Recovery is
//! store-wins: once the primary answers again, local divergence is simply
//! no longer read.

use super::backend::{MemoryStore, StateStore, UpdateOutcome};
use super::key::StoreKey;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// A [`StateStore`] that serves a shared primary and transparently degrades
/// to a process-local fallback when the primary errors.
///
/// While degraded, the primary is re-probed with the next real operation
/// once `probe_interval` has elapsed. The local fallback is explicitly
/// non-authoritative; [`FailoverStore::is_synchronized`] feeds the
/// `synchronized` / `degraded_local` flags in status output.
pub struct FailoverStore {
    primary: Arc<dyn StateStore>,
    local: MemoryStore,
    degraded_since: Mutex<Option<Instant>>,
    probe_interval: Duration,
}

impl FailoverStore {
    pub fn new(primary: Arc<dyn StateStore>) -> Self {
        Self {
            primary,
            local: MemoryStore::new(),
            degraded_since: Mutex::new(None),
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// True while operations are reaching the shared primary.
    pub fn is_synchronized(&self) -> bool {
        self.degraded_since.lock().unwrap().is_none()
    }

    fn should_try_primary(&self) -> bool {
        match *self.degraded_since.lock().unwrap() {
            None => true,
            Some(since) => since.elapsed() >= self.probe_interval,
        }
    }

    fn mark_degraded(&self, err: &Error) {
        let mut since = self.degraded_since.lock().unwrap();
        if since.is_none() {
            warn!(
                store = self.primary.name(),
                error = %err,
                "shared store unreachable, degrading to process-local state"
            );
        }
        // Restart the probe clock on every failure, including failed probes.
        *since = Some(Instant::now());
    }

    fn mark_recovered(&self) {
        let mut since = self.degraded_since.lock().unwrap();
        if since.take().is_some() {
            info!(
                store = self.primary.name(),
                "shared store reachable again, local state discarded"
            );
        }
    }
}

macro_rules! failover {
    ($self:ident, $call:ident ( $($arg:expr),* )) => {{
        if $self.should_try_primary() {
            match $self.primary.$call($($arg),*).await {
                Ok(value) => {
                    $self.mark_recovered();
                    return Ok(value);
                }
                Err(err) => $self.mark_degraded(&err),
            }
        }
        $self.local.$call($($arg),*).await
    }};
}

#[async_trait]
impl StateStore for FailoverStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        failover!(self, get(key))
    }

    async fn set(&self, key: &StoreKey, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        failover!(self, set(key, value, ttl))
    }

    async fn delete(&self, key: &StoreKey) -> Result<bool> {
        failover!(self, delete(key))
    }

    async fn incr_by(&self, key: &StoreKey, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        failover!(self, incr_by(key, delta, ttl))
    }

    async fn expire(&self, key: &StoreKey, ttl: Duration) -> Result<bool> {
        failover!(self, expire(key, ttl))
    }

    async fn hash_set(&self, key: &StoreKey, field: &str, value: &[u8]) -> Result<()> {
        failover!(self, hash_set(key, field, value))
    }

    async fn hash_get_all(&self, key: &StoreKey) -> Result<HashMap<String, Vec<u8>>> {
        failover!(self, hash_get_all(key))
    }

    async fn hash_delete(&self, key: &StoreKey, field: &str) -> Result<bool> {
        failover!(self, hash_delete(key, field))
    }

    async fn fetch_update(
        &self,
        key: &StoreKey,
        ttl: Option<Duration>,
        apply: &mut (dyn for<'a> FnMut(Option<&'a [u8]>) -> Option<Vec<u8>> + Send),
    ) -> Result<UpdateOutcome> {
        // Not routed through the macro: `apply` may have been partially run
        // by a failed primary attempt, so the local retry must re-apply it
        // against the local value (captured decision state follows the last
        // application, which is the one that took effect).
        if self.should_try_primary() {
            match self.primary.fetch_update(key, ttl, apply).await {
                Ok(outcome) => {
                    self.mark_recovered();
                    return Ok(outcome);
                }
                Err(err) => self.mark_degraded(&err),
            }
        }
        self.local.fetch_update(key, ttl, apply).await
    }

    async fn ping(&self) -> Result<()> {
        // Health checks want the truth about the primary, never the fallback.
        self.primary.ping().await
    }

    fn name(&self) -> &'static str {
        "failover"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorContext;

    /// A store that always fails, for exercising degradation.
    struct DownStore;

    #[async_trait]
    impl StateStore for DownStore {
        async fn get(&self, _: &StoreKey) -> Result<Option<Vec<u8>>> {
            Err(self.err())
        }
        async fn set(&self, _: &StoreKey, _: &[u8], _: Option<Duration>) -> Result<()> {
            Err(self.err())
        }
        async fn delete(&self, _: &StoreKey) -> Result<bool> {
            Err(self.err())
        }
        async fn incr_by(&self, _: &StoreKey, _: i64, _: Option<Duration>) -> Result<i64> {
            Err(self.err())
        }
        async fn expire(&self, _: &StoreKey, _: Duration) -> Result<bool> {
            Err(self.err())
        }
        async fn hash_set(&self, _: &StoreKey, _: &str, _: &[u8]) -> Result<()> {
            Err(self.err())
        }
        async fn hash_get_all(&self, _: &StoreKey) -> Result<HashMap<String, Vec<u8>>> {
            Err(self.err())
        }
        async fn hash_delete(&self, _: &StoreKey, _: &str) -> Result<bool> {
            Err(self.err())
        }
        async fn fetch_update(
            &self,
            _: &StoreKey,
            _: Option<Duration>,
            _: &mut (dyn for<'a> FnMut(Option<&'a [u8]>) -> Option<Vec<u8>> + Send),
        ) -> Result<UpdateOutcome> {
            Err(self.err())
        }
        async fn ping(&self) -> Result<()> {
            Err(self.err())
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    impl DownStore {
        fn err(&self) -> Error {
            Error::store_with_context("connection refused", ErrorContext::new().with_source("down"))
        }
    }

    #[tokio::test]
    async fn test_serves_primary_when_healthy() {
        let primary = Arc::new(MemoryStore::new());
        let failover = FailoverStore::new(primary.clone());

        let key = StoreKey::new("k");
        failover.set(&key, b"v", None).await.unwrap();
        assert!(failover.is_synchronized());
        assert_eq!(primary.get(&key).await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_degrades_to_local_on_primary_error() {
        let failover = FailoverStore::new(Arc::new(DownStore));
        let key = StoreKey::new("k");

        failover.set(&key, b"v", None).await.unwrap();
        assert!(!failover.is_synchronized());
        assert_eq!(failover.get(&key).await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_does_not_hammer_a_down_primary() {
        let failover =
            FailoverStore::new(Arc::new(DownStore)).with_probe_interval(Duration::from_secs(60));
        let key = StoreKey::new("k");

        failover.set(&key, b"v", None).await.unwrap();
        // Within the probe interval the primary is left alone; local serves.
        assert!(failover.incr_by(&StoreKey::new("c"), 1, None).await.is_ok());
        assert!(!failover.is_synchronized());
    }

    #[tokio::test]
    async fn test_ping_reports_primary_truth() {
        let failover = FailoverStore::new(Arc::new(DownStore));
        assert!(failover.ping().await.is_err());

        let healthy = FailoverStore::new(Arc::new(MemoryStore::new()));
        assert!(healthy.ping().await.is_ok());
    }
}
