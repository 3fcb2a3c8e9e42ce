//! Composition root for the resilience core.
//!
//! One explicit [`ResilienceManager`] is constructed at process startup and
//! passed by reference to every consumer; there is no hidden global state.
//! The manager owns the named circuit breakers, the rate limiter and the
//! named backpressure handlers, builds them from [`ResilienceConfig`]
//! defaults plus per-dependency overrides, and exposes the aggregate
//! health/metrics/reset surface that the surrounding web layer serves.

use crate::backpressure::{BackpressureHandler, BackpressureStats, TaskHandle};
use crate::circuit::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
use crate::config::ResilienceConfig;
use crate::rate_limit::{
    ClientType, ClientUsage, RateLimitResult, RateLimiter, RateLimiterStats, RuleSet,
};
use crate::store::{now_ms, MemoryStore, StateStore};
use crate::{DependencyError, Error, ErrorContext, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// How the manager is coordinating state across process instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    /// Operations are reaching the configured shared store.
    Synchronized,
    /// A shared store is configured but currently unreachable; components
    /// are serving non-authoritative process-local state.
    DegradedLocal,
    /// No shared store was configured; state is process-local on purpose.
    LocalOnly,
}

/// Reachability facts about the shared store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub backend: String,
    pub mode: StoreMode,
    pub reachable: bool,
}

/// Overall verdict of a health read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Ok,
    Degraded,
}

/// Condensed per-breaker health: which circuits are limiting traffic and
/// which are running on non-authoritative local state.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub total: usize,
    pub open: Vec<String>,
    pub half_open: Vec<String>,
    pub degraded_local: Vec<String>,
}

/// Rate limiter reachability and op counters.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterHealth {
    pub synchronized: bool,
    pub rules: usize,
    pub stats: RateLimiterStats,
}

/// Aggregate health view consumed by the external health endpoint.
///
/// `status` is `Degraded` while any component is running on local fallback
/// state. An open circuit does not degrade the manager: failing fast is
/// the breaker doing its job, so open circuits are listed but not judged.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub store: StoreStatus,
    pub circuit_breakers: BreakerHealth,
    pub rate_limiter: RateLimiterHealth,
    pub backpressure: Vec<BackpressureStats>,
}

/// Full serializable snapshot for the external metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp_ms: u64,
    pub store: StoreStatus,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    pub rate_limiter: RateLimiterHealth,
    pub backpressure: Vec<BackpressureStats>,
}

/// Builder for [`ResilienceManager`].
pub struct ResilienceManagerBuilder {
    store: Option<Arc<dyn StateStore>>,
    config: ResilienceConfig,
}

impl ResilienceManagerBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            config: ResilienceConfig::default(),
        }
    }

    /// Inject the shared state store client. Without one the manager runs
    /// with process-local state only.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and construct the manager. Rule patterns
    /// are compiled here, so a bad pattern fails construction rather than
    /// the first request.
    pub fn build(self) -> Result<ResilienceManager> {
        let local_only = self.store.is_none();
        let store: Arc<dyn StateStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let rules = RuleSet::new(
            self.config.rate_limit_rules.clone(),
            self.config.rate_limit_default.clone(),
        )?;
        let rate_limiter = RateLimiter::new(rules, store.clone());
        Ok(ResilienceManager {
            config: self.config,
            store,
            local_only,
            breakers: RwLock::new(HashMap::new()),
            rate_limiter,
            handlers: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }
}

impl Default for ResilienceManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns and composes the circuit breakers, the rate limiter and the
/// backpressure handlers of one process instance.
///
/// Named instances are created from configuration at [`initialize`] time
/// and lazily on first request afterwards. Every store-backed component
/// accesses the shared store through its own failover layer, so a store
/// outage degrades state to process-local (visibly, never silently) and
/// recovers on its own once the store answers again.
///
/// [`initialize`]: ResilienceManager::initialize
pub struct ResilienceManager {
    config: ResilienceConfig,
    store: Arc<dyn StateStore>,
    local_only: bool,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    rate_limiter: RateLimiter,
    handlers: RwLock<HashMap<String, Arc<BackpressureHandler>>>,
    initialized: AtomicBool,
    stopped: AtomicBool,
}

impl ResilienceManager {
    pub fn builder() -> ResilienceManagerBuilder {
        ResilienceManagerBuilder::new()
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Probe the shared store and build the named components from
    /// configuration. A store that does not answer is logged and the
    /// manager proceeds in degraded local mode, so the surrounding service
    /// can still start. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_running()?;
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.local_only {
            info!("no shared store configured, running with process-local state only");
        } else {
            match self.store.ping().await {
                Ok(()) => info!(store = self.store.name(), "connected to shared state store"),
                Err(err) => warn!(
                    store = self.store.name(),
                    error = %err,
                    "shared store unreachable at startup, continuing in degraded local mode"
                ),
            }
        }

        for name in self.config.circuit_breakers.keys() {
            self.get_or_create_circuit_breaker(name);
        }
        for name in self.config.backpressure.keys() {
            self.get_or_create_backpressure_handler(name);
        }

        info!(
            circuit_breakers = self.breakers.read().unwrap().len(),
            backpressure_handlers = self.handlers.read().unwrap().len(),
            rate_limit_rules = self.config.rate_limit_rules.len(),
            "resilience manager initialized"
        );
        Ok(())
    }

    /// The breaker for a dependency, created with the configured override
    /// or the defaults on first request.
    pub fn get_or_create_circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(name) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(circuit = name, "creating circuit breaker");
                Arc::new(CircuitBreaker::new(
                    self.config.breaker_config_for(name),
                    self.store.clone(),
                ))
            })
            .clone()
    }

    pub fn get_circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap().get(name).cloned()
    }

    /// The handler for a named resource, as above.
    pub fn get_or_create_backpressure_handler(&self, name: &str) -> Arc<BackpressureHandler> {
        if let Some(handler) = self.handlers.read().unwrap().get(name) {
            return handler.clone();
        }
        let mut handlers = self.handlers.write().unwrap();
        handlers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(handler = name, "creating backpressure handler");
                Arc::new(BackpressureHandler::new(
                    self.config.backpressure_config_for(name),
                ))
            })
            .clone()
    }

    pub fn get_backpressure_handler(&self, name: &str) -> Option<Arc<BackpressureHandler>> {
        self.handlers.read().unwrap().get(name).cloned()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Execute `op` through the named dependency's circuit breaker.
    pub async fn call<T, F, Fut>(&self, breaker_name: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, DependencyError>>,
    {
        self.ensure_running()?;
        self.get_or_create_circuit_breaker(breaker_name).call(op).await
    }

    /// Like [`ResilienceManager::call`], serving `fallback` while the
    /// circuit is open.
    pub async fn call_with_fallback<T, F, Fut, Fb, FbFut>(
        &self,
        breaker_name: &str,
        op: F,
        fallback: Fb,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, DependencyError>>,
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T>>,
    {
        self.ensure_running()?;
        self.get_or_create_circuit_breaker(breaker_name)
            .call_with_fallback(op, fallback)
            .await
    }

    /// Check (and charge) the rate limits governing one request.
    pub async fn check_rate_limit(
        &self,
        client_id: &str,
        path: &str,
        method: Option<&str>,
        client_type: ClientType,
    ) -> RateLimitResult {
        self.rate_limiter
            .check_rate_limit(client_id, path, method, client_type)
            .await
    }

    /// Submit a task to the named resource's backpressure handler. Returns
    /// `None` without blocking when admission is denied or the manager is
    /// shut down.
    pub fn submit_task<T, F>(
        &self,
        handler_name: &str,
        task_id: impl Into<String>,
        task: F,
    ) -> Option<TaskHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        self.get_or_create_backpressure_handler(handler_name)
            .submit_task(task_id, task)
    }

    pub async fn get_client_stats(&self, client_id: &str) -> Result<Vec<ClientUsage>> {
        self.rate_limiter.get_client_stats(client_id).await
    }

    pub async fn reset_client_limits(&self, client_id: &str, path: Option<&str>) -> Result<u64> {
        self.rate_limiter.reset_client_limits(client_id, path).await
    }

    /// Force every known breaker CLOSED. Returns how many were reset;
    /// individual failures are logged, not raised.
    pub async fn reset_all_circuit_breakers(&self) -> usize {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().unwrap().values().cloned().collect();
        let mut reset = 0;
        for breaker in breakers {
            match breaker.reset().await {
                Ok(()) => reset += 1,
                Err(err) => warn!(
                    circuit = breaker.name(),
                    error = %err,
                    "failed to reset circuit breaker"
                ),
            }
        }
        info!(reset, "reset all circuit breakers");
        reset
    }

    /// Live aggregate health view: store reachability plus per-component
    /// key stats.
    pub async fn get_health_status(&self) -> HealthStatus {
        let store = self.store_status().await;
        let snapshots = self.breaker_snapshots().await;

        let mut open = Vec::new();
        let mut half_open = Vec::new();
        let mut degraded_local = Vec::new();
        for snap in &snapshots {
            match snap.state {
                CircuitState::Open => open.push(snap.name.clone()),
                CircuitState::HalfOpen => half_open.push(snap.name.clone()),
                CircuitState::Closed => {}
            }
            if !snap.synchronized {
                degraded_local.push(snap.name.clone());
            }
        }

        let rate_limiter = self.rate_limiter_health();
        let degraded = store.mode == StoreMode::DegradedLocal
            || !degraded_local.is_empty()
            || !rate_limiter.synchronized;

        HealthStatus {
            status: if degraded {
                HealthState::Degraded
            } else {
                HealthState::Ok
            },
            store,
            circuit_breakers: BreakerHealth {
                total: snapshots.len(),
                open,
                half_open,
                degraded_local,
            },
            rate_limiter,
            backpressure: self.backpressure_stats(),
        }
    }

    /// Full serializable snapshot for the external metrics endpoint.
    pub async fn get_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp_ms: now_ms(),
            store: self.store_status().await,
            circuit_breakers: self.breaker_snapshots().await,
            rate_limiter: self.rate_limiter_health(),
            backpressure: self.backpressure_stats(),
        }
    }

    /// Shut down in dependency order: drain the backpressure handlers
    /// first, then release the breakers and the limiter, and finally let
    /// the store handle go when the manager drops. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers: Vec<Arc<BackpressureHandler>> =
            self.handlers.read().unwrap().values().cloned().collect();
        join_all(handlers.iter().map(|h| h.shutdown())).await;
        self.handlers.write().unwrap().clear();
        self.breakers.write().unwrap().clear();
        info!(drained_handlers = handlers.len(), "resilience manager shut down");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::validation_with_context(
                "resilience manager is shut down",
                ErrorContext::new().with_source("resilience_manager"),
            ));
        }
        Ok(())
    }

    async fn store_status(&self) -> StoreStatus {
        let reachable = self.store.ping().await.is_ok();
        let mode = if self.local_only {
            StoreMode::LocalOnly
        } else if reachable {
            StoreMode::Synchronized
        } else {
            StoreMode::DegradedLocal
        };
        StoreStatus {
            backend: self.store.name().to_string(),
            mode,
            reachable,
        }
    }

    async fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().unwrap().values().cloned().collect();
        let mut snapshots = join_all(breakers.iter().map(|b| b.snapshot())).await;
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    fn rate_limiter_health(&self) -> RateLimiterHealth {
        RateLimiterHealth {
            synchronized: self.rate_limiter.is_synchronized(),
            rules: self.config.rate_limit_rules.len(),
            stats: self.rate_limiter.stats(),
        }
    }

    fn backpressure_stats(&self) -> Vec<BackpressureStats> {
        let mut stats: Vec<BackpressureStats> = self
            .handlers
            .read()
            .unwrap()
            .values()
            .map(|h| h.stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressureConfig;
    use crate::circuit::CircuitBreakerConfig;
    use crate::rate_limit::RateLimitConfig;
    use std::time::Duration;

    fn manager(config: ResilienceConfig) -> ResilienceManager {
        ResilienceManager::builder().with_config(config).build().unwrap()
    }

    fn failing() -> std::result::Result<(), DependencyError> {
        Err(DependencyError::unavailable("503"))
    }

    #[tokio::test]
    async fn test_initialize_builds_named_instances() {
        let mgr = manager(
            ResilienceConfig::new()
                .with_circuit_breaker("pms", CircuitBreakerConfig::default())
                .with_backpressure("tts", BackpressureConfig::default()),
        );
        assert!(mgr.get_circuit_breaker("pms").is_none());

        mgr.initialize().await.unwrap();
        assert!(mgr.get_circuit_breaker("pms").is_some());
        assert!(mgr.get_backpressure_handler("tts").is_some());

        // Idempotent.
        mgr.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_instances() {
        let mgr = manager(ResilienceConfig::new());
        let a = mgr.get_or_create_circuit_breaker("asr");
        let b = mgr.get_or_create_circuit_breaker("asr");
        assert!(Arc::ptr_eq(&a, &b));

        let h1 = mgr.get_or_create_backpressure_handler("asr");
        let h2 = mgr.get_or_create_backpressure_handler("asr");
        assert!(Arc::ptr_eq(&h1, &h2));
    }

    #[tokio::test]
    async fn test_named_override_shapes_lazy_breaker() {
        let mgr = manager(ResilienceConfig::new().with_circuit_breaker(
            "pms",
            CircuitBreakerConfig::default().with_failure_threshold(1),
        ));
        let pms = mgr.get_or_create_circuit_breaker("pms");
        assert_eq!(pms.config().failure_threshold, 1);

        // Unnamed dependencies get the defaults.
        let other = mgr.get_or_create_circuit_breaker("tts");
        assert_eq!(other.config().failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_call_routes_through_named_breaker() {
        let mgr = manager(ResilienceConfig::new().with_circuit_breaker(
            "pms",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_secs(60)),
        ));
        mgr.initialize().await.unwrap();

        mgr.call("pms", || async { failing() }).await.unwrap_err();
        let err = mgr
            .call("pms", || async { Ok::<_, DependencyError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));

        // Other breakers are unaffected.
        mgr.call("tts", || async { Ok::<_, DependencyError>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reset_all_restores_traffic() {
        let mgr = manager(ResilienceConfig::new().with_circuit_breaker(
            "pms",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_secs(60)),
        ));
        mgr.initialize().await.unwrap();
        mgr.call("pms", || async { failing() }).await.unwrap_err();

        assert_eq!(mgr.reset_all_circuit_breakers().await, 1);
        mgr.call("pms", || async { Ok::<_, DependencyError>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_task_passthrough() {
        let mgr = manager(ResilienceConfig::new());
        let handle = mgr.submit_task("tts", "t1", async { Ok(5) }).unwrap();
        assert_eq!(handle.join().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_check_rate_limit_bypasses_internal() {
        let mgr = manager(
            ResilienceConfig::new()
                .with_rate_limit_default(RateLimitConfig::unlimited().with_requests_per_minute(1)),
        );
        mgr.check_rate_limit("c", "/p", None, ClientType::External).await;
        let denied = mgr.check_rate_limit("c", "/p", None, ClientType::External).await;
        assert!(!denied.allowed);

        let bypass = mgr.check_rate_limit("c", "/p", None, ClientType::Internal).await;
        assert!(bypass.allowed);
    }

    #[tokio::test]
    async fn test_health_reports_open_circuits_without_degrading() {
        let mgr = manager(ResilienceConfig::new().with_circuit_breaker(
            "pms",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_secs(60)),
        ));
        mgr.initialize().await.unwrap();
        mgr.call("pms", || async { failing() }).await.unwrap_err();

        let health = mgr.get_health_status().await;
        assert_eq!(health.status, HealthState::Ok);
        assert_eq!(health.store.mode, StoreMode::LocalOnly);
        assert_eq!(health.circuit_breakers.open, vec!["pms".to_string()]);
        assert!(health.circuit_breakers.degraded_local.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_snapshot_serializes() {
        let mgr = manager(ResilienceConfig::new());
        mgr.initialize().await.unwrap();
        mgr.get_or_create_circuit_breaker("pms");
        mgr.get_or_create_backpressure_handler("tts");

        let metrics = mgr.get_metrics().await;
        let json = serde_json::to_value(&metrics).unwrap();
        assert!(json["timestamp_ms"].as_u64().unwrap() > 0);
        assert_eq!(json["circuit_breakers"][0]["name"], "pms");
        assert_eq!(json["backpressure"][0]["name"], "tts");
    }

    #[tokio::test]
    async fn test_shutdown_is_ordered_and_idempotent() {
        let mgr = manager(ResilienceConfig::new());
        mgr.initialize().await.unwrap();
        let handle = mgr
            .submit_task("tts", "t", async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            })
            .unwrap();
        handle.join().await.unwrap();

        mgr.shutdown().await;
        mgr.shutdown().await;

        let late: Option<TaskHandle<()>> = mgr.submit_task("tts", "late", async { Ok(()) });
        assert!(late.is_none());
        let err = mgr
            .call("pms", || async { Ok::<_, DependencyError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
