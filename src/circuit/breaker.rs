//! Store-synced circuit breaker.

use super::state::{Admission, CircuitBreakerState, CircuitState, Transition};
use crate::config::duration_secs;
use crate::store::{now_ms, FailoverStore, StateStore, StoreKey};
use crate::{DependencyError, Error, FailureKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for one named circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit waits before admitting a probe.
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,
    /// Consecutive successes that close a half-open circuit.
    pub success_threshold: u32,
    /// Deadline applied to every wrapped call.
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
    /// Failure kinds that count toward opening the circuit. Anything
    /// outside this set passes through without touching the counters.
    pub expected_failures: HashSet<FailureKind>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            call_timeout: Duration::from_secs(10),
            expected_failures: Self::default_expected(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The transient kinds counted out of the box. `RateLimited`,
    /// `Protocol` and `Internal` must be opted in per dependency.
    pub fn default_expected() -> HashSet<FailureKind> {
        [
            FailureKind::Connection,
            FailureKind::Timeout,
            FailureKind::Unavailable,
        ]
        .into_iter()
        .collect()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_expected_failures(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.expected_failures = kinds.into_iter().collect();
        self
    }

    /// Add one kind to the expected set.
    pub fn expect_failure(mut self, kind: FailureKind) -> Self {
        self.expected_failures.insert(kind);
        self
    }
}

/// Full breaker state as seen by stats/health consumers.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<u64>,
    pub last_success_time: Option<u64>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    /// Unix millis when the next probe will be admitted, while open.
    pub next_attempt_time: Option<u64>,
    /// False while the breaker is running on non-authoritative local state.
    pub synchronized: bool,
}

/// Wraps calls to a single named dependency with a CLOSED/OPEN/HALF_OPEN
/// state machine persisted in the shared store.
///
/// State reads and writes go through atomic `fetch_update` round trips
/// keyed by breaker name, so every process instance observes a consistent
/// breaker outcome; a store outage degrades the breaker to process-local
/// state rather than failing callers.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    store: FailoverStore,
    key: StoreKey,
    state_ttl: Duration,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, store: Arc<dyn StateStore>) -> Self {
        let key = StoreKey::circuit(&config.name);
        // State must comfortably outlive the recovery window so an open
        // breaker is still open when the next call arrives.
        let state_ttl = Duration::from_secs(
            config
                .recovery_timeout
                .as_secs()
                .saturating_mul(4)
                .max(3600),
        );
        Self {
            config,
            store: FailoverStore::new(store),
            key,
            state_ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// True while breaker state is synchronized through the shared store.
    pub fn is_synchronized(&self) -> bool {
        self.store.is_synchronized()
    }

    /// Execute `op` through the breaker.
    ///
    /// Fails fast with [`Error::CircuitOpen`] while the circuit is open,
    /// classifies the outcome against the expected failure-kind set, and
    /// cancels the call at `call_timeout` (a timeout counts as a failure
    /// of its own kind and surfaces as [`Error::CircuitTimeout`]).
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, DependencyError>>,
    {
        self.admit().await?;
        self.execute(op).await
    }

    /// Like [`CircuitBreaker::call`], but an open circuit invokes
    /// `fallback` and returns its result instead of failing fast.
    pub async fn call_with_fallback<T, F, Fut, Fb, FbFut>(&self, op: F, fallback: Fb) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, DependencyError>>,
        Fb: FnOnce() -> FbFut,
        FbFut: Future<Output = Result<T>>,
    {
        match self.admit().await {
            Ok(()) => self.execute(op).await,
            Err(Error::CircuitOpen { circuit_name, .. }) => {
                debug!(circuit = circuit_name.as_str(), "circuit open, serving fallback");
                fallback().await
            }
            Err(other) => Err(other),
        }
    }

    /// Force the breaker CLOSED with zeroed counters.
    pub async fn reset(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&CircuitBreakerState::default())?;
        self.store.set(&self.key, &bytes, Some(self.state_ttl)).await?;
        info!(circuit = self.config.name.as_str(), "circuit breaker reset to closed");
        Ok(())
    }

    /// Read the full state plus the computed next attempt time.
    pub async fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = match self.store.get(&self.key).await {
            Ok(current) => decode_state(&self.config.name, current.as_deref()),
            Err(err) => {
                warn!(
                    circuit = self.config.name.as_str(),
                    error = %err,
                    "failed to read breaker state for snapshot"
                );
                CircuitBreakerState::default()
            }
        };
        let next_attempt_time = (state.state == CircuitState::Open)
            .then(|| state.next_attempt_time(self.recovery_timeout_ms()));
        CircuitBreakerSnapshot {
            name: self.config.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_time: state.last_failure_time,
            last_success_time: state.last_success_time,
            total_requests: state.total_requests,
            total_failures: state.total_failures,
            total_successes: state.total_successes,
            next_attempt_time,
            synchronized: self.store.is_synchronized(),
        }
    }

    fn recovery_timeout_ms(&self) -> u64 {
        self.config.recovery_timeout.as_millis() as u64
    }

    async fn admit(&self) -> Result<()> {
        let now = now_ms();
        let recovery_ms = self.recovery_timeout_ms();
        let name = self.config.name.clone();
        let mut admission = Admission::Admitted;

        let result = self
            .store
            .fetch_update(&self.key, Some(self.state_ttl), &mut |current| {
                let mut state = decode_state(&name, current);
                admission = state.try_admit(now, recovery_ms);
                match admission {
                    Admission::Denied { .. } => None,
                    _ => serde_json::to_vec(&state).ok(),
                }
            })
            .await;

        if let Err(err) = result {
            // Residual error past the failover layer: admit rather than
            // fail the caller for a bookkeeping problem.
            warn!(circuit = name.as_str(), error = %err, "breaker state update failed, admitting call");
            return Ok(());
        }

        match admission {
            Admission::Denied { next_attempt_time } => Err(Error::CircuitOpen {
                circuit_name: name,
                next_attempt_time,
            }),
            Admission::Probe { transitioned } => {
                if transitioned {
                    info!(circuit = name.as_str(), "circuit half-open, admitting probe");
                }
                Ok(())
            }
            Admission::Admitted => Ok(()),
        }
    }

    async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, DependencyError>>,
    {
        match tokio::time::timeout(self.config.call_timeout, op()).await {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(failure)) => {
                if self.config.expected_failures.contains(&failure.kind) {
                    self.record_failure(failure.kind).await;
                } else {
                    debug!(
                        circuit = self.config.name.as_str(),
                        kind = failure.kind.as_str(),
                        "unexpected failure kind passed through without counting"
                    );
                }
                Err(Error::Dependency(failure))
            }
            Err(_elapsed) => {
                // The in-flight future is dropped here; its cancellation is
                // what the caller observes as the timeout.
                self.record_failure(FailureKind::Timeout).await;
                Err(Error::CircuitTimeout {
                    circuit_name: self.config.name.clone(),
                    timeout_ms: self.config.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn record_success(&self) {
        let now = now_ms();
        let threshold = self.config.success_threshold;
        let name = self.config.name.clone();
        let mut transition = None;

        let result = self
            .store
            .fetch_update(&self.key, Some(self.state_ttl), &mut |current| {
                let mut state = decode_state(&name, current);
                transition = state.record_success(now, threshold);
                serde_json::to_vec(&state).ok()
            })
            .await;

        if let Err(err) = result {
            warn!(circuit = name.as_str(), error = %err, "failed to record breaker success");
        }
        if transition == Some(Transition::Closed) {
            info!(circuit = name.as_str(), "circuit closed after successful probes");
        }
    }

    async fn record_failure(&self, kind: FailureKind) {
        let now = now_ms();
        let threshold = self.config.failure_threshold;
        let name = self.config.name.clone();
        let mut transition = None;
        let mut failures = 0;

        let result = self
            .store
            .fetch_update(&self.key, Some(self.state_ttl), &mut |current| {
                let mut state = decode_state(&name, current);
                transition = state.record_failure(now, threshold);
                failures = state.failure_count;
                serde_json::to_vec(&state).ok()
            })
            .await;

        if let Err(err) = result {
            warn!(circuit = name.as_str(), error = %err, "failed to record breaker failure");
        }
        match transition {
            Some(Transition::Opened) => warn!(
                circuit = name.as_str(),
                kind = kind.as_str(),
                failures,
                threshold,
                recovery_timeout_secs = self.config.recovery_timeout.as_secs(),
                "circuit opened due to repeated failures"
            ),
            _ => debug!(
                circuit = name.as_str(),
                kind = kind.as_str(),
                failures,
                threshold,
                "recorded dependency failure"
            ),
        }
    }
}

fn decode_state(name: &str, bytes: Option<&[u8]>) -> CircuitBreakerState {
    match bytes {
        Some(raw) => serde_json::from_slice(raw).unwrap_or_else(|err| {
            debug!(circuit = name, error = %err, "corrupt breaker state record, starting fresh");
            CircuitBreakerState::default()
        }),
        None => CircuitBreakerState::default(),
    }
}
